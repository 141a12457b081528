use crate::code_base::CodeBaseBootstrap;
use crate::config::SimulationManagerConfig;
use crate::error::{Error, Result};
use crate::experiment_manager::ExperimentManager;
use crate::information_service::InformationService;
use crate::monitoring::progress::DEFAULT_PROGRESS_INTERVAL;
use crate::pipeline::SimulationPipeline;
use crate::storage_manager::StorageManager;
use crate::transport::RetryClient;
use crate::types::{NextSimulation, SimulationTask};
use crate::workdir::WorkDir;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

const EMPTY_EXPERIMENT_COOLDOWN: Duration = Duration::from_secs(30);
const REPEATED_EXPERIMENT_COOLDOWN: Duration = Duration::from_secs(10);

/// Experiment ids already processed during this run.
#[derive(Debug, Default)]
pub struct ExecutedExperimentSet(HashSet<String>);

impl ExecutedExperimentSet {
    /// Records `id`; false when it had already been recorded.
    pub fn record(&mut self, id: &str) -> bool {
        self.0.insert(id.to_string())
    }
}

enum Fetched {
    Task(SimulationTask),
    Wait(Duration),
    Exhausted,
}

/// Top-level worker loop: selects experiments, bootstraps their code base and
/// runs simulations until the work runs out or the limit is hit.
pub struct SimulationManager {
    config: SimulationManagerConfig,
    workdir: WorkDir,
    client: Arc<RetryClient>,
    simulations_limit: Option<u32>,
    bootstrap: CodeBaseBootstrap,
    progress_interval: Duration,
    empty_experiment_cooldown: Duration,
    repeated_experiment_cooldown: Duration,
}

impl SimulationManager {
    pub fn new(config: SimulationManagerConfig, workdir: WorkDir, client: Arc<RetryClient>) -> Self {
        let simulations_limit = config.simulations_limit();
        let bootstrap = CodeBaseBootstrap::new(crate::code_base::DEFAULT_ATTEMPTS, config.cooldown());

        Self {
            config,
            workdir,
            client,
            simulations_limit,
            bootstrap,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            empty_experiment_cooldown: EMPTY_EXPERIMENT_COOLDOWN,
            repeated_experiment_cooldown: REPEATED_EXPERIMENT_COOLDOWN,
        }
    }

    pub fn from_config(config: SimulationManagerConfig, workdir: WorkDir) -> Result<Self> {
        let client = Arc::new(RetryClient::from_config(&config)?);
        Ok(Self::new(config, workdir, client))
    }

    pub fn with_simulations_limit(mut self, limit: Option<u32>) -> Self {
        self.simulations_limit = limit.filter(|l| *l > 0);
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: CodeBaseBootstrap) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_selection_cooldowns(mut self, empty: Duration, repeated: Duration) -> Self {
        self.empty_experiment_cooldown = empty;
        self.repeated_experiment_cooldown = repeated;
        self
    }

    /// Runs until single-experiment work is exhausted (`Ok`) or a fatal error,
    /// including [`Error::LimitReached`], stops the agent.
    pub async fn run(&self) -> Result<()> {
        if let Some(limit) = self.simulations_limit {
            info!("Simulations limit set to {}", limit);
        }

        self.wait_for_start().await;

        let timeout = self.config.communication_timeout();
        let information_service = InformationService::new(
            self.client.clone(),
            self.config.information_service_url.clone(),
            timeout,
        );
        let experiment_managers = information_service.get_experiment_managers().await?;
        let storage_managers = information_service.get_storage_managers().await?;

        let experiment_manager = Arc::new(ExperimentManager::new(
            self.client.clone(),
            experiment_managers,
            timeout,
        ));
        let storage_manager = Arc::new(StorageManager::new(
            self.client.clone(),
            storage_managers,
            timeout,
        ));
        let pipeline = SimulationPipeline::new(
            experiment_manager.clone(),
            storage_manager,
            self.config.monitoring_interval(),
        )
        .with_progress_interval(self.progress_interval);

        let mut executed = ExecutedExperimentSet::default();
        let mut simulations_done: u32 = 0;

        loop {
            let (experiment_id, single_experiment) = match self.config.fixed_experiment_id() {
                Some(id) => (id.to_string(), true),
                None => (
                    self.select_random_experiment(&experiment_manager, &mut executed)
                        .await?,
                    false,
                ),
            };
            info!("Working on experiment {}", experiment_id);

            let experiment = self.workdir.experiment(&experiment_id);
            experiment.create().await?;
            self.bootstrap
                .ensure(experiment_manager.as_ref(), &experiment, &experiment_id)
                .await?;

            loop {
                let task = match self.fetch_next(&experiment_manager, &experiment_id).await? {
                    Fetched::Task(task) => task,
                    Fetched::Wait(duration) => {
                        tokio::time::sleep(duration).await;
                        continue;
                    }
                    Fetched::Exhausted => break,
                };

                pipeline.run(&experiment, &task).await?;
                simulations_done += 1;

                if let Some(limit) = self.simulations_limit {
                    info!("Simulations done: {}/{}", simulations_done, limit);
                    if simulations_done >= limit {
                        info!("Exiting due to simulation runs limit ({})", limit);
                        return Err(Error::LimitReached(limit));
                    }
                }
            }

            info!("Couldn't get simulation to run");
            if single_experiment {
                info!("That was single experiment run -> finishing work.");
                return Ok(());
            }
            info!("Will try another experiment");
        }
    }

    async fn wait_for_start(&self) {
        match self.config.start_at() {
            None => {}
            Some(Err(e)) => warn!("Ignoring start_at '{}': {}", self.config.start_at, e),
            Some(Ok(start)) => {
                if let Ok(wait) = (start - Utc::now()).to_std() {
                    info!("We have start_at provided, waiting {:?}", wait);
                    tokio::time::sleep(wait).await;
                }
                info!("We are ready to work");
            }
        }
    }

    async fn select_random_experiment(
        &self,
        experiment_manager: &ExperimentManager,
        executed: &mut ExecutedExperimentSet,
    ) -> Result<String> {
        loop {
            let id = experiment_manager.random_experiment_id().await?;

            if id.is_empty() {
                info!(
                    "Random experiment id empty, waiting {:?} to try again",
                    self.empty_experiment_cooldown
                );
                tokio::time::sleep(self.empty_experiment_cooldown).await;
            } else if !executed.record(&id) {
                info!(
                    "Experiment {} was already executed, waiting {:?} to get other id",
                    id, self.repeated_experiment_cooldown
                );
                tokio::time::sleep(self.repeated_experiment_cooldown).await;
            } else {
                return Ok(id);
            }
        }
    }

    /// Polls `next_simulation` within the fetch budget.
    async fn fetch_next(
        &self,
        experiment_manager: &ExperimentManager,
        experiment_id: &str,
    ) -> Result<Fetched> {
        let started = Instant::now();
        let budget = experiment_manager.fetch_budget();

        while started.elapsed() < budget {
            info!("Getting next simulation run ...");

            match experiment_manager.next_simulation(experiment_id).await? {
                NextSimulation::Ready(task) => return Ok(Fetched::Task(task)),
                NextSimulation::Wait(duration) => {
                    info!(
                        "There is no more simulations to run in this experiment at the moment, time to wait: {:?}",
                        duration
                    );
                    return Ok(Fetched::Wait(duration));
                }
                NextSimulation::AllSent => {
                    info!("There is no more simulations to run in this experiment.")
                }
                NextSimulation::Error(reason) => warn!(
                    "An error occurred while getting next simulation: {}",
                    reason.unwrap_or_default()
                ),
                NextSimulation::Unsupported(status) => {
                    warn!("We cannot continue due to unsupported status: {}", status)
                }
            }

            tokio::time::sleep(self.config.cooldown()).await;
        }

        Ok(Fetched::Exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::scripts::testing::write_script;
    use crate::transport::testing::{client, FakeTransport};
    use crate::transport::RawResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> SimulationManagerConfig {
        SimulationManagerConfig {
            information_service_url: "is.local".to_string(),
            development: true,
            timeout: 1,
            cooldown_interval: 1,
            ..Default::default()
        }
    }

    fn sequence(bodies: &'static [&'static str]) -> impl Fn(&crate::transport::PreparedRequest) -> Result<RawResponse> {
        let calls = AtomicUsize::new(0);
        move |_: &crate::transport::PreparedRequest| {
            let i = calls.fetch_add(1, Ordering::SeqCst).min(bodies.len() - 1);
            Ok(RawResponse {
                status: 200,
                body: bodies[i].as_bytes().to_vec(),
            })
        }
    }

    fn directory(transport: FakeTransport) -> FakeTransport {
        transport
            .json("is.local/experiment_managers", 200, r#"["em.local"]"#)
            .json("is.local/storage_managers", 200, r#"["sm.local"]"#)
            .json("mark_as_complete", 200, r#"{"status":"ok"}"#)
            .json("sm.local", 200, "{}")
    }

    const OK_THEN_ALL_SENT: &[&str] = &[
        r#"{"status":"ok","simulation_id":1,"input_parameters":{}}"#,
        r#"{"status":"all_sent"}"#,
    ];

    fn prepare_code_base(root: &std::path::Path, experiment_id: &str) {
        let code_base = WorkDir::new(root).experiment(experiment_id).code_base();
        std::fs::create_dir_all(&code_base).unwrap();
        write_script(
            &code_base,
            "executor",
            r#"echo '{"status":"ok","results":{"done":true}}' > output.json"#,
        );
    }

    fn manager(config: SimulationManagerConfig, root: &std::path::Path, transport: Arc<FakeTransport>) -> SimulationManager {
        SimulationManager::new(config, WorkDir::new(root), Arc::new(client(transport)))
            .with_progress_interval(Duration::from_millis(10))
            .with_selection_cooldowns(Duration::from_millis(10), Duration::from_millis(10))
            .with_bootstrap(CodeBaseBootstrap::new(2, Duration::from_millis(10)))
    }

    #[test]
    fn test_executed_experiment_set() {
        let mut executed = ExecutedExperimentSet::default();
        assert!(executed.record("e1"));
        assert!(!executed.record("e1"));
        assert!(executed.record("e2"));
    }

    #[tokio::test]
    async fn test_single_experiment_finishes_when_work_runs_out() {
        let root = tempfile::tempdir().unwrap();
        prepare_code_base(root.path(), "e1");
        let transport = Arc::new(directory(
            FakeTransport::new().route("experiments/e1/next_simulation", sequence(OK_THEN_ALL_SENT)),
        ));
        let config = SimulationManagerConfig {
            experiment_id: "e1".to_string(),
            ..config()
        };

        manager(config, root.path(), transport.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(transport.calls_to("mark_as_complete").len(), 1);
        assert!(transport.calls_to("random_experiment").is_empty());
    }

    #[tokio::test]
    async fn test_simulations_limit_stops_the_agent() {
        let root = tempfile::tempdir().unwrap();
        prepare_code_base(root.path(), "e1");
        let transport = Arc::new(directory(FakeTransport::new().json(
            "experiments/e1/next_simulation",
            200,
            r#"{"status":"ok","simulation_id":1,"input_parameters":{}}"#,
        )));
        let config = SimulationManagerConfig {
            experiment_id: "e1".to_string(),
            ..config()
        };

        let err = manager(config, root.path(), transport.clone())
            .with_simulations_limit(Some(2))
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, Error::LimitReached(2)));
        assert_eq!(err.exit_code(), crate::error::EXIT_LIMIT_REACHED);
        assert_eq!(transport.calls_to("mark_as_complete").len(), 2);
    }

    #[tokio::test]
    async fn test_random_selection_skips_empty_and_repeated_ids() {
        let root = tempfile::tempdir().unwrap();
        prepare_code_base(root.path(), "e1");
        prepare_code_base(root.path(), "e2");
        let transport = Arc::new(directory(
            FakeTransport::new()
                .route("random_experiment", sequence(&["", "e1", "e1", "e2"]))
                .route("experiments/e1/next_simulation", sequence(OK_THEN_ALL_SENT))
                .route("experiments/e2/next_simulation", sequence(OK_THEN_ALL_SENT)),
        ));

        let err = manager(config(), root.path(), transport.clone())
            .with_simulations_limit(Some(2))
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, Error::LimitReached(2)));
        assert_eq!(transport.calls_to("random_experiment").len(), 4);
        assert_eq!(transport.calls_to("experiments/e1/simulations/1/mark_as_complete").len(), 1);
        assert_eq!(transport.calls_to("experiments/e2/simulations/1/mark_as_complete").len(), 1);
    }

    #[tokio::test]
    async fn test_wait_status_does_not_consume_fetch_budget() {
        let root = tempfile::tempdir().unwrap();
        prepare_code_base(root.path(), "e1");
        let transport = Arc::new(directory(FakeTransport::new().route(
            "experiments/e1/next_simulation",
            sequence(&[
                r#"{"status":"wait","duration_in_seconds":0}"#,
                r#"{"status":"wait","duration_in_seconds":0}"#,
                r#"{"status":"ok","simulation_id":5,"input_parameters":{}}"#,
                r#"{"status":"all_sent"}"#,
            ]),
        )));
        let config = SimulationManagerConfig {
            experiment_id: "e1".to_string(),
            ..config()
        };

        manager(config, root.path(), transport.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(
            transport
                .calls_to("experiments/e1/simulations/5/mark_as_complete")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_missing_experiment_managers_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let transport = Arc::new(
            FakeTransport::new()
                .json("is.local/experiment_managers", 200, "[]")
                .json("is.local/storage_managers", 200, r#"["sm.local"]"#),
        );

        let err = manager(config(), root.path(), transport).run().await.unwrap_err();
        assert!(matches!(err, Error::NoEndpoints(_)));
    }

    #[tokio::test]
    async fn test_code_base_failure_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let transport = Arc::new(directory(
            FakeTransport::new().json("experiments/e9/code_base", 404, ""),
        ));
        let config = SimulationManagerConfig {
            experiment_id: "e9".to_string(),
            ..config()
        };

        let err = manager(config, root.path(), transport.clone())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CodeBase { attempts: 2, .. }));
        assert_eq!(transport.calls_to("experiments/e9/code_base").len(), 2);
        assert!(!WorkDir::new(root.path()).experiment("e9").code_base().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_start_at_does_not_wait() {
        let root = tempfile::tempdir().unwrap();
        let config = SimulationManagerConfig {
            start_at: "2016-01-07T10:00:00Z".to_string(),
            ..config()
        };
        let sim = manager(config, root.path(), Arc::new(FakeTransport::new()));

        let started = Instant::now();
        sim.wait_for_start().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_future_start_at_waits() {
        let root = tempfile::tempdir().unwrap();
        let start = Utc::now() + chrono::Duration::seconds(120);
        let config = SimulationManagerConfig {
            start_at: start.to_rfc3339(),
            ..config()
        };
        let sim = manager(config, root.path(), Arc::new(FakeTransport::new()));

        let started = Instant::now();
        sim.wait_for_start().await;
        assert!(started.elapsed() >= Duration::from_secs(100));
    }
}
