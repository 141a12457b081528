use crate::error::Result;
use crate::experiment_manager::{ExperimentManager, SimulationChannel};
use crate::monitoring::performance::{
    sysinfo_sampler_factory, PerformanceHandle, PerformanceMonitor, SamplerFactory,
};
use crate::monitoring::progress::{ProgressHandle, ProgressMonitor, DEFAULT_PROGRESS_INTERVAL};
use crate::monitoring::SimulationReporter;
use crate::runtime::scripts::{Script, ScriptRunner};
use crate::storage_manager::StorageManager;
use crate::types::{SimulationRunResult, SimulationTask};
use crate::workdir::{ExperimentDir, SimulationDir};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Runs one simulation task from input materialisation to result submission.
pub struct SimulationPipeline {
    experiment_manager: Arc<ExperimentManager>,
    storage_manager: Arc<StorageManager>,
    monitoring_interval: Duration,
    progress_interval: Duration,
    sampler_factory: SamplerFactory,
}

impl SimulationPipeline {
    pub fn new(
        experiment_manager: Arc<ExperimentManager>,
        storage_manager: Arc<StorageManager>,
        monitoring_interval: Duration,
    ) -> Self {
        Self {
            experiment_manager,
            storage_manager,
            monitoring_interval,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            sampler_factory: sysinfo_sampler_factory(),
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_sampler_factory(mut self, factory: SamplerFactory) -> Self {
        self.sampler_factory = factory;
        self
    }

    pub async fn run(&self, experiment: &ExperimentDir, task: &SimulationTask) -> Result<()> {
        let index = task.simulation_index;
        info!("Simulation index: {}", index);
        info!(
            "Simulation execution constraints: {}",
            task.execution_constraints
        );

        let runner = ScriptRunner::new(experiment.code_base());
        let dir = experiment.simulation(index);
        dir.create().await?;
        tokio::fs::write(dir.input(), serde_json::to_vec(&task.input_parameters)?).await?;

        if runner.exists(Script::InputWriter).await {
            runner.run(Script::InputWriter, &dir).await?;
        }

        let reporter: Arc<dyn SimulationReporter> = Arc::new(SimulationChannel::new(
            self.experiment_manager.clone(),
            &task.experiment_id,
            index,
        ));

        let mut progress = ProgressMonitor::new(
            runner.clone(),
            dir.clone(),
            reporter.clone(),
            self.progress_interval,
        )
        .start();

        let executed = self.execute(&runner, &dir, reporter, &mut progress).await;
        let stopped = progress.stop().await;
        executed?;
        stopped?;

        if runner.exists(Script::OutputReader).await {
            runner.run(Script::OutputReader, &dir).await?;
        }

        let submission = SimulationRunResult::read_from(&dir.output())
            .await
            .into_submission();
        info!(
            "Results: status={} reason={:?} result={}",
            submission.status.as_str(),
            submission.reason,
            submission.result
        );

        self.experiment_manager
            .mark_as_complete(&task.experiment_id, index, &submission)
            .await
            .inspect_err(|e| error!("Error during marking simulation run as complete: {}", e))?;

        self.upload_artifacts(task, &dir).await;

        tokio::spawn(async move {
            if let Err(e) = dir.remove().await {
                warn!("Could not remove {}: {}", dir.path().display(), e);
            }
        });

        Ok(())
    }

    async fn execute(
        &self,
        runner: &ScriptRunner,
        dir: &SimulationDir,
        reporter: Arc<dyn SimulationReporter>,
        progress: &mut ProgressHandle,
    ) -> Result<()> {
        let mut child = runner.spawn(Script::Executor, dir).await?;

        let performance = match child.id() {
            Some(pid) => PerformanceMonitor::new(self.monitoring_interval, (self.sampler_factory)())
                .start(pid, reporter),
            None => PerformanceHandle::idle(),
        };

        let status = tokio::select! {
            status = child.wait() => status,
            err = progress.failed() => {
                warn!("Progress monitoring failed, killing executor");
                if let Err(e) = child.kill().await {
                    warn!("Could not kill executor: {}", e);
                }
                performance.stop().await;
                return Err(err);
            }
        };

        performance.stop().await;
        runner.check_exit(Script::Executor, status?, dir).await
    }

    /// Best-effort uploads of the binary output and the stdout capture.
    async fn upload_artifacts(&self, task: &SimulationTask, dir: &SimulationDir) {
        let archive = dir.output_archive();
        if tokio::fs::metadata(&archive).await.is_ok() {
            match self
                .storage_manager
                .upload_output(&task.experiment_id, task.simulation_index, &archive)
                .await
            {
                Ok(status) => info!("'output.tar.gz' upload finished with status {}", status),
                Err(e) => warn!("Could not upload 'output.tar.gz': {}", e),
            }
        }

        let log = dir.stdout_log();
        if tokio::fs::metadata(&log).await.is_ok() {
            info!("Uploading STDOUT of the simulation run ...");
            match self
                .storage_manager
                .upload_stdout(&task.experiment_id, task.simulation_index, &log)
                .await
            {
                Ok(status) => info!("STDOUT upload finished with status {}", status),
                Err(e) => warn!("Could not upload STDOUT: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::runtime::scripts::testing::write_script;
    use crate::transport::testing::{client, FakeTransport};
    use crate::transport::{RequestBody, ServiceEndpointSet};
    use crate::workdir::WorkDir;
    use serde_json::{json, Map, Value};

    struct Fixture {
        _root: tempfile::TempDir,
        transport: Arc<FakeTransport>,
        experiment: ExperimentDir,
        pipeline: SimulationPipeline,
    }

    fn fixture(transport: FakeTransport) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let experiment = WorkDir::new(root.path()).experiment("e1");
        std::fs::create_dir_all(experiment.code_base()).unwrap();

        let transport = Arc::new(transport);
        let retry = Arc::new(client(transport.clone()));
        let em = Arc::new(ExperimentManager::new(
            retry.clone(),
            ServiceEndpointSet::single("em.local"),
            Duration::from_secs(1),
        ));
        let sm = Arc::new(StorageManager::new(
            retry,
            ServiceEndpointSet::single("sm.local"),
            Duration::from_secs(1),
        ));
        let pipeline = SimulationPipeline::new(em, sm, Duration::ZERO)
            .with_progress_interval(Duration::from_millis(20));

        Fixture {
            _root: root,
            transport,
            experiment,
            pipeline,
        }
    }

    fn ok_transport() -> FakeTransport {
        FakeTransport::new()
            .json("mark_as_complete", 200, r#"{"status":"ok"}"#)
            .json("progress_info", 200, r#"{"status":"ok"}"#)
            .json("sm.local", 200, "{}")
    }

    fn task(params: Value) -> SimulationTask {
        let input_parameters: Map<String, Value> = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        SimulationTask {
            experiment_id: "e1".to_string(),
            simulation_index: 1,
            input_parameters,
            execution_constraints: Value::Null,
        }
    }

    fn form_body(transport: &FakeTransport, fragment: &str) -> Vec<(String, String)> {
        match &transport.calls_to(fragment)[0].body {
            Some(RequestBody::Bytes { data, .. }) => url::form_urlencoded::parse(data)
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    fn field<'a>(fields: &'a [(String, String)], name: &str) -> &'a str {
        fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_successful_run_submits_results_and_uploads_stdout() {
        let f = fixture(ok_transport());
        let code_base = f.experiment.code_base();
        write_script(&code_base, "input_writer", r#"cp "$1" params.json"#);
        write_script(
            &code_base,
            "executor",
            r#"echo executing; echo '{"status":"ok","results":{"product":20}}' > output.json; echo data > output.tar.gz"#,
        );

        f.pipeline
            .run(&f.experiment, &task(json!({"parameter1": 10.0, "parameter2": 2.0})))
            .await
            .unwrap();

        let fields = form_body(&f.transport, "experiments/e1/simulations/1/mark_as_complete");
        assert_eq!(field(&fields, "status"), "ok");
        assert_eq!(field(&fields, "result"), r#"{"product":20}"#);

        assert_eq!(f.transport.calls_to("sm.local/experiments/e1/simulations/1/stdout").len(), 1);
        let uploads = f.transport.calls_to("sm.local/experiments/e1/simulations/1");
        assert_eq!(uploads.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_output_reports_error() {
        let f = fixture(ok_transport());
        write_script(&f.experiment.code_base(), "executor", "true");

        f.pipeline.run(&f.experiment, &task(json!({}))).await.unwrap();

        let fields = form_body(&f.transport, "mark_as_complete");
        assert_eq!(field(&fields, "status"), "error");
        assert!(field(&fields, "reason").contains("output.json"));
        assert_eq!(field(&fields, "result"), "null");
    }

    #[tokio::test]
    async fn test_invalid_results_are_replaced() {
        let f = fixture(ok_transport());
        write_script(
            &f.experiment.code_base(),
            "executor",
            r#"echo '{"status":"ok"}' > output.json"#,
        );

        f.pipeline.run(&f.experiment, &task(json!({}))).await.unwrap();

        let fields = form_body(&f.transport, "mark_as_complete");
        assert_eq!(field(&fields, "status"), "error");
        assert!(field(&fields, "reason").starts_with("Invalid results"));
        assert_eq!(field(&fields, "result"), "");
    }

    #[tokio::test]
    async fn test_output_reader_produces_output() {
        let f = fixture(ok_transport());
        let code_base = f.experiment.code_base();
        write_script(&code_base, "executor", "echo 42 > raw.txt");
        write_script(
            &code_base,
            "output_reader",
            r#"echo "{\"status\":\"ok\",\"results\":{\"value\":$(cat raw.txt)}}" > output.json"#,
        );

        f.pipeline.run(&f.experiment, &task(json!({}))).await.unwrap();

        let fields = form_body(&f.transport, "mark_as_complete");
        assert_eq!(field(&fields, "result"), r#"{"value":42}"#);
    }

    #[tokio::test]
    async fn test_executor_failure_is_fatal_and_nothing_is_submitted() {
        let f = fixture(ok_transport());
        write_script(&f.experiment.code_base(), "executor", "echo failing; exit 2");

        let err = f
            .pipeline
            .run(&f.experiment, &task(json!({})))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ScriptFailed { .. }));
        assert_eq!(err.log_tail(), Some("failing"));
        assert!(f.transport.calls_to("mark_as_complete").is_empty());
    }

    #[tokio::test]
    async fn test_mark_as_complete_rejection_is_fatal() {
        let f = fixture(
            FakeTransport::new()
                .json("mark_as_complete", 200, r#"{"status":"error","reason":"nope"}"#)
                .json("sm.local", 200, "{}"),
        );
        write_script(
            &f.experiment.code_base(),
            "executor",
            r#"echo '{"status":"ok","results":1}' > output.json"#,
        );

        let err = f
            .pipeline
            .run(&f.experiment, &task(json!({})))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Rejected(_)));
    }

    #[tokio::test]
    async fn test_failed_upload_does_not_abort_the_task() {
        let f = fixture(FakeTransport::new().json("mark_as_complete", 200, r#"{"status":"ok"}"#));
        write_script(
            &f.experiment.code_base(),
            "executor",
            r#"echo '{"status":"ok","results":1}' > output.json"#,
        );

        let outcome = tokio::time::timeout(
            Duration::from_secs(30),
            f.pipeline.run(&f.experiment, &task(json!({}))),
        )
        .await
        .unwrap();

        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn test_progress_monitor_failure_kills_executor() {
        let f = fixture(ok_transport());
        let code_base = f.experiment.code_base();
        write_script(&code_base, "executor", "sleep 30");
        write_script(&code_base, "progress_monitor", "exit 1");

        let err = tokio::time::timeout(
            Duration::from_secs(10),
            f.pipeline.run(&f.experiment, &task(json!({}))),
        )
        .await
        .unwrap()
        .unwrap_err();

        match err {
            Error::ScriptFailed { script, .. } => assert_eq!(script, "progress_monitor"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_input_json_is_written() {
        let f = fixture(ok_transport());
        write_script(
            &f.experiment.code_base(),
            "executor",
            r#"cp input.json ../seen_input.json; echo '{"status":"ok","results":1}' > output.json"#,
        );

        f.pipeline
            .run(&f.experiment, &task(json!({"a": 1})))
            .await
            .unwrap();

        let seen = std::fs::read_to_string(f.experiment.path().join("seen_input.json")).unwrap();
        assert_eq!(serde_json::from_str::<Value>(&seen).unwrap(), json!({"a": 1}));
    }
}
