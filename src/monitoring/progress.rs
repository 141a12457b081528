use super::SimulationReporter;
use crate::error::{Error, Result};
use crate::runtime::scripts::{Script, ScriptRunner};
use crate::types::{RunStatus, SimulationRunResult};
use crate::workdir::SimulationDir;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// Periodically runs `progress_monitor` and forwards its intermediate result.
pub struct ProgressMonitor {
    runner: ScriptRunner,
    dir: SimulationDir,
    reporter: Arc<dyn SimulationReporter>,
    interval: Duration,
}

impl ProgressMonitor {
    pub fn new(
        runner: ScriptRunner,
        dir: SimulationDir,
        reporter: Arc<dyn SimulationReporter>,
        interval: Duration,
    ) -> Self {
        Self {
            runner,
            dir,
            reporter,
            interval,
        }
    }

    pub fn start(self) -> ProgressHandle {
        let cancel = CancellationToken::new();
        let (ack_tx, ack_rx) = oneshot::channel();
        let token = cancel.clone();

        tokio::spawn(async move {
            let outcome = self.run(token).await;
            if let Err(e) = &outcome {
                warn!("[progress_info] Progress monitoring failed: {}", e);
            }
            let _ = ack_tx.send(outcome);
        });

        ProgressHandle {
            cancel,
            ack: Some(ack_rx),
        }
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if !self.runner.exists(Script::ProgressMonitor).await {
            info!("[progress_info] There is no progress monitor script");
            return Ok(());
        }

        loop {
            self.runner.run(Script::ProgressMonitor, &self.dir).await?;

            let intermediate = SimulationRunResult::read_from(&self.dir.intermediate_result()).await;
            if intermediate.status == RunStatus::Ok {
                debug!("[progress_info] Results: {:?}", intermediate.results);
                self.reporter.post_progress_info(&intermediate).await?;
            } else {
                debug!("[progress_info] Skipping intermediate result: {}", intermediate.reason);
            }

            tokio::time::sleep(self.interval).await;

            if cancel.is_cancelled() {
                info!("[progress_info] Our work is finished");
                return Ok(());
            }
        }
    }
}

/// Owner side of a running progress monitor.
pub struct ProgressHandle {
    cancel: CancellationToken,
    ack: Option<oneshot::Receiver<Result<()>>>,
}

impl ProgressHandle {
    /// Resolves only if the monitor terminates with an error before being stopped.
    ///
    /// Cancel safe: dropping the future leaves the handle untouched.
    pub async fn failed(&mut self) -> Error {
        if let Some(ack) = self.ack.as_mut() {
            let outcome = flatten(ack.await);
            self.ack = None;
            if let Err(e) = outcome {
                return e;
            }
        }
        std::future::pending().await
    }

    /// Signals cancellation and waits for the monitor to acknowledge it.
    pub async fn stop(mut self) -> Result<()> {
        self.cancel.cancel();
        match self.ack.take() {
            Some(ack) => flatten(ack.await),
            None => Ok(()),
        }
    }
}

fn flatten(received: std::result::Result<Result<()>, oneshot::error::RecvError>) -> Result<()> {
    received.unwrap_or_else(|_| {
        Err(Error::Monitoring(
            "progress monitor terminated without acknowledgment".to_string(),
        ))
    })
}
