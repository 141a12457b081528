use super::system::{ProcessSampler, SysinfoSampler};
use super::SimulationReporter;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Resource counters of one process at one sampling tick.
///
/// CPU times are cumulative seconds, memory and I/O are bytes and
/// operation counts as reported by the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProcessStatsSnapshot {
    pub timestamp: i64,
    pub utime: f64,
    pub stime: f64,
    pub iowait: f64,
    pub rss: u64,
    pub vms: u64,
    pub swap: u64,
    pub read_count: u64,
    pub write_count: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Sum over every process ever observed in the executor's tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregatedPerformanceStats {
    pub timestamp: i64,
    pub utime: f64,
    pub stime: f64,
    pub iowait: f64,
    pub rss: u64,
    pub vms: u64,
    pub swap: u64,
    pub read_count: u64,
    pub write_count: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub process_count: usize,
}

/// Latest known sample per process id, including processes that already exited.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerformanceStatsMap(BTreeMap<u32, ProcessStatsSnapshot>);

impl PerformanceStatsMap {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessStatsSnapshot> {
        self.0.get(&pid)
    }

    /// Newer samples supersede older ones for the same pid; others are kept.
    pub fn merge(&mut self, tick: impl IntoIterator<Item = (u32, ProcessStatsSnapshot)>) {
        self.0.extend(tick);
    }

    pub fn aggregate(&self) -> AggregatedPerformanceStats {
        self.0.values().fold(
            AggregatedPerformanceStats {
                process_count: self.0.len(),
                ..Default::default()
            },
            |mut acc, s| {
                acc.timestamp = acc.timestamp.max(s.timestamp);
                acc.utime += s.utime;
                acc.stime += s.stime;
                acc.iowait += s.iowait;
                acc.rss += s.rss;
                acc.vms += s.vms;
                acc.swap += s.swap;
                acc.read_count += s.read_count;
                acc.write_count += s.write_count;
                acc.read_bytes += s.read_bytes;
                acc.write_bytes += s.write_bytes;
                acc
            },
        )
    }
}

impl FromIterator<(u32, ProcessStatsSnapshot)> for PerformanceStatsMap {
    fn from_iter<I: IntoIterator<Item = (u32, ProcessStatsSnapshot)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

enum Report {
    Host(super::system::HostInfo),
    Stats(AggregatedPerformanceStats),
}

pub type SamplerFactory = Arc<dyn Fn() -> Box<dyn ProcessSampler> + Send + Sync>;

pub fn sysinfo_sampler_factory() -> SamplerFactory {
    Arc::new(|| Box::new(SysinfoSampler::new()) as Box<dyn ProcessSampler>)
}

/// Samples the executor's process tree while it runs.
pub struct PerformanceMonitor {
    interval: Duration,
    sampler: Box<dyn ProcessSampler>,
}

impl PerformanceMonitor {
    pub fn new(interval: Duration, sampler: Box<dyn ProcessSampler>) -> Self {
        Self { interval, sampler }
    }

    /// Starts sampling `root`. A zero interval disables monitoring.
    pub fn start(
        self,
        root: u32,
        reporter: Arc<dyn SimulationReporter>,
    ) -> PerformanceHandle {
        if self.interval.is_zero() {
            debug!("Performance monitoring disabled");
            return PerformanceHandle::idle();
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let sampler = tokio::spawn(self.sample_loop(root, tx, cancel.clone()));
        let reporter = tokio::spawn(report_loop(rx, reporter));

        PerformanceHandle {
            cancel,
            sampler: Some(sampler),
            reporter: Some(reporter),
        }
    }

    async fn sample_loop(
        mut self,
        root: u32,
        tx: mpsc::UnboundedSender<Report>,
        cancel: CancellationToken,
    ) {
        match self.sampler.host_info() {
            Ok(host_info) => {
                let _ = tx.send(Report::Host(host_info));
            }
            Err(e) => warn!("Could not extract host info - {}", e),
        }

        let mut stats = PerformanceStatsMap::default();

        loop {
            let tree = match self.sampler.live_tree(root) {
                Ok(Some(tree)) => tree,
                Ok(None) => {
                    debug!("Process {} finished, stopping performance monitoring", root);
                    break;
                }
                Err(e) => {
                    warn!("Could not check process {} - {}", root, e);
                    break;
                }
            };

            let mut tick = BTreeMap::new();
            for pid in tree {
                match self.sampler.sample(pid) {
                    Ok(snapshot) => {
                        tick.insert(pid, snapshot);
                    }
                    Err(e) if pid == root => {
                        warn!("Could not extract performance statistics - {}", e);
                        return;
                    }
                    Err(e) => debug!("Skipping process {}: {}", pid, e),
                }
            }

            stats.merge(tick);
            if tx.send(Report::Stats(stats.aggregate())).is_err() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!(
            "Performance monitoring of process {} finished after observing {} process(es)",
            root,
            stats.len()
        );
    }
}

async fn report_loop(mut rx: mpsc::UnboundedReceiver<Report>, reporter: Arc<dyn SimulationReporter>) {
    while let Some(report) = rx.recv().await {
        let result = match &report {
            Report::Host(host_info) => reporter.report_host_info(host_info).await,
            Report::Stats(stats) => reporter.report_performance_stats(stats).await,
        };
        if let Err(e) = result {
            warn!("An error occurred during performance reporting - {}", e);
        }
    }
}

pub struct PerformanceHandle {
    cancel: CancellationToken,
    sampler: Option<JoinHandle<()>>,
    reporter: Option<JoinHandle<()>>,
}

impl PerformanceHandle {
    pub fn idle() -> Self {
        Self {
            cancel: CancellationToken::new(),
            sampler: None,
            reporter: None,
        }
    }

    /// Stops sampling. Reports already queued are still delivered in the background.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(sampler) = self.sampler.take() {
            if let Err(e) = sampler.await {
                warn!("Performance sampler terminated abnormally: {}", e);
            }
        }
    }

    /// Waits for sampling to end on its own and every report to be delivered.
    pub async fn join(mut self) {
        for task in [self.sampler.take(), self.reporter.take()].into_iter().flatten() {
            if let Err(e) = task.await {
                warn!("Performance monitor task terminated abnormally: {}", e);
            }
        }
    }
}
