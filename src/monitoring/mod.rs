pub mod performance;
pub mod progress;
pub mod system;

use crate::error::Result;
use crate::types::SimulationRunResult;
use async_trait::async_trait;
use performance::AggregatedPerformanceStats;
use system::HostInfo;

/// Destination of everything the monitors report about one simulation run.
#[async_trait]
pub trait SimulationReporter: Send + Sync {
    async fn post_progress_info(&self, result: &SimulationRunResult) -> Result<()>;

    async fn report_host_info(&self, host_info: &HostInfo) -> Result<()>;

    async fn report_performance_stats(&self, stats: &AggregatedPerformanceStats) -> Result<()>;
}
