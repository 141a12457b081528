use crate::error::{Error, Result};
use crate::monitoring::performance::AggregatedPerformanceStats;
use crate::monitoring::system::HostInfo;
use crate::monitoring::SimulationReporter;
use crate::transport::{Method, RawResponse, RequestDescriptor, RetryClient, ServiceEndpointSet};
use crate::types::{NextSimulation, RunSubmission, ServiceEnvelope, SimulationRunResult};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SERVICE: &str = "Experiment manager";

pub const CODE_BASE_ARCHIVE: &str = "code_base.zip";

/// Job protocol client bound to the Experiment Manager endpoint set.
pub struct ExperimentManager {
    client: Arc<RetryClient>,
    endpoints: ServiceEndpointSet,
    timeout: Duration,
}

impl ExperimentManager {
    pub fn new(client: Arc<RetryClient>, endpoints: ServiceEndpointSet, timeout: Duration) -> Self {
        Self {
            client,
            endpoints,
            timeout,
        }
    }

    /// Upper bound for polling `next_simulation` before switching experiments.
    pub fn fetch_budget(&self) -> Duration {
        self.timeout * self.endpoints.len() as u32
    }

    async fn call(&self, request: RequestDescriptor) -> Result<RawResponse> {
        self.client
            .execute(&request, &self.endpoints, self.timeout)
            .await
    }

    pub async fn random_experiment_id(&self) -> Result<String> {
        info!("Getting random experiment id...");
        let response = self
            .call(RequestDescriptor::get("experiments/random_experiment"))
            .await?;

        if response.status != 200 {
            warn!(
                "Random experiment request answered with status {}",
                response.status
            );
            return Ok(String::new());
        }

        let id = response.text().trim().to_string();
        debug!("Random experiment response body: {}", id);
        Ok(id)
    }

    pub async fn next_simulation(&self, experiment_id: &str) -> Result<NextSimulation> {
        let path = format!("experiments/{experiment_id}/next_simulation");
        let response = self.call(RequestDescriptor::get(path)).await?;
        let value = decode_json(&response)?;

        NextSimulation::from_value(experiment_id, &value)
    }

    pub async fn mark_as_complete(
        &self,
        experiment_id: &str,
        simulation_index: u64,
        submission: &RunSubmission,
    ) -> Result<()> {
        let path = simulation_path(experiment_id, simulation_index, "mark_as_complete");
        let request = RequestDescriptor::form(Method::POST, path, &submission.form_fields());
        let response = self.call(request).await?;

        envelope(&response)?.ensure_accepted(&["ok", "preconditioned_failed"])
    }

    pub async fn post_progress_info(
        &self,
        experiment_id: &str,
        simulation_index: u64,
        result: &SimulationRunResult,
    ) -> Result<()> {
        let path = simulation_path(experiment_id, simulation_index, "progress_info");
        let request = RequestDescriptor::form(Method::POST, path, &result.progress_fields());
        let response = self.call(request).await?;

        envelope(&response)?.ensure_accepted(&["ok"])
    }

    pub async fn report_host_info(
        &self,
        experiment_id: &str,
        simulation_index: u64,
        host_info: &HostInfo,
    ) -> Result<()> {
        let path = simulation_path(experiment_id, simulation_index, "host_info");
        self.post_json_field(path, "host_info", host_info).await
    }

    pub async fn report_performance_stats(
        &self,
        experiment_id: &str,
        simulation_index: u64,
        stats: &AggregatedPerformanceStats,
    ) -> Result<()> {
        let path = simulation_path(experiment_id, simulation_index, "performance_stats");
        self.post_json_field(path, "stats", stats).await
    }

    async fn post_json_field<T: Serialize + ?Sized>(
        &self,
        path: String,
        field: &str,
        value: &T,
    ) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let response = self
            .call(RequestDescriptor::form(Method::POST, path, &[(field, json)]))
            .await?;

        match response.status {
            200 => Ok(()),
            status => Err(Error::UnexpectedStatus {
                service: SERVICE,
                status,
            }),
        }
    }

    /// Downloads the code base archive into `dest`, returning the archive path.
    pub async fn download_code_base(&self, experiment_id: &str, dest: &Path) -> Result<PathBuf> {
        let path = format!("experiments/{experiment_id}/code_base");
        let response = self.call(RequestDescriptor::get(path)).await?;
        check_status(&response)?;

        let archive = dest.join(CODE_BASE_ARCHIVE);
        tokio::fs::write(&archive, &response.body).await?;
        info!(
            "Code base downloaded to {} ({} bytes)",
            archive.display(),
            response.body.len()
        );

        Ok(archive)
    }
}

fn simulation_path(experiment_id: &str, simulation_index: u64, action: &str) -> String {
    format!("experiments/{experiment_id}/simulations/{simulation_index}/{action}")
}

fn check_status(response: &RawResponse) -> Result<()> {
    match response.status {
        200 => Ok(()),
        500 => Err(Error::ServiceFailure { service: SERVICE }),
        status => Err(Error::UnexpectedStatus {
            service: SERVICE,
            status,
        }),
    }
}

fn decode_json(response: &RawResponse) -> Result<Value> {
    check_status(response)?;
    serde_json::from_slice(&response.body).map_err(|_| Error::InvalidJson(response.text()))
}

fn envelope(response: &RawResponse) -> Result<ServiceEnvelope> {
    check_status(response)?;
    serde_json::from_slice(&response.body).map_err(|_| Error::InvalidJson(response.text()))
}

/// Reporting channel for one simulation run.
pub struct SimulationChannel {
    manager: Arc<ExperimentManager>,
    experiment_id: String,
    simulation_index: u64,
}

impl SimulationChannel {
    pub fn new(manager: Arc<ExperimentManager>, experiment_id: &str, simulation_index: u64) -> Self {
        Self {
            manager,
            experiment_id: experiment_id.to_string(),
            simulation_index,
        }
    }
}

#[async_trait]
impl SimulationReporter for SimulationChannel {
    async fn post_progress_info(&self, result: &SimulationRunResult) -> Result<()> {
        self.manager
            .post_progress_info(&self.experiment_id, self.simulation_index, result)
            .await
    }

    async fn report_host_info(&self, host_info: &HostInfo) -> Result<()> {
        self.manager
            .report_host_info(&self.experiment_id, self.simulation_index, host_info)
            .await
    }

    async fn report_performance_stats(&self, stats: &AggregatedPerformanceStats) -> Result<()> {
        self.manager
            .report_performance_stats(&self.experiment_id, self.simulation_index, stats)
            .await
    }
}
