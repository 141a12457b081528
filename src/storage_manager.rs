use crate::error::Result;
use crate::transport::{Method, RequestDescriptor, RetryClient, ServiceEndpointSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Artifact uploads against the Storage Manager endpoint set.
pub struct StorageManager {
    client: Arc<RetryClient>,
    endpoints: ServiceEndpointSet,
    timeout: Duration,
}

impl StorageManager {
    pub fn new(client: Arc<RetryClient>, endpoints: ServiceEndpointSet, timeout: Duration) -> Self {
        Self {
            client,
            endpoints,
            timeout,
        }
    }

    /// Uploads the binary `output.tar.gz` artifact of a simulation run.
    pub async fn upload_output(
        &self,
        experiment_id: &str,
        simulation_index: u64,
        file: &Path,
    ) -> Result<u16> {
        let path = format!("experiments/{experiment_id}/simulations/{simulation_index}");
        self.upload(path, file).await
    }

    /// Uploads the captured stdout/stderr log of a simulation run.
    pub async fn upload_stdout(
        &self,
        experiment_id: &str,
        simulation_index: u64,
        file: &Path,
    ) -> Result<u16> {
        let path = format!("experiments/{experiment_id}/simulations/{simulation_index}/stdout");
        self.upload(path, file).await
    }

    async fn upload(&self, path: String, file: &Path) -> Result<u16> {
        let data = tokio::fs::read(file).await?;
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        info!("Uploading '{}' ...", file_name);
        let request = RequestDescriptor::file(Method::PUT, path, file_name, data);
        let response = self
            .client
            .execute(&request, &self.endpoints, self.timeout)
            .await?;
        debug!("Response body: {}", response.text());

        Ok(response.status)
    }
}
