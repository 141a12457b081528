use crate::error::{Error, Result};
use crate::transport::{RawResponse, RequestDescriptor, RetryClient, ServiceEndpointSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const SERVICE: &str = "Information service";

/// Service directory resolver. Queried once at startup.
pub struct InformationService {
    client: Arc<RetryClient>,
    endpoint: ServiceEndpointSet,
    timeout: Duration,
}

impl InformationService {
    pub fn new(client: Arc<RetryClient>, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            endpoint: ServiceEndpointSet::single(url),
            timeout,
        }
    }

    pub async fn get_experiment_managers(&self) -> Result<ServiceEndpointSet> {
        self.resolve("experiment_managers", "Experiment Managers").await
    }

    pub async fn get_storage_managers(&self) -> Result<ServiceEndpointSet> {
        self.resolve("storage_managers", "Storage Managers").await
    }

    async fn resolve(&self, path: &str, role: &str) -> Result<ServiceEndpointSet> {
        let response = self
            .client
            .execute(&RequestDescriptor::get(path), &self.endpoint, self.timeout)
            .await?;

        let endpoints = parse_endpoints(&response)?;
        info!("{} registered: {:?}", role, endpoints);

        ServiceEndpointSet::new(role, endpoints)
    }
}

fn parse_endpoints(response: &RawResponse) -> Result<Vec<String>> {
    match response.status {
        200 => {
            debug!("Response body: {}", response.text());
            serde_json::from_slice(&response.body)
                .map_err(|e| Error::InvalidJson(format!("{}: {e}", response.text())))
        }
        500 => Err(Error::ServiceFailure { service: SERVICE }),
        status => Err(Error::UnexpectedStatus {
            service: SERVICE,
            status,
        }),
    }
}
