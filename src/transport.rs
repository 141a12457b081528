use crate::config::SimulationManagerConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub use reqwest::Method;

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Interchangeable `host[:port][/prefix]` endpoints of one service role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpointSet {
    endpoints: Vec<String>,
}

impl ServiceEndpointSet {
    pub fn new(role: &str, endpoints: Vec<String>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::NoEndpoints(role.to_string()));
        }
        Ok(Self { endpoints })
    }

    pub fn single(endpoint: impl Into<String>) -> Self {
        Self {
            endpoints: vec![endpoint.into()],
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.endpoints.get(index).map(String::as_str)
    }
}

/// Fully buffered request body, replayable against every endpoint and attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Bytes {
        data: Vec<u8>,
        content_type: String,
    },
    File {
        field: String,
        file_name: String,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub path: String,
    pub body: Option<RequestBody>,
}

impl RequestDescriptor {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
        }
    }

    pub fn form<K, V>(method: Method, path: impl Into<String>, fields: &[(K, V)]) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields.iter().map(|(k, v)| (k.as_ref(), v.as_ref())))
            .finish();

        Self {
            method,
            path: path.into(),
            body: Some(RequestBody::Bytes {
                data: encoded.into_bytes(),
                content_type: FORM_CONTENT_TYPE.to_string(),
            }),
        }
    }

    pub fn file(
        method: Method,
        path: impl Into<String>,
        file_name: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            method,
            path: path.into(),
            body: Some(RequestBody::File {
                field: "file".to_string(),
                file_name: file_name.into(),
                data,
            }),
        }
    }
}

/// A request bound to one concrete endpoint.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: String,
    pub username: String,
    pub password: String,
    pub body: Option<RequestBody>,
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs one delivery attempt. Any HTTP status counts as a response.
    async fn send(&self, request: &PreparedRequest) -> Result<RawResponse>;
}

/// Chooses the order in which endpoints of a set are tried.
pub trait EndpointSelector: Send + Sync {
    fn order(&self, count: usize) -> Vec<usize>;
}

/// Fresh random permutation per call; no memory of endpoint health.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomOrder;

impl EndpointSelector for RandomOrder {
    fn order(&self, count: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..count).collect();
        order.shuffle(&mut rand::thread_rng());
        order
    }
}

/// Tries endpoints in the order they were registered.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclaredOrder;

impl EndpointSelector for DeclaredOrder {
    fn order(&self, count: usize) -> Vec<usize> {
        (0..count).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Issues one logical request against a set of mirrors, trying each endpoint
/// until it answers or its timeout budget elapses.
pub struct RetryClient {
    transport: Arc<dyn Transport>,
    selector: Arc<dyn EndpointSelector>,
    credentials: Credentials,
    development: bool,
    retry_interval: Duration,
}

impl RetryClient {
    pub fn new(transport: Arc<dyn Transport>, credentials: Credentials, development: bool) -> Self {
        Self {
            transport,
            selector: Arc::new(RandomOrder),
            credentials,
            development,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn from_config(config: &SimulationManagerConfig) -> Result<Self> {
        let transport = ReqwestTransport::from_config(config)?;
        let credentials = Credentials {
            username: config.experiment_manager_user.clone(),
            password: config.experiment_manager_pass.clone(),
        };
        Ok(Self::new(Arc::new(transport), credentials, config.development))
    }

    pub fn with_selector(mut self, selector: Arc<dyn EndpointSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    fn scheme(&self) -> &'static str {
        if self.development {
            "http"
        } else {
            "https"
        }
    }

    pub fn build_url(&self, endpoint: &str, path: &str) -> String {
        let endpoint = endpoint.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        if endpoint.contains("://") {
            format!("{endpoint}/{path}")
        } else {
            format!("{}://{endpoint}/{path}", self.scheme())
        }
    }

    pub async fn execute(
        &self,
        request: &RequestDescriptor,
        endpoints: &ServiceEndpointSet,
        timeout: Duration,
    ) -> Result<RawResponse> {
        let mut last_error = "no endpoint attempted".to_string();

        for index in self.selector.order(endpoints.len()) {
            let Some(endpoint) = endpoints.get(index) else {
                continue;
            };

            let prepared = PreparedRequest {
                method: request.method.clone(),
                url: self.build_url(endpoint, &request.path),
                username: self.credentials.username.clone(),
                password: self.credentials.password.clone(),
                body: request.body.clone(),
            };
            debug!("{} {}", prepared.method, prepared.url);

            match self.send_within(&prepared, timeout).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!("Endpoint {} did not respond: {}", endpoint, e);
                    last_error = e.to_string();
                }
            }
        }

        Err(Error::TransportExhausted {
            path: request.path.clone(),
            endpoints: endpoints.len(),
            last_error,
        })
    }

    async fn send_within(&self, request: &PreparedRequest, timeout: Duration) -> Result<RawResponse> {
        let started = Instant::now();

        loop {
            match self.transport.send(request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    debug!("Request to {} failed: {}", request.url, e);
                    tokio::time::sleep(self.retry_interval).await;
                    if started.elapsed() >= timeout {
                        return Err(e);
                    }
                }
            }
        }
    }
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn from_config(config: &SimulationManagerConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.communication_timeout())
            .danger_accept_invalid_certs(config.insecure_ssl);

        if let Some(path) = config.certificate_path() {
            let pem = std::fs::read(path).map_err(|e| {
                Error::Configuration(format!(
                    "could not read certificate {}: {e}",
                    path.display()
                ))
            })?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        Ok(Self::new(builder.build()?))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &PreparedRequest) -> Result<RawResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .basic_auth(&request.username, Some(&request.password))
            .header(ACCEPT, "application/json");

        match &request.body {
            Some(RequestBody::Bytes { data, content_type }) => {
                builder = builder
                    .header(CONTENT_TYPE, content_type.as_str())
                    .body(data.clone());
            }
            Some(RequestBody::File {
                field,
                file_name,
                data,
            }) => {
                let part = Part::bytes(data.clone()).file_name(file_name.clone());
                builder = builder.multipart(Form::new().part(field.clone(), part));
            }
            None => {}
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{}: {e}", request.url)))?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();

        Ok(RawResponse { status, body })
    }
}
