use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Exit code for fatal errors without a more specific cause.
pub const EXIT_FATAL: i32 = 1;
/// Exit code when the code base could not be downloaded, extracted or made executable.
pub const EXIT_CODE_BASE: i32 = 2;
/// Exit code when an external script exited unsuccessfully.
pub const EXIT_SCRIPT_FAILED: i32 = 3;
/// Exit code when the configured simulations limit has been reached.
pub const EXIT_LIMIT_REACHED: i32 = 4;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No {0} registered in the Information Service")]
    NoEndpoints(String),

    #[error("Could not execute '{path}' against any of {endpoints} endpoint(s): {last_error}")]
    TransportExhausted {
        path: String,
        endpoints: usize,
        last_error: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{service} response code: 500")]
    ServiceFailure { service: &'static str },

    #[error("{service} response code: {status}")]
    UnexpectedStatus { service: &'static str, status: u16 },

    #[error("Returned response body is not JSON: {0}")]
    InvalidJson(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Something went wrong but without any details")]
    RejectedWithoutDetails,

    #[error("'{script}' failed: {reason}")]
    ScriptFailed {
        script: String,
        reason: String,
        log_tail: String,
    },

    #[error("Could not get code base for experiment {experiment_id} after {attempts} attempts: {reason}")]
    CodeBase {
        experiment_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("Could not make code base executable: {0}")]
    Permissions(String),

    #[error("Monitoring error: {0}")]
    Monitoring(String),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Simulations limit ({0}) reached")]
    LimitReached(u32),
}

impl Error {
    /// Process exit code the supervisor uses when this error terminates the agent.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ScriptFailed { .. } => EXIT_SCRIPT_FAILED,
            Error::CodeBase { .. } | Error::Permissions(_) | Error::Archive(_) => EXIT_CODE_BASE,
            Error::LimitReached(_) => EXIT_LIMIT_REACHED,
            _ => EXIT_FATAL,
        }
    }

    /// Last lines of the simulation's stdout capture, when the error carries them.
    pub fn log_tail(&self) -> Option<&str> {
        match self {
            Error::ScriptFailed { log_tail, .. } if !log_tail.is_empty() => Some(log_tail),
            _ => None,
        }
    }
}
