use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config.json";

const DEFAULT_TIMEOUT_SECS: i64 = 60;
const DEFAULT_COOLDOWN_SECS: i64 = 5;

/// Worker configuration, normally provided by the Experiment Manager as `config.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationManagerConfig {
    pub experiment_id: String,
    pub information_service_url: String,
    pub experiment_manager_user: String,
    pub experiment_manager_pass: String,
    pub development: bool,
    pub start_at: String,
    pub timeout: i64,
    pub scalarm_certificate_path: String,
    pub simulations_limit: i64,
    pub insecure_ssl: bool,
    pub monitoring_interval: u64,
    pub cooldown_interval: i64,
    pub log_level: String,
}

impl Default for SimulationManagerConfig {
    fn default() -> Self {
        Self {
            experiment_id: String::new(),
            information_service_url: String::new(),
            experiment_manager_user: String::new(),
            experiment_manager_pass: String::new(),
            development: false,
            start_at: String::new(),
            timeout: DEFAULT_TIMEOUT_SECS,
            scalarm_certificate_path: String::new(),
            simulations_limit: -1,
            insecure_ssl: false,
            monitoring_interval: 0,
            cooldown_interval: DEFAULT_COOLDOWN_SECS,
            log_level: "info".to_string(),
        }
    }
}

impl SimulationManagerConfig {
    /// Loads the JSON config file, then applies `SIM_*` environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env();
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("could not open file {}: {e}", path.display()))
        })?;

        let mut config: Self = serde_json::from_str(&contents)
            .map_err(|e| Error::Configuration(format!("incorrect JSON in the file: {e}")))?;
        config.normalize();

        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(val) = env::var("SIM_EXPERIMENT_ID") {
            if !val.is_empty() {
                self.experiment_id = val;
            }
        }

        if let Ok(val) = env::var("SIM_INFORMATION_SERVICE_URL") {
            if !val.is_empty() {
                self.information_service_url = val;
            }
        }

        if let Ok(val) = env::var("SIM_EXPERIMENT_MANAGER_USER") {
            if !val.is_empty() {
                self.experiment_manager_user = val;
            }
        }

        if let Ok(val) = env::var("SIM_EXPERIMENT_MANAGER_PASS") {
            if !val.is_empty() {
                self.experiment_manager_pass = val;
            }
        }

        if let Ok(val) = env::var("SIM_DEVELOPMENT") {
            self.development = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = env::var("SIM_TIMEOUT") {
            if let Ok(timeout) = val.parse() {
                self.timeout = timeout;
            }
        }

        if let Ok(val) = env::var("SIM_SIMULATIONS_LIMIT") {
            if let Ok(limit) = val.parse() {
                self.simulations_limit = limit;
            }
        }

        if let Ok(val) = env::var("SIM_MONITORING_INTERVAL") {
            if let Ok(interval) = val.parse() {
                self.monitoring_interval = interval;
            }
        }

        if let Ok(val) = env::var("SIM_COOLDOWN_INTERVAL") {
            if let Ok(interval) = val.parse() {
                self.cooldown_interval = interval;
            }
        }

        if let Ok(val) = env::var("SIM_INSECURE_SSL") {
            self.insecure_ssl = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = env::var("SIM_LOG_LEVEL") {
            if !val.is_empty() {
                self.log_level = val;
            }
        }
    }

    fn normalize(&mut self) {
        if self.timeout <= 0 {
            self.timeout = DEFAULT_TIMEOUT_SECS;
        }
        if self.cooldown_interval <= 0 {
            self.cooldown_interval = DEFAULT_COOLDOWN_SECS;
        }
        if self.simulations_limit <= 0 {
            self.simulations_limit = -1;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.information_service_url.is_empty() {
            return Err(Error::Configuration(
                "information_service_url is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn communication_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(0) as u64)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_interval.max(0) as u64)
    }

    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring_interval)
    }

    pub fn simulations_limit(&self) -> Option<u32> {
        u32::try_from(self.simulations_limit)
            .ok()
            .filter(|limit| *limit > 0)
    }

    pub fn fixed_experiment_id(&self) -> Option<&str> {
        if self.experiment_id.is_empty() {
            None
        } else {
            Some(&self.experiment_id)
        }
    }

    pub fn certificate_path(&self) -> Option<&Path> {
        if self.scalarm_certificate_path.is_empty() {
            None
        } else {
            Some(Path::new(&self.scalarm_certificate_path))
        }
    }

    /// Parsed `start_at`; `None` when unset, `Err` when set but not RFC3339.
    pub fn start_at(&self) -> Option<std::result::Result<DateTime<Utc>, chrono::ParseError>> {
        if self.start_at.is_empty() {
            return None;
        }
        Some(DateTime::parse_from_rfc3339(&self.start_at).map(|t| t.with_timezone(&Utc)))
    }
}
