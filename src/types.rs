use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

/// Returns true when `s` is one syntactically valid JSON document.
pub fn is_json(s: &str) -> bool {
    serde_json::from_str::<serde::de::IgnoredAny>(s).is_ok()
}

/// One simulation run assigned by the Experiment Manager.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationTask {
    pub experiment_id: String,
    pub simulation_index: u64,
    pub input_parameters: Map<String, Value>,
    pub execution_constraints: Value,
}

/// Answer to `next_simulation`.
#[derive(Debug, Clone, PartialEq)]
pub enum NextSimulation {
    Ready(SimulationTask),
    Wait(Duration),
    AllSent,
    Error(Option<String>),
    Unsupported(String),
}

impl NextSimulation {
    pub fn from_value(experiment_id: &str, value: &Value) -> Result<Self> {
        let status = value
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let next = match status {
            "ok" => {
                let simulation_index = value
                    .get("simulation_id")
                    .and_then(|id| id.as_u64().or_else(|| id.as_f64().map(|f| f as u64)))
                    .ok_or_else(|| {
                        Error::InvalidJson("next simulation without 'simulation_id'".to_string())
                    })?;

                let input_parameters = match value.get("input_parameters") {
                    Some(Value::Object(params)) => params.clone(),
                    None | Some(Value::Null) => Map::new(),
                    Some(other) => {
                        return Err(Error::InvalidJson(format!(
                            "'input_parameters' is not an object: {other}"
                        )))
                    }
                };

                NextSimulation::Ready(SimulationTask {
                    experiment_id: experiment_id.to_string(),
                    simulation_index,
                    input_parameters,
                    execution_constraints: value
                        .get("execution_constraints")
                        .cloned()
                        .unwrap_or(Value::Null),
                })
            }
            "wait" => {
                let secs = value
                    .get("duration_in_seconds")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0)
                    .max(0.0);
                NextSimulation::Wait(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
            }
            "all_sent" => NextSimulation::AllSent,
            "error" => NextSimulation::Error(
                value
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            ),
            other => NextSimulation::Unsupported(other.to_string()),
        };

        Ok(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Error,
    #[default]
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
            RunStatus::Unknown => "unknown",
        }
    }
}

/// Result envelope written by the simulation as `output.json` / `intermediate_result.json`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SimulationRunResult {
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub results: Option<Value>,
    #[serde(default)]
    pub reason: String,
}

impl SimulationRunResult {
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Error,
            results: None,
            reason: reason.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        match self.status {
            RunStatus::Ok => self.results.is_some(),
            RunStatus::Error => !self.reason.is_empty(),
            RunStatus::Unknown => false,
        }
    }

    /// Reads a result file; any failure is turned into an error-status result.
    pub async fn read_from(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        match tokio::fs::read(path).await {
            Ok(contents) => match serde_json::from_slice::<SimulationRunResult>(&contents) {
                Ok(result) => result,
                Err(e) => Self::error(format!("Error during '{name}' parsing: {e}")),
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Self::error(format!("No '{name}' file found: {e}"))
            }
            Err(e) => Self::error(format!("Could not open '{name}': {e}")),
        }
    }

    /// Serialises `results` and enforces the envelope invariant, replacing
    /// invalid results with an error carrying the offending payload.
    pub fn into_submission(self) -> RunSubmission {
        let payload = serde_json::to_string(&self.results).unwrap_or_default();

        if !self.is_valid() || !is_json(&payload) {
            return RunSubmission {
                status: RunStatus::Error,
                reason: format!("Invalid results in output.json: {payload}"),
                result: String::new(),
            };
        }

        RunSubmission {
            status: self.status,
            reason: self.reason,
            result: payload,
        }
    }

    /// Form fields for progress reports, which skip the validity check.
    pub fn progress_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("status", self.status.as_str().to_string()),
            ("reason", self.reason.clone()),
            (
                "result",
                serde_json::to_string(&self.results).unwrap_or_default(),
            ),
        ]
    }
}

/// Final result as posted to `mark_as_complete`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSubmission {
    pub status: RunStatus,
    pub reason: String,
    pub result: String,
}

impl RunSubmission {
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("status", self.status.as_str().to_string()),
            ("reason", self.reason.clone()),
            ("result", self.result.clone()),
        ]
    }
}

/// Application-level `{status, reason}` envelope returned by write operations.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceEnvelope {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ServiceEnvelope {
    /// Fails unless the status is absent or one of `accepted`.
    pub fn ensure_accepted(&self, accepted: &[&str]) -> Result<()> {
        match self.status.as_deref() {
            None => Ok(()),
            Some(status) if accepted.contains(&status) => Ok(()),
            Some(_) => match &self.reason {
                Some(reason) => Err(Error::Rejected(reason.clone())),
                None => Err(Error::RejectedWithoutDetails),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_json_accepts_well_formed_documents() {
        assert!(is_json(r#"{"a":1,"b":2}"#));
        assert!(is_json("[1, 2, 3]"));
        assert!(is_json("null"));
        assert!(is_json("\"text\""));
    }

    #[test]
    fn test_is_json_rejects_malformed_documents() {
        assert!(!is_json(r#"{"a":1,"b":2"#));
        assert!(!is_json(""));
        assert!(!is_json("{'a': 1}"));
    }

    #[test]
    fn test_run_result_validity() {
        let ok_without_results = SimulationRunResult {
            status: RunStatus::Ok,
            results: None,
            reason: String::new(),
        };
        assert!(!ok_without_results.is_valid());

        let ok_with_results = SimulationRunResult {
            status: RunStatus::Ok,
            results: Some(json!({"product": 20})),
            reason: String::new(),
        };
        assert!(ok_with_results.is_valid());

        assert!(!SimulationRunResult::error("").is_valid());
        assert!(SimulationRunResult::error("x").is_valid());
    }

    #[test]
    fn test_run_result_unknown_status_is_invalid() {
        let result: SimulationRunResult =
            serde_json::from_str(r#"{"status":"done","results":{"a":1}}"#).unwrap();
        assert_eq!(result.status, RunStatus::Unknown);
        assert!(!result.is_valid());
    }

    #[test]
    fn test_run_result_null_results_deserialize_as_none() {
        let result: SimulationRunResult =
            serde_json::from_str(r#"{"status":"ok","results":null}"#).unwrap();
        assert!(result.results.is_none());
        assert!(!result.is_valid());
    }

    #[test]
    fn test_into_submission_keeps_valid_results() {
        let result = SimulationRunResult {
            status: RunStatus::Ok,
            results: Some(json!({"product": 20})),
            reason: String::new(),
        };

        let submission = result.into_submission();
        assert_eq!(submission.status, RunStatus::Ok);
        assert_eq!(submission.result, r#"{"product":20}"#);
    }

    #[test]
    fn test_into_submission_replaces_invalid_results() {
        let result = SimulationRunResult {
            status: RunStatus::Ok,
            results: None,
            reason: String::new(),
        };

        let submission = result.into_submission();
        assert_eq!(submission.status, RunStatus::Error);
        assert!(submission.result.is_empty());
        assert!(submission.reason.contains("null"));
    }

    #[test]
    fn test_submission_form_fields() {
        let submission = SimulationRunResult::error("boom").into_submission();
        let fields = submission.form_fields();

        assert_eq!(fields[0], ("status", "error".to_string()));
        assert_eq!(fields[1], ("reason", "boom".to_string()));
        assert_eq!(fields[2], ("result", "null".to_string()));
    }

    #[tokio::test]
    async fn test_read_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = SimulationRunResult::read_from(&dir.path().join("output.json")).await;

        assert_eq!(result.status, RunStatus::Error);
        assert!(result.reason.contains("output.json"));
        assert!(result.is_valid());
    }

    #[tokio::test]
    async fn test_read_from_unparsable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.json");
        std::fs::write(&path, r#"{"status":"ok","results":{"a":1}"#).unwrap();

        let result = SimulationRunResult::read_from(&path).await;
        assert_eq!(result.status, RunStatus::Error);
        assert!(result.reason.contains("parsing"));
        assert!(result.results.is_none());
    }

    #[tokio::test]
    async fn test_read_from_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.json");
        std::fs::write(&path, r#"{"status":"ok","results":{"product":20}}"#).unwrap();

        let result = SimulationRunResult::read_from(&path).await;
        assert_eq!(result.status, RunStatus::Ok);
        assert_eq!(result.results, Some(json!({"product": 20})));
    }

    #[test]
    fn test_next_simulation_ready() {
        let value = json!({
            "status": "ok",
            "simulation_id": 1,
            "execution_constraints": {"time_constraint_in_sec": 3300},
            "input_parameters": {"parameter1": 10.0, "parameter2": 2.0}
        });

        match NextSimulation::from_value("1", &value).unwrap() {
            NextSimulation::Ready(task) => {
                assert_eq!(task.experiment_id, "1");
                assert_eq!(task.simulation_index, 1);
                assert_eq!(task.input_parameters["parameter1"], json!(10.0));
                assert_eq!(task.execution_constraints["time_constraint_in_sec"], json!(3300));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_next_simulation_float_index() {
        let value = json!({"status": "ok", "simulation_id": 7.0, "input_parameters": {}});
        match NextSimulation::from_value("1", &value).unwrap() {
            NextSimulation::Ready(task) => assert_eq!(task.simulation_index, 7),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_next_simulation_ok_without_index_is_error() {
        let value = json!({"status": "ok"});
        assert!(NextSimulation::from_value("1", &value).is_err());
    }

    #[test]
    fn test_next_simulation_other_statuses() {
        assert_eq!(
            NextSimulation::from_value("1", &json!({"status": "wait", "duration_in_seconds": 3}))
                .unwrap(),
            NextSimulation::Wait(Duration::from_secs(3))
        );
        assert_eq!(
            NextSimulation::from_value("1", &json!({"status": "all_sent"})).unwrap(),
            NextSimulation::AllSent
        );
        assert_eq!(
            NextSimulation::from_value("1", &json!({"status": "error", "reason": "x"})).unwrap(),
            NextSimulation::Error(Some("x".to_string()))
        );
        assert_eq!(
            NextSimulation::from_value("1", &json!({"status": "paused"})).unwrap(),
            NextSimulation::Unsupported("paused".to_string())
        );
    }

    #[test]
    fn test_next_simulation_wait_out_of_range() {
        assert_eq!(
            NextSimulation::from_value("1", &json!({"status": "wait", "duration_in_seconds": 1e20}))
                .unwrap(),
            NextSimulation::Wait(Duration::MAX)
        );
        assert_eq!(
            NextSimulation::from_value("1", &json!({"status": "wait", "duration_in_seconds": -5}))
                .unwrap(),
            NextSimulation::Wait(Duration::ZERO)
        );
        assert_eq!(
            NextSimulation::from_value("1", &json!({"status": "wait"})).unwrap(),
            NextSimulation::Wait(Duration::ZERO)
        );
    }

    #[test]
    fn test_envelope_acceptance() {
        let ok: ServiceEnvelope = serde_json::from_str(r#"{"status":"ok"}"#).unwrap();
        assert!(ok.ensure_accepted(&["ok"]).is_ok());

        let precondition: ServiceEnvelope =
            serde_json::from_str(r#"{"status":"preconditioned_failed"}"#).unwrap();
        assert!(precondition.ensure_accepted(&["ok", "preconditioned_failed"]).is_ok());
        assert!(precondition.ensure_accepted(&["ok"]).is_err());

        let rejected: ServiceEnvelope =
            serde_json::from_str(r#"{"status":"error","reason":"already done"}"#).unwrap();
        match rejected.ensure_accepted(&["ok"]) {
            Err(Error::Rejected(reason)) => assert_eq!(reason, "already done"),
            other => panic!("unexpected: {other:?}"),
        }

        let bare: ServiceEnvelope = serde_json::from_str(r#"{"status":"error"}"#).unwrap();
        assert!(matches!(
            bare.ensure_accepted(&["ok"]),
            Err(Error::RejectedWithoutDetails)
        ));

        let empty: ServiceEnvelope = serde_json::from_str("{}").unwrap();
        assert!(empty.ensure_accepted(&["ok"]).is_ok());
    }
}
