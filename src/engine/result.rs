//! Execution outcome
//!
//! Every runtime reports through the same shape, and the shape is also the
//! wire format handed to callers and output destinations.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::error::{EngineError, ErrorKind};
use crate::output::OutputError;
use crate::recipe::Runtime;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Output destination that failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl From<&EngineError> for OutcomeError {
    fn from(error: &EngineError) -> Self {
        let mut outcome = OutcomeError {
            kind: error.kind(),
            message: error.to_string(),
            stdout: None,
            stderr: None,
            exit_code: None,
            target: None,
        };

        match error {
            EngineError::Execution {
                stdout,
                stderr,
                exit_code,
                ..
            } => {
                outcome.stdout = stdout.clone();
                outcome.stderr = stderr.clone();
                outcome.exit_code = *exit_code;
            }
            EngineError::Timeout { stdout, stderr, .. } => {
                outcome.stdout = stdout.clone();
                outcome.stderr = stderr.clone();
            }
            EngineError::Output(e) => outcome.target = Some(e.target().to_string()),
            _ => {}
        }
        outcome
    }
}

/// Result of one recipe run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    /// Payload of a successful run; `Some(Null)` is a legitimate result
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
    pub recipe: String,
    #[serde(default)]
    pub runtime: Option<Runtime>,
    pub execution_time_ms: u64,
}

/// A present `null` stays `Some(Value::Null)`; only an absent field is `None`
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl ExecutionOutcome {
    pub fn success(
        recipe: impl Into<String>,
        runtime: Runtime,
        data: Value,
        elapsed: Duration,
    ) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            recipe: recipe.into(),
            runtime: Some(runtime),
            execution_time_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn failure(
        recipe: impl Into<String>,
        runtime: Option<Runtime>,
        error: &EngineError,
        elapsed: Duration,
    ) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(OutcomeError::from(error)),
            recipe: recipe.into(),
            runtime,
            execution_time_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Record a delivery failure on an otherwise finished outcome
    pub fn with_output_error(mut self, error: &OutputError) -> Self {
        let engine_error = EngineError::Output(error.clone());
        self.success = false;
        self.error = Some(OutcomeError::from(&engine_error));
        self
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
