//! Executor error types and the caller-facing error taxonomy

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cdp::CdpError;
use crate::output::OutputError;
use crate::recipe::RecipeError;

/// Error category reported in every failed `ExecutionOutcome`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "ConnectionError")]
    Connection,
    #[serde(rename = "TimeoutError")]
    Timeout,
    #[serde(rename = "RecipeNotFoundError")]
    RecipeNotFound,
    #[serde(rename = "RecipeValidationError")]
    RecipeValidation,
    #[serde(rename = "RecipeExecutionError")]
    RecipeExecution,
    #[serde(rename = "OutputTargetUnsupportedError")]
    OutputTargetUnsupported,
    #[serde(rename = "OutputWriteError")]
    OutputWrite,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::RecipeNotFound => "RecipeNotFoundError",
            ErrorKind::RecipeValidation => "RecipeValidationError",
            ErrorKind::RecipeExecution => "RecipeExecutionError",
            ErrorKind::OutputTargetUnsupported => "OutputTargetUnsupportedError",
            ErrorKind::OutputWrite => "OutputWriteError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while running a recipe
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Cdp(#[from] CdpError),

    #[error(transparent)]
    Recipe(#[from] RecipeError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("Recipe '{recipe}' is missing required environment variable(s): {}", .missing.join(", "))]
    MissingEnv { recipe: String, missing: Vec<String> },

    #[error("Invalid params for recipe '{recipe}': {}", .reasons.join("; "))]
    InvalidParams { recipe: String, reasons: Vec<String> },

    #[error("Recipe '{0}' is a workflow and cannot be called from another workflow")]
    NestedWorkflow(String),

    #[error("Recipe '{0}' runs in the page but no browser session is available")]
    NoSession(String),

    #[error("No {runtime} interpreter found ('{program}')")]
    InterpreterNotFound { runtime: String, program: String },

    #[error("Failed to start recipe '{recipe}': {source}")]
    Spawn {
        recipe: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Recipe '{recipe}' timed out after {after:?}")]
    Timeout {
        recipe: String,
        after: Duration,
        stdout: Option<String>,
        stderr: Option<String>,
    },

    #[error("Recipe '{recipe}' failed: {message}")]
    Execution {
        recipe: String,
        message: String,
        stdout: Option<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Cdp(e) => match e {
                CdpError::Timeout { .. } => ErrorKind::Timeout,
                e if e.is_connection_failure() => ErrorKind::Connection,
                _ => ErrorKind::RecipeExecution,
            },
            EngineError::Recipe(e) => match e {
                RecipeError::InvalidName(_) | RecipeError::NotFound { .. } => {
                    ErrorKind::RecipeNotFound
                }
                RecipeError::Validation { .. } | RecipeError::Io { .. } => {
                    ErrorKind::RecipeValidation
                }
            },
            EngineError::Output(e) => match e {
                OutputError::Unsupported { .. } => ErrorKind::OutputTargetUnsupported,
                OutputError::Write { .. } => ErrorKind::OutputWrite,
            },
            EngineError::MissingEnv { .. }
            | EngineError::InvalidParams { .. }
            | EngineError::NestedWorkflow(_) => ErrorKind::RecipeValidation,
            EngineError::NoSession(_) => ErrorKind::Connection,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::InterpreterNotFound { .. }
            | EngineError::Spawn { .. }
            | EngineError::Execution { .. } => ErrorKind::RecipeExecution,
        }
    }
}
