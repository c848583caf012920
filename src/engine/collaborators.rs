//! Seams to the surrounding application

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::error::ErrorKind;
use crate::recipe::Runtime;

/// The long-running task a recipe run belongs to, if any
pub trait TaskContext: Send + Sync {
    /// Directory where recipes may write artifacts
    fn output_dir(&self) -> Option<PathBuf>;
}

/// No surrounding task; artifacts go to the working directory
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTaskContext;

impl TaskContext for NoTaskContext {
    fn output_dir(&self) -> Option<PathBuf> {
        None
    }
}

/// Task context rooted at a fixed directory
#[derive(Debug, Clone)]
pub struct DirectoryTaskContext {
    dir: PathBuf,
}

impl DirectoryTaskContext {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl TaskContext for DirectoryTaskContext {
    fn output_dir(&self) -> Option<PathBuf> {
        Some(self.dir.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepPhase {
    Started,
    Finished,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub recipe: String,
    pub runtime: Option<Runtime>,
    pub phase: StepPhase,
    pub at: DateTime<Utc>,
    /// Workflow that invoked this recipe
    pub parent: Option<String>,
    pub duration: Option<Duration>,
    pub success: Option<bool>,
    pub error_kind: Option<ErrorKind>,
}

impl StepRecord {
    pub fn started(recipe: &str, runtime: Option<Runtime>, parent: Option<&str>) -> Self {
        Self {
            recipe: recipe.to_string(),
            runtime,
            phase: StepPhase::Started,
            at: Utc::now(),
            parent: parent.map(String::from),
            duration: None,
            success: None,
            error_kind: None,
        }
    }

    pub fn finished(
        recipe: &str,
        runtime: Option<Runtime>,
        parent: Option<&str>,
        duration: Duration,
        error_kind: Option<ErrorKind>,
    ) -> Self {
        Self {
            recipe: recipe.to_string(),
            runtime,
            phase: StepPhase::Finished,
            at: Utc::now(),
            parent: parent.map(String::from),
            duration: Some(duration),
            success: Some(error_kind.is_none()),
            error_kind,
        }
    }
}

/// Receives a record when each recipe starts and finishes
pub trait StepLogger: Send + Sync {
    fn record(&self, record: StepRecord);
}

/// Default logger: emits records as tracing events
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStepLogger;

impl StepLogger for TracingStepLogger {
    fn record(&self, record: StepRecord) {
        let runtime = record.runtime.map(|r| r.as_str()).unwrap_or("-");
        let parent = record.parent.as_deref().unwrap_or("-");
        match (record.phase, record.error_kind) {
            (StepPhase::Started, _) => {
                info!(recipe = %record.recipe, runtime, parent, "Recipe started");
            }
            (StepPhase::Finished, None) => {
                info!(
                    recipe = %record.recipe,
                    runtime,
                    parent,
                    duration_ms = record.duration.map(|d| d.as_millis() as u64).unwrap_or(0),
                    "Recipe finished"
                );
            }
            (StepPhase::Finished, Some(kind)) => {
                warn!(
                    recipe = %record.recipe,
                    runtime,
                    parent,
                    duration_ms = record.duration.map(|d| d.as_millis() as u64).unwrap_or(0),
                    error = %kind,
                    "Recipe failed"
                );
            }
        }
    }
}
