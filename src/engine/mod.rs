//! Recipe execution engine
//!
//! This module contains:
//! - `executor` - resolves, dispatches and reports recipe runs
//! - `runtime` - in-page and interpreter runtime strategies
//! - `callback` - JSON-RPC channel workflows use to run nested recipes
//! - `collaborators` - task context and step logging seams
//! - `error` - executor errors and the caller-facing error taxonomy
//! - `result` - the uniform execution outcome

pub mod callback;
pub mod collaborators;
pub mod error;
pub mod executor;
pub mod result;
pub mod runtime;

pub use callback::{CallbackHandler, CallbackServer, NestedRun, CALLBACK_ADDR_ENV, CALLBACK_TOKEN_ENV};
pub use collaborators::{
    DirectoryTaskContext, NoTaskContext, StepLogger, StepPhase, StepRecord, TaskContext,
    TracingStepLogger,
};
pub use error::{EngineError, ErrorKind};
pub use executor::{
    ExecutorSettings, RecipeExecutor, RunRequest, DEFAULT_TIMEOUT, OUTPUT_DIR_ENV, RECIPE_ENV,
};
pub use result::{ExecutionOutcome, OutcomeError};
