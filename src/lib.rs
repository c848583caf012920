//! # Pagewright
//!
//! A remote-debugging browser client and a metadata-driven recipe engine.
//!
//! ## Features
//!
//! - **Protocol client** - JSON-over-WebSocket with id correlation, per-command
//!   deadlines, retrying connection setup and automatic reconnection
//! - **Recipe registry** - project, user and example tiers; the first tier
//!   holding a recipe shadows the rest
//! - **Runtimes** - in-page JavaScript, Python and shell, with workflows that
//!   call other recipes over a local callback channel
//! - **Output delivery** - stdout, files and the clipboard
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pagewright::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::load(".")?;
//!     let manager = ConnectionManager::new(config.connection_options())?;
//!     let session = manager
//!         .connect(&config.address(), config.retry_policy())
//!         .await?;
//!
//!     let executor = RecipeExecutor::new(config.registry(), config.env_resolver())
//!         .with_settings(config.executor_settings())
//!         .with_session(session);
//!
//!     let outcome = executor
//!         .run_named("fetch-title", RunRequest::new(serde_json::json!({})))
//!         .await;
//!     println!("{}", outcome.to_json_pretty()?);
//!     Ok(())
//! }
//! ```

pub mod cdp;
pub mod config;
pub mod engine;
pub mod env;
pub mod output;
pub mod recipe;

pub use cdp::{
    CdpError, ConnectionManager, ConnectionOptions, DebuggerAddress, EvaluateOptions, RetryPolicy,
    Session, SessionState,
};
pub use config::{ConfigError, EngineConfig};
pub use engine::{
    EngineError, ErrorKind, ExecutionOutcome, RecipeExecutor, RunRequest, StepLogger, TaskContext,
};
pub use env::{EnvResolution, EnvResolver};
pub use output::{Destination, OutputError, OutputHandler};
pub use recipe::{RecipeBundle, RecipeError, RecipeRegistry, Runtime, WorkflowContext};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cdp::{
        CdpError, ConnectionManager, DebuggerAddress, EvaluateOptions, Session, SessionState,
    };
    pub use crate::config::EngineConfig;
    pub use crate::engine::{ErrorKind, ExecutionOutcome, RecipeExecutor, RunRequest};
    pub use crate::output::OutputHandler;
    pub use crate::recipe::{RecipeRegistry, Runtime, WorkflowContext};
}
