//! In-page runtime
//!
//! The payload runs inside the page through `Runtime.evaluate`. A timeout
//! only stops waiting; the script itself keeps running in the page.
//!
//! Only `params` are bound in the page. Resolved environment values never
//! reach the script: for this runtime the declared env is checked before
//! evaluation and a missing required variable stops the run.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::cdp::{CdpError, EvaluateOptions, Session};
use crate::engine::error::EngineError;
use crate::recipe::RecipeBundle;

/// Wrap `source` in a block that binds the caller's params.
///
/// The block's completion value is the recipe result; a returned promise is
/// awaited.
pub fn wrap_source(source: &str, params: &Value) -> Result<String, EngineError> {
    let params = serde_json::to_string(params).map_err(CdpError::from)?;
    Ok(format!(
        "{{\nconst params = Object.freeze({params});\nglobalThis.__PAGEWRIGHT_PARAMS__ = params;\n{source}\n}}"
    ))
}

pub async fn run(
    session: &Session,
    bundle: &RecipeBundle,
    params: &Value,
    timeout: Duration,
) -> Result<Value, EngineError> {
    let source = bundle.read_payload()?;
    let script = wrap_source(&source, params)?;
    debug!(recipe = bundle.name(), bytes = script.len(), "Evaluating recipe in page");

    match session
        .evaluate(&script, EvaluateOptions::with_timeout(timeout))
        .await
    {
        Ok(value) => Ok(value),
        Err(CdpError::Timeout { .. }) => Err(EngineError::Timeout {
            recipe: bundle.name().to_string(),
            after: timeout,
            stdout: None,
            stderr: None,
        }),
        Err(CdpError::JavaScript(message)) => Err(EngineError::Execution {
            recipe: bundle.name().to_string(),
            message,
            stdout: None,
            stderr: None,
            exit_code: None,
        }),
        Err(e) => Err(e.into()),
    }
}
