//! Interpreter runtime
//!
//! Runs `<interpreter> <payload> <params-json>` in its own process group.
//! Both streams are drained concurrently while waiting so a chatty child
//! never blocks on a full pipe. On timeout the whole group is killed.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::error::EngineError;
use crate::recipe::Runtime;

/// Time allowed for the streams to drain after the child exits or is killed
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause between SIGTERM and SIGKILL
#[cfg(unix)]
const KILL_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub recipe: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Find the interpreter for `runtime`, honouring a configured override
pub fn resolve_interpreter(
    runtime: Runtime,
    configured: Option<&str>,
) -> Result<PathBuf, EngineError> {
    let candidates: Vec<&str> = match (configured, runtime) {
        (Some(program), _) => vec![program],
        (None, Runtime::Python) => vec!["python3", "python"],
        (None, Runtime::Shell) => vec!["bash", "sh"],
        (None, Runtime::ChromeJs) => vec![],
    };

    candidates
        .iter()
        .find_map(|program| which::which(program).ok())
        .ok_or_else(|| EngineError::InterpreterNotFound {
            runtime: runtime.to_string(),
            program: candidates.join(" or "),
        })
}

/// Parse the child's stdout: exactly one JSON document, empty meaning `null`
pub fn parse_stdout(stdout: &str) -> Result<Value, String> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(trimmed)
        .map_err(|e| format!("stdout is not a single JSON document: {}", e))
}

/// Spawn the process described by `spec` and wait for it under its timeout
pub async fn run(spec: &ProcessSpec) -> Result<ProcessOutput, EngineError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    info!(
        recipe = %spec.recipe,
        program = %spec.program.display(),
        timeout = ?spec.timeout,
        "Spawning recipe process"
    );

    let mut child = cmd.spawn().map_err(|e| EngineError::Spawn {
        recipe: spec.recipe.clone(),
        source: e,
    })?;

    let stdout = spawn_reader(child.stdout.take());
    let stderr = spawn_reader(child.stderr.take());

    match tokio::time::timeout(spec.timeout, child.wait()).await {
        Ok(Ok(status)) => {
            let output = ProcessOutput {
                stdout: collect(stdout).await,
                stderr: collect(stderr).await,
                exit_code: status.code(),
            };
            debug!(recipe = %spec.recipe, exit_code = ?output.exit_code, "Recipe process exited");
            Ok(output)
        }
        Ok(Err(e)) => {
            terminate(&mut child).await;
            Err(EngineError::Execution {
                recipe: spec.recipe.clone(),
                message: format!("failed to wait for process: {}", e),
                stdout: None,
                stderr: None,
                exit_code: None,
            })
        }
        Err(_) => {
            warn!(recipe = %spec.recipe, timeout = ?spec.timeout, "Recipe timed out, killing process group");
            terminate(&mut child).await;
            Err(EngineError::Timeout {
                recipe: spec.recipe.clone(),
                after: spec.timeout,
                stdout: non_empty(collect(stdout).await),
                stderr: non_empty(collect(stderr).await),
            })
        }
    }
}

fn spawn_reader<R>(stream: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

async fn collect(reader: JoinHandle<String>) -> String {
    match tokio::time::timeout(DRAIN_TIMEOUT, reader).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            debug!("Output stream still open after drain timeout");
            String::new()
        }
    }
}

fn non_empty(text: String) -> Option<String> {
    (!text.is_empty()).then_some(text)
}

/// Kill the child's process group, then reap the child
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        kill_process_group(pid).await;
    }
    let _ = child.kill().await;
}

#[cfg(unix)]
async fn kill_process_group(leader: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let group = Pid::from_raw(leader as i32);
    if killpg(group, Signal::SIGTERM).is_ok() {
        tokio::time::sleep(KILL_GRACE).await;
        let _ = killpg(group, Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_leader: u32) {}
