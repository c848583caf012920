//! Recipe executor
//!
//! Resolves the environment, picks the runtime strategy for the bundle and
//! folds whatever happens into an `ExecutionOutcome`. Workflows get a
//! call-back server so they can run atomic recipes through the same path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::callback::{CallbackHandler, CallbackServer, NestedRun};
use super::collaborators::{NoTaskContext, StepLogger, StepRecord, TaskContext, TracingStepLogger};
use super::error::EngineError;
use super::result::ExecutionOutcome;
use super::runtime::{in_page, subprocess};
use crate::cdp::Session;
use crate::env::{EnvResolution, EnvResolver};
use crate::recipe::{RecipeBundle, RecipeRegistry, Runtime, WorkflowContext, MAX_TIMEOUT_SECS};

pub const RECIPE_ENV: &str = "PAGEWRIGHT_RECIPE";
pub const OUTPUT_DIR_ENV: &str = "PAGEWRIGHT_OUTPUT_DIR";

/// Fallback when neither the caller nor the recipe sets a timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub default_timeout: Duration,
    /// Interpreter override for python recipes
    pub python: Option<String>,
    /// Interpreter override for shell recipes
    pub shell: Option<String>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            python: None,
            shell: None,
        }
    }
}

/// Caller-supplied inputs for one run
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub params: Value,
    pub overrides: HashMap<String, String>,
    pub context: Option<WorkflowContext>,
    pub timeout: Option<Duration>,
}

impl RunRequest {
    pub fn new(params: Value) -> Self {
        Self {
            params,
            ..Default::default()
        }
    }

    pub fn with_overrides(mut self, overrides: HashMap<String, String>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_context(mut self, context: WorkflowContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Clone)]
pub struct RecipeExecutor {
    registry: RecipeRegistry,
    resolver: EnvResolver,
    session: Option<Session>,
    task: Arc<dyn TaskContext>,
    logger: Arc<dyn StepLogger>,
    settings: ExecutorSettings,
}

impl RecipeExecutor {
    pub fn new(registry: RecipeRegistry, resolver: EnvResolver) -> Self {
        Self {
            registry,
            resolver,
            session: None,
            task: Arc::new(NoTaskContext),
            logger: Arc::new(TracingStepLogger),
            settings: ExecutorSettings::default(),
        }
    }

    /// Browser session used by in-page recipes
    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_task_context(mut self, task: Arc<dyn TaskContext>) -> Self {
        self.task = task;
        self
    }

    pub fn with_step_logger(mut self, logger: Arc<dyn StepLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn registry(&self) -> &RecipeRegistry {
        &self.registry
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn task_context(&self) -> &Arc<dyn TaskContext> {
        &self.task
    }

    /// Resolve `name` and run it; resolution failures become outcomes too
    pub async fn run_named(&self, name: &str, request: RunRequest) -> ExecutionOutcome {
        self.run_named_from(name, request, None).await
    }

    /// Run an already resolved bundle
    pub async fn run(&self, bundle: &RecipeBundle, request: RunRequest) -> ExecutionOutcome {
        self.execute(bundle, request, None).await
    }

    async fn run_named_from(
        &self,
        name: &str,
        request: RunRequest,
        parent: Option<&str>,
    ) -> ExecutionOutcome {
        let started = Instant::now();
        match self.registry.resolve(name) {
            Ok(bundle) => self.execute(&bundle, request, parent).await,
            Err(e) => {
                let error = EngineError::from(e);
                warn!(recipe = name, error = %error, "Recipe resolution failed");
                ExecutionOutcome::failure(name, None, &error, started.elapsed())
            }
        }
    }

    async fn execute(
        &self,
        bundle: &RecipeBundle,
        request: RunRequest,
        parent: Option<&str>,
    ) -> ExecutionOutcome {
        let runtime = bundle.runtime();
        let started = Instant::now();
        self.logger
            .record(StepRecord::started(bundle.name(), Some(runtime), parent));

        let result = self.dispatch(bundle, request, parent.is_some()).await;
        let elapsed = started.elapsed();

        let outcome = match result {
            Ok(data) => ExecutionOutcome::success(bundle.name(), runtime, data, elapsed),
            Err(error) => ExecutionOutcome::failure(bundle.name(), Some(runtime), &error, elapsed),
        };
        self.logger.record(StepRecord::finished(
            bundle.name(),
            Some(runtime),
            parent,
            elapsed,
            outcome.error_kind(),
        ));
        outcome
    }

    async fn dispatch(
        &self,
        bundle: &RecipeBundle,
        request: RunRequest,
        nested: bool,
    ) -> Result<Value, EngineError> {
        if nested && bundle.is_workflow() {
            return Err(EngineError::NestedWorkflow(bundle.name().to_string()));
        }

        let params = bundle
            .metadata
            .check_params(&request.params)
            .map_err(|reasons| EngineError::InvalidParams {
                recipe: bundle.name().to_string(),
                reasons,
            })?;

        let context = match request.context {
            Some(context) => Some(context),
            None if bundle.is_workflow() => Some(WorkflowContext::new()),
            None => None,
        };

        let env = self
            .resolver
            .resolve(bundle, &request.overrides, context.as_ref());
        if !env.is_complete() {
            return Err(EngineError::MissingEnv {
                recipe: bundle.name().to_string(),
                missing: env.missing_required,
            });
        }

        let timeout = request
            .timeout
            .or_else(|| bundle.timeout())
            .unwrap_or(self.settings.default_timeout)
            .min(Duration::from_secs(MAX_TIMEOUT_SECS));
        debug!(recipe = bundle.name(), ?timeout, vars = env.vars.len(), "Dispatching recipe");

        match bundle.runtime() {
            Runtime::ChromeJs => {
                let session = self
                    .session
                    .as_ref()
                    .ok_or_else(|| EngineError::NoSession(bundle.name().to_string()))?;
                in_page::run(session, bundle, &params, timeout).await
            }
            Runtime::Python | Runtime::Shell => {
                self.run_interpreter(bundle, &params, env, context, timeout)
                    .await
            }
        }
    }

    async fn run_interpreter(
        &self,
        bundle: &RecipeBundle,
        params: &Value,
        env: EnvResolution,
        context: Option<WorkflowContext>,
        timeout: Duration,
    ) -> Result<Value, EngineError> {
        let runtime = bundle.runtime();
        let configured = match runtime {
            Runtime::Python => self.settings.python.as_deref(),
            Runtime::Shell => self.settings.shell.as_deref(),
            Runtime::ChromeJs => None,
        };
        let program = subprocess::resolve_interpreter(runtime, configured)?;

        let output_dir = self
            .task
            .output_dir()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| bundle.directory().to_path_buf());

        let mut vars = env.vars;
        vars.insert(RECIPE_ENV.to_string(), bundle.name().to_string());
        vars.insert(
            OUTPUT_DIR_ENV.to_string(),
            output_dir.to_string_lossy().into_owned(),
        );

        let server = match (bundle.is_workflow(), context) {
            (true, Some(context)) => {
                let runner = Arc::new(NestedRunner {
                    executor: self.clone(),
                    context: context.clone(),
                    parent: bundle.name().to_string(),
                });
                let server = CallbackServer::start(runner, context)
                    .await
                    .map_err(|e| EngineError::Spawn {
                        recipe: bundle.name().to_string(),
                        source: e,
                    })?;
                vars.extend(server.env_vars());
                Some(server)
            }
            _ => None,
        };

        let params_json = serde_json::to_string(params).map_err(|e| EngineError::Execution {
            recipe: bundle.name().to_string(),
            message: format!("failed to encode params: {}", e),
            stdout: None,
            stderr: None,
            exit_code: None,
        })?;

        let spec = subprocess::ProcessSpec {
            recipe: bundle.name().to_string(),
            program,
            args: vec![
                bundle.payload_path.to_string_lossy().into_owned(),
                params_json,
            ],
            env: vars,
            cwd: bundle.directory().to_path_buf(),
            timeout,
        };

        let result = subprocess::run(&spec).await;
        if let Some(server) = server {
            debug!(recipe = bundle.name(), calls = server.handled(), "Workflow finished");
            server.shutdown();
        }
        let output = result?;

        if !output.success() {
            let message = match output.exit_code {
                Some(code) => format!("process exited with status {}", code),
                None => "process was terminated by a signal".to_string(),
            };
            return Err(EngineError::Execution {
                recipe: bundle.name().to_string(),
                message,
                stdout: Some(output.stdout),
                stderr: Some(output.stderr),
                exit_code: output.exit_code,
            });
        }

        subprocess::parse_stdout(&output.stdout).map_err(|message| EngineError::Execution {
            recipe: bundle.name().to_string(),
            message,
            stdout: Some(output.stdout.clone()),
            stderr: Some(output.stderr.clone()),
            exit_code: output.exit_code,
        })
    }
}

/// Serves `recipe.run` for one workflow: atomic recipes, shared context
struct NestedRunner {
    executor: RecipeExecutor,
    context: WorkflowContext,
    parent: String,
}

#[async_trait]
impl CallbackHandler for NestedRunner {
    async fn run_recipe(&self, run: NestedRun) -> ExecutionOutcome {
        let request = RunRequest {
            params: run.params,
            overrides: run.env,
            context: Some(self.context.clone()),
            timeout: run.timeout_secs.map(Duration::from_secs),
        };
        self.executor
            .run_named_from(&run.name, request, Some(&self.parent))
            .await
    }
}
