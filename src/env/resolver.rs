use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::files::read_env_file;
use crate::recipe::{RecipeBundle, WorkflowContext};

/// Where a resolved value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvSource {
    Override,
    WorkflowContext,
    ProjectFile,
    UserFile,
    Process,
    Default,
}

impl fmt::Display for EnvSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnvSource::Override => "override",
            EnvSource::WorkflowContext => "workflow context",
            EnvSource::ProjectFile => "project env file",
            EnvSource::UserFile => "user env file",
            EnvSource::Process => "process environment",
            EnvSource::Default => "declared default",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnvResolution {
    pub vars: BTreeMap<String, String>,
    pub sources: BTreeMap<String, EnvSource>,
    /// Required variables no source could bind
    pub missing_required: Vec<String>,
}

impl EnvResolution {
    pub fn is_complete(&self) -> bool {
        self.missing_required.is_empty()
    }
}

/// Lookup into the surrounding process environment
#[derive(Clone)]
pub enum AmbientEnv {
    Process,
    Fixed(Arc<HashMap<String, String>>),
}

impl AmbientEnv {
    pub fn fixed(vars: HashMap<String, String>) -> Self {
        AmbientEnv::Fixed(Arc::new(vars))
    }

    fn get(&self, key: &str) -> Option<String> {
        match self {
            AmbientEnv::Process => std::env::var(key).ok(),
            AmbientEnv::Fixed(vars) => vars.get(key).cloned(),
        }
    }
}

impl fmt::Debug for AmbientEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmbientEnv::Process => f.write_str("Process"),
            AmbientEnv::Fixed(vars) => f.debug_tuple("Fixed").field(&vars.len()).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnvResolver {
    project_file: Option<PathBuf>,
    user_file: Option<PathBuf>,
    ambient: AmbientEnv,
}

impl EnvResolver {
    pub fn new(project_file: Option<PathBuf>, user_file: Option<PathBuf>) -> Self {
        Self {
            project_file,
            user_file,
            ambient: AmbientEnv::Process,
        }
    }

    /// Replace the process environment lookup, e.g. with a fixed map in tests
    pub fn with_ambient(mut self, ambient: AmbientEnv) -> Self {
        self.ambient = ambient;
        self
    }

    /// Bind every variable `bundle` declares. Env files are re-read on every call.
    ///
    /// Explicit overrides are passed through even for undeclared names.
    pub fn resolve(
        &self,
        bundle: &RecipeBundle,
        overrides: &HashMap<String, String>,
        context: Option<&WorkflowContext>,
    ) -> EnvResolution {
        let project = self
            .project_file
            .as_deref()
            .map(read_env_file)
            .unwrap_or_default();
        let user = self
            .user_file
            .as_deref()
            .map(read_env_file)
            .unwrap_or_default();
        let context_values = context.map(WorkflowContext::snapshot).unwrap_or_default();

        let mut resolution = EnvResolution::default();
        for (key, value) in overrides {
            resolution.vars.insert(key.clone(), value.clone());
            resolution.sources.insert(key.clone(), EnvSource::Override);
        }

        for (name, spec) in &bundle.metadata.env {
            if resolution.vars.contains_key(name) {
                continue;
            }

            let found = context_values
                .get(name)
                .cloned()
                .map(|v| (v, EnvSource::WorkflowContext))
                .or_else(|| project.get(name).cloned().map(|v| (v, EnvSource::ProjectFile)))
                .or_else(|| user.get(name).cloned().map(|v| (v, EnvSource::UserFile)))
                .or_else(|| self.ambient.get(name).map(|v| (v, EnvSource::Process)))
                .or_else(|| spec.default.clone().map(|v| (v, EnvSource::Default)));

            match found {
                Some((value, source)) => {
                    debug!(recipe = bundle.name(), var = %name, %source, "Resolved env var");
                    resolution.vars.insert(name.clone(), value);
                    resolution.sources.insert(name.clone(), source);
                }
                None if spec.required => resolution.missing_required.push(name.clone()),
                None => {}
            }
        }

        resolution
    }
}
