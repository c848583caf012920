//! Engine configuration
//!
//! Loaded from the first of `<project>/.pagewright/config.yaml` and
//! `~/.pagewright/config.yaml`; every field has a default, so no file at all
//! is a valid configuration.
//!
//! ```yaml
//! default_timeout_secs: 120
//!
//! cdp:
//!   host: 127.0.0.1
//!   port: 9222
//!   command_timeout_secs: 30
//!   retry:
//!     max_attempts: 3
//!     base_delay_ms: 2000
//!
//! recipes:
//!   examples: /opt/pagewright/recipes
//!
//! runtimes:
//!   python: /usr/bin/python3.12
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::cdp::{ConnectionOptions, DebuggerAddress, RetryPolicy};
use crate::engine::ExecutorSettings;
use crate::env::EnvResolver;
use crate::recipe::{RecipeRegistry, StorageRoot, Tier, MAX_TIMEOUT_SECS};

pub const CONFIG_DIR: &str = ".pagewright";
pub const CONFIG_FILE: &str = "config.yaml";

pub const HOST_ENV: &str = "PAGEWRIGHT_CDP_HOST";
pub const PORT_ENV: &str = "PAGEWRIGHT_CDP_PORT";
pub const TIMEOUT_ENV: &str = "PAGEWRIGHT_TIMEOUT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error in {file}: {error}")]
    Yaml {
        file: String,
        #[source]
        error: serde_yaml::Error,
    },

    #[error("Invalid value for {var}: '{value}'")]
    InvalidOverride { var: &'static str, value: String },
}

/// Retry schedule overrides; each omitted field keeps the base policy's value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<u64>,
}

impl RetryConfig {
    fn to_policy(&self, mut base: RetryPolicy) -> RetryPolicy {
        if let Some(attempts) = self.max_attempts {
            base.max_attempts = attempts.max(1);
        }
        if let Some(ms) = self.base_delay_ms {
            base.base_delay = Duration::from_millis(ms);
        }
        if let Some(multiplier) = self.multiplier {
            base.multiplier = multiplier;
        }
        if let Some(ms) = self.jitter_ms {
            base.jitter = Duration::from_millis(ms);
        }
        base
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CdpConfig {
    pub host: String,
    pub port: u16,
    pub command_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub discovery_timeout_secs: u64,
    pub sweep_interval_ms: u64,
    pub auto_reconnect: bool,
    pub bypass_proxy_for_loopback: bool,
    pub retry: RetryConfig,
    pub proxy_retry: RetryConfig,
}

impl Default for CdpConfig {
    fn default() -> Self {
        let address = DebuggerAddress::default();
        let options = ConnectionOptions::default();
        Self {
            host: address.host,
            port: address.port,
            command_timeout_secs: options.command_timeout.as_secs(),
            handshake_timeout_secs: options.handshake_timeout.as_secs(),
            discovery_timeout_secs: options.discovery_timeout.as_secs(),
            sweep_interval_ms: options.sweep_interval.as_millis() as u64,
            auto_reconnect: options.auto_reconnect,
            bypass_proxy_for_loopback: options.bypass_proxy_for_loopback,
            retry: RetryConfig::default(),
            proxy_retry: RetryConfig::default(),
        }
    }
}

/// Recipe tier roots; relative paths are taken from the project directory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecipesConfig {
    pub project: Option<PathBuf>,
    pub user: Option<PathBuf>,
    pub examples: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvFilesConfig {
    pub project: Option<PathBuf>,
    pub user: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimesConfig {
    pub python: Option<String>,
    pub shell: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cdp: CdpConfig,
    pub recipes: RecipesConfig,
    pub env: EnvFilesConfig,
    pub runtimes: RuntimesConfig,
    pub default_timeout_secs: u64,

    /// Directory the relative paths above are resolved against
    #[serde(skip)]
    pub project_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cdp: CdpConfig::default(),
            recipes: RecipesConfig::default(),
            env: EnvFilesConfig::default(),
            runtimes: RuntimesConfig::default(),
            default_timeout_secs: crate::engine::DEFAULT_TIMEOUT.as_secs(),
            project_dir: PathBuf::from("."),
        }
    }
}

impl EngineConfig {
    /// Load the first config file found for `project_dir`, then apply
    /// environment overrides
    pub fn load(project_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let project_dir = project_dir.as_ref();
        let candidates = [
            Some(project_dir.join(CONFIG_DIR).join(CONFIG_FILE)),
            dirs::home_dir().map(|home| home.join(CONFIG_DIR).join(CONFIG_FILE)),
        ];

        let mut config = match candidates.into_iter().flatten().find(|p| p.is_file()) {
            Some(path) => {
                debug!(path = %path.display(), "Loading engine config");
                Self::from_file(&path)?
            }
            None => Self::default(),
        };
        config.project_dir = project_dir.to_path_buf();
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_yaml(&content, &path.display().to_string())
    }

    pub fn from_yaml(content: &str, file: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| ConfigError::Yaml {
            file: file.to_string(),
            error: e,
        })
    }

    /// Apply `PAGEWRIGHT_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(HOST_ENV).filter(|h| !h.trim().is_empty()) {
            self.cdp.host = host.trim().to_string();
        }
        if let Some(port) = lookup(PORT_ENV) {
            self.cdp.port = port.trim().parse().map_err(|_| ConfigError::InvalidOverride {
                var: PORT_ENV,
                value: port.clone(),
            })?;
        }
        if let Some(secs) = lookup(TIMEOUT_ENV) {
            self.default_timeout_secs = secs
                .trim()
                .parse()
                .ok()
                .filter(|s| (1..=MAX_TIMEOUT_SECS).contains(s))
                .ok_or_else(|| ConfigError::InvalidOverride {
                    var: TIMEOUT_ENV,
                    value: secs.clone(),
                })?;
        }
        Ok(())
    }

    fn anchored(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    fn home_config_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(CONFIG_DIR))
    }

    pub fn address(&self) -> DebuggerAddress {
        DebuggerAddress::new(self.cdp.host.clone(), self.cdp.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.cdp.retry.to_policy(RetryPolicy::standard())
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        let proxy_policy = self.cdp.proxy_retry.to_policy(RetryPolicy::proxy());
        ConnectionOptions {
            command_timeout: Duration::from_secs(self.cdp.command_timeout_secs),
            handshake_timeout: Duration::from_secs(self.cdp.handshake_timeout_secs),
            discovery_timeout: Duration::from_secs(self.cdp.discovery_timeout_secs),
            sweep_interval: Duration::from_millis(self.cdp.sweep_interval_ms.max(1)),
            auto_reconnect: self.cdp.auto_reconnect,
            bypass_proxy_for_loopback: self.cdp.bypass_proxy_for_loopback,
            proxy_policy,
        }
    }

    /// Tier roots in lookup order: project, user, examples
    pub fn storage_roots(&self) -> Vec<StorageRoot> {
        let project = match &self.recipes.project {
            Some(path) => self.anchored(path),
            None => self.project_dir.join(CONFIG_DIR).join("recipes"),
        };
        let user = match &self.recipes.user {
            Some(path) => Some(self.anchored(path)),
            None => Self::home_config_dir().map(|dir| dir.join("recipes")),
        };

        let mut roots = vec![StorageRoot::new(Tier::Project, project)];
        roots.extend(user.map(|path| StorageRoot::new(Tier::User, path)));
        roots.extend(
            self.recipes
                .examples
                .as_ref()
                .map(|path| StorageRoot::new(Tier::Examples, self.anchored(path))),
        );
        roots
    }

    pub fn registry(&self) -> RecipeRegistry {
        RecipeRegistry::new(self.storage_roots())
    }

    pub fn env_resolver(&self) -> EnvResolver {
        let project = match &self.env.project {
            Some(path) => self.anchored(path),
            None => self.project_dir.join(CONFIG_DIR).join(".env"),
        };
        let user = match &self.env.user {
            Some(path) => Some(self.anchored(path)),
            None => Self::home_config_dir().map(|dir| dir.join(".env")),
        };
        EnvResolver::new(Some(project), user)
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            default_timeout: Duration::from_secs(self.default_timeout_secs.clamp(1, MAX_TIMEOUT_SECS)),
            python: self.runtimes.python.clone(),
            shell: self.runtimes.shell.clone(),
        }
    }
}
