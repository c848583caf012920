//! Environment resolution for recipe runs
//!
//! Each variable a recipe declares is looked up in a fixed chain, first
//! hit wins: explicit overrides, the workflow context, the project env
//! file, the user env file, the process environment, the declared default.

mod files;
mod resolver;

pub use files::read_env_file;
pub use resolver::{AmbientEnv, EnvResolution, EnvResolver, EnvSource};
