//! Recipe storage and metadata
//!
//! - `registry` - ordered storage tiers, name lookup and listing
//! - `metadata` - the declarative document and its validation rules
//! - `bundle` - a resolved recipe: metadata plus payload location
//! - `context` - key/value state shared by the steps of one workflow run

use std::path::PathBuf;

pub mod bundle;
pub mod context;
pub mod metadata;
pub mod registry;

pub use bundle::RecipeBundle;
pub use context::WorkflowContext;
pub use metadata::{
    EnvVarSpec, InputSpec, OutputSpec, OutputTarget, RecipeKind, RecipeMetadata, Runtime,
    MAX_TIMEOUT_SECS,
};
pub use registry::{BundleLocation, RecipeListing, RecipeRegistry, StorageRoot, Tier};

#[derive(Debug, thiserror::Error)]
pub enum RecipeError {
    #[error("Invalid recipe name '{0}': expected letters, digits, '.', '_' or '-'")]
    InvalidName(String),

    #[error("Recipe '{name}' not found in {} storage root(s)", .searched.len())]
    NotFound { name: String, searched: Vec<PathBuf> },

    #[error("Recipe '{name}' is invalid ({}): {}", .path.display(), .reasons.join("; "))]
    Validation {
        name: String,
        path: PathBuf,
        reasons: Vec<String>,
    },

    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RecipeError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RecipeError::Io {
            path: path.into(),
            source,
        }
    }
}
