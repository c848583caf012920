//! Resolved recipe bundle

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use super::metadata::{parse_document, RecipeKind, RecipeMetadata, Runtime};
use super::registry::{BundleLocation, StorageRoot, Tier};
use super::RecipeError;

/// A recipe found in one tier, parsed and validated. Never cached.
#[derive(Debug, Clone)]
pub struct RecipeBundle {
    pub metadata: RecipeMetadata,
    pub tier: Tier,
    pub root: PathBuf,
    pub metadata_path: PathBuf,
    pub payload_path: PathBuf,
    /// Markdown body of `recipe.md`, when present
    pub documentation: Option<String>,
}

impl RecipeBundle {
    /// Parse and validate the bundle at `location`
    pub fn load(
        location: &BundleLocation,
        root: &StorageRoot,
        name: &str,
    ) -> Result<Self, RecipeError> {
        let metadata_path = location.metadata_path().ok_or_else(|| RecipeError::Validation {
            name: name.to_string(),
            path: location.path().to_path_buf(),
            reasons: vec!["no recipe.md, recipe.yaml or recipe.yml found".to_string()],
        })?;

        let (metadata, documentation) = parse_document(&metadata_path, name)?;
        let payload_path = location.payload_path(name, metadata.runtime);

        metadata
            .validate(name, &payload_path)
            .map_err(|reasons| RecipeError::Validation {
                name: name.to_string(),
                path: metadata_path.clone(),
                reasons,
            })?;

        debug!(
            recipe = name,
            tier = %root.tier,
            path = %metadata_path.display(),
            "Loaded recipe bundle"
        );

        Ok(Self {
            metadata,
            tier: root.tier,
            root: root.path.clone(),
            metadata_path,
            payload_path,
            documentation,
        })
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn runtime(&self) -> Runtime {
        self.metadata.runtime
    }

    pub fn kind(&self) -> RecipeKind {
        self.metadata.kind
    }

    pub fn is_workflow(&self) -> bool {
        self.metadata.kind == RecipeKind::Workflow
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.metadata.timeout()
    }

    /// Directory holding the bundle's files; used as working directory
    pub fn directory(&self) -> &Path {
        self.payload_path.parent().unwrap_or(&self.root)
    }

    pub fn read_payload(&self) -> Result<String, RecipeError> {
        std::fs::read_to_string(&self.payload_path)
            .map_err(|e| RecipeError::io(&self.payload_path, e))
    }
}
