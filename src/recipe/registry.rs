//! Recipe registry
//!
//! Storage roots are searched in order (project, user, examples). The first
//! root containing the name wins outright; roots are never merged and
//! nothing is cached, so edits on disk apply to the next lookup.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::bundle::RecipeBundle;
use super::metadata::{RecipeKind, Runtime, METADATA_FILES};
use super::RecipeError;

/// Category directories below a root that are searched for bundles
pub const MAX_CATEGORY_DEPTH: usize = 3;

const PAYLOAD_EXTENSIONS: &[&str] = &["js", "py", "sh"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Project,
    User,
    Examples,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Project => "project",
            Tier::User => "user",
            Tier::Examples => "examples",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRoot {
    pub tier: Tier,
    pub path: PathBuf,
}

impl StorageRoot {
    pub fn new(tier: Tier, path: impl Into<PathBuf>) -> Self {
        Self {
            tier,
            path: path.into(),
        }
    }
}

/// Where a bundle lives on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleLocation {
    /// `<dir>/recipe.md` + `<dir>/recipe.<ext>`
    Directory(PathBuf),
    /// `<name>.md` + `<name>.<ext>` side by side
    FilePair { metadata: PathBuf },
}

impl BundleLocation {
    pub fn path(&self) -> &Path {
        match self {
            BundleLocation::Directory(dir) => dir,
            BundleLocation::FilePair { metadata } => metadata,
        }
    }

    pub fn metadata_path(&self) -> Option<PathBuf> {
        match self {
            BundleLocation::Directory(dir) => METADATA_FILES
                .iter()
                .map(|file| dir.join(file))
                .find(|path| path.is_file()),
            BundleLocation::FilePair { metadata } => Some(metadata.clone()),
        }
    }

    pub fn payload_path(&self, name: &str, runtime: Runtime) -> PathBuf {
        match self {
            BundleLocation::Directory(dir) => dir.join(runtime.payload_file()),
            BundleLocation::FilePair { metadata } => metadata
                .with_file_name(format!("{}.{}", name, runtime.payload_extension())),
        }
    }
}

/// One entry of `RecipeRegistry::list`
#[derive(Debug, Clone, Serialize)]
pub struct RecipeListing {
    pub name: String,
    pub tier: Tier,
    pub path: PathBuf,
    /// A same-named recipe in an earlier position wins resolution
    pub shadowed: bool,
    pub kind: Option<RecipeKind>,
    pub runtime: Option<Runtime>,
    pub version: Option<String>,
    pub description: Option<String>,
    /// Why the bundle failed to load, if it did
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RecipeRegistry {
    roots: Vec<StorageRoot>,
}

impl RecipeRegistry {
    pub fn new(roots: Vec<StorageRoot>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &[StorageRoot] {
        &self.roots
    }

    /// Find `name` in the first root that has it, then parse and validate it
    pub fn resolve(&self, name: &str) -> Result<RecipeBundle, RecipeError> {
        validate_name(name)?;

        for root in &self.roots {
            if let Some(location) = first_existing(&root.path, name) {
                debug!(recipe = name, tier = %root.tier, path = %location.path().display(), "Resolved recipe");
                return RecipeBundle::load(&location, root, name);
            }
        }

        Err(RecipeError::NotFound {
            name: name.to_string(),
            searched: self.roots.iter().map(|r| r.path.clone()).collect(),
        })
    }

    /// Every recipe in every root, in resolution order
    pub fn list(&self) -> Vec<RecipeListing> {
        let mut seen = HashSet::new();
        let mut listings = Vec::new();

        for root in &self.roots {
            for (name, location) in candidates(&root.path) {
                let shadowed = !seen.insert(name.clone());
                let listing = match RecipeBundle::load(&location, root, &name) {
                    Ok(bundle) => RecipeListing {
                        name,
                        tier: root.tier,
                        path: location.path().to_path_buf(),
                        shadowed,
                        kind: Some(bundle.kind()),
                        runtime: Some(bundle.runtime()),
                        version: bundle.metadata.version.clone(),
                        description: Some(bundle.metadata.description.clone())
                            .filter(|d| !d.is_empty()),
                        error: None,
                    },
                    Err(e) => {
                        warn!(recipe = %name, error = %e, "Skipping invalid recipe in listing");
                        RecipeListing {
                            name,
                            tier: root.tier,
                            path: location.path().to_path_buf(),
                            shadowed,
                            kind: None,
                            runtime: None,
                            version: None,
                            description: None,
                            error: Some(e.to_string()),
                        }
                    }
                };
                listings.push(listing);
            }
        }

        listings
    }
}

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").unwrap());

/// Reject names that could escape a storage root
pub fn validate_name(name: &str) -> Result<(), RecipeError> {
    if NAME_PATTERN.is_match(name) && !name.contains("..") {
        Ok(())
    } else {
        Err(RecipeError::InvalidName(name.to_string()))
    }
}

fn is_bundle_dir(dir: &Path) -> bool {
    METADATA_FILES.iter().any(|file| dir.join(file).is_file())
}

fn has_payload_sibling(metadata: &Path) -> bool {
    PAYLOAD_EXTENSIONS
        .iter()
        .any(|ext| metadata.with_extension(ext).is_file())
}

/// Sorted, visible subdirectories of `dir` that are categories, not bundles
fn category_dirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| !n.starts_with('.'))
                .unwrap_or(false)
        })
        .filter(|p| !is_bundle_dir(p))
        .collect();
    dirs.sort();
    dirs
}

/// Locate `name` inside one root: the root itself first, then category
/// directories breadth-first in sorted order. At each level a bundle
/// directory beats a file pair.
pub fn first_existing(root: &Path, name: &str) -> Option<BundleLocation> {
    let mut level = vec![root.to_path_buf()];

    for depth in 0..=MAX_CATEGORY_DEPTH {
        for dir in &level {
            let candidate = dir.join(name);
            // below the root only real bundles count; a category may share the name
            if candidate.is_dir() && (depth == 0 || is_bundle_dir(&candidate)) {
                return Some(BundleLocation::Directory(candidate));
            }
        }
        for dir in &level {
            let metadata = dir.join(format!("{}.md", name));
            if metadata.is_file() && has_payload_sibling(&metadata) {
                return Some(BundleLocation::FilePair { metadata });
            }
        }
        level = level.iter().flat_map(|d| category_dirs(d)).collect();
        if level.is_empty() {
            break;
        }
    }
    None
}

/// All bundles under one root, in the order `first_existing` would prefer them
fn candidates(root: &Path) -> Vec<(String, BundleLocation)> {
    let mut found = Vec::new();
    let mut level = vec![root.to_path_buf()];

    for _ in 0..=MAX_CATEGORY_DEPTH {
        let mut dirs = Vec::new();
        let mut pairs = Vec::new();

        for dir in &level {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                let stem = if path.is_dir() {
                    path.file_name()
                } else {
                    path.file_stem()
                };
                let Some(stem) = stem.and_then(|s| s.to_str()).map(String::from) else {
                    continue;
                };
                if validate_name(&stem).is_err() {
                    continue;
                }
                if path.is_dir() && is_bundle_dir(&path) {
                    dirs.push((stem, BundleLocation::Directory(path)));
                } else if path.extension().and_then(|e| e.to_str()) == Some("md")
                    && path.is_file()
                    && has_payload_sibling(&path)
                {
                    pairs.push((stem, BundleLocation::FilePair { metadata: path }));
                }
            }
        }

        dirs.sort_by(|a, b| a.1.path().cmp(b.1.path()));
        pairs.sort_by(|a, b| a.1.path().cmp(b.1.path()));
        found.extend(dirs);
        found.extend(pairs);

        level = level.iter().flat_map(|d| category_dirs(d)).collect();
        if level.is_empty() {
            break;
        }
    }
    found
}
