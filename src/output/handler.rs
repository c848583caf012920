use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use super::destination::Destination;
use super::sinks::{ClipboardSink, StdoutSink, SystemClipboard, TextSink};
use super::OutputError;
use crate::engine::{ExecutionOutcome, NoTaskContext, TaskContext};
use crate::recipe::RecipeBundle;

/// What a successful delivery wrote
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    pub files: Vec<PathBuf>,
}

#[derive(Clone)]
pub struct OutputHandler {
    stdout: Arc<dyn TextSink>,
    clipboard: Arc<dyn ClipboardSink>,
    task: Arc<dyn TaskContext>,
}

impl Default for OutputHandler {
    fn default() -> Self {
        Self::new(Arc::new(NoTaskContext))
    }
}

impl OutputHandler {
    pub fn new(task: Arc<dyn TaskContext>) -> Self {
        Self {
            stdout: Arc::new(StdoutSink),
            clipboard: Arc::new(SystemClipboard),
            task,
        }
    }

    pub fn with_stdout(mut self, sink: Arc<dyn TextSink>) -> Self {
        self.stdout = sink;
        self
    }

    pub fn with_clipboard(mut self, clipboard: Arc<dyn ClipboardSink>) -> Self {
        self.clipboard = clipboard;
        self
    }

    /// Write `outcome` to each destination in order.
    ///
    /// No destinations means every target the recipe declares. A destination
    /// the recipe does not declare stops delivery; nothing already written is
    /// undone.
    pub fn deliver(
        &self,
        bundle: &RecipeBundle,
        outcome: &ExecutionOutcome,
        destinations: &[String],
    ) -> Result<DeliveryReport, OutputError> {
        let declared = bundle.metadata.declared_targets();
        let requested: Vec<Destination> = if destinations.is_empty() {
            declared
                .iter()
                .map(|t| Destination::from_target(*t))
                .collect()
        } else {
            destinations
                .iter()
                .filter_map(|d| d.parse().ok())
                .collect()
        };

        let mut report = DeliveryReport::default();
        let payload = outcome
            .to_json_pretty()
            .map_err(|e| OutputError::Write {
                target: requested.first().map(|d| d.to_string()).unwrap_or_default(),
                delivered: Vec::new(),
                reason: e.to_string(),
            })?;

        for destination in requested {
            let label = destination.to_string();
            let allowed = destination
                .target()
                .map(|t| declared.contains(&t))
                .unwrap_or(false);
            if !allowed {
                return Err(OutputError::Unsupported {
                    target: label,
                    delivered: report.delivered,
                });
            }

            let written = match &destination {
                Destination::Stdout => self
                    .stdout
                    .write_text(&format!("{}\n", payload))
                    .map_err(|e| e.to_string()),
                Destination::Clipboard => self.clipboard.set_text(&payload),
                Destination::File(path) => {
                    let path = self.file_path(bundle, path.as_deref());
                    write_file(&path, &payload).map(|()| report.files.push(path))
                }
                Destination::Named(_) => Ok(()),
            };

            if let Err(reason) = written {
                return Err(OutputError::Write {
                    target: label,
                    delivered: report.delivered,
                    reason,
                });
            }
            debug!(recipe = bundle.name(), destination = %label, "Delivered outcome");
            report.delivered.push(label);
        }

        info!(recipe = bundle.name(), destinations = ?report.delivered, "Output delivered");
        Ok(report)
    }

    fn base_dir(&self) -> PathBuf {
        self.task
            .output_dir()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn file_path(&self, bundle: &RecipeBundle, requested: Option<&Path>) -> PathBuf {
        match requested {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => self.base_dir().join(path),
            None => self.base_dir().join(format!("{}.json", bundle.name())),
        }
    }
}

fn write_file(path: &Path, payload: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("{}: {}", parent.display(), e))?;
    }
    std::fs::write(path, format!("{}\n", payload)).map_err(|e| format!("{}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DirectoryTaskContext;
    use crate::output::{MemoryClipboard, MemorySink};
    use crate::recipe::{RecipeRegistry, Runtime, StorageRoot, Tier};
    use serde_json::json;
    use std::fs;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn bundle(targets: &str) -> (TempDir, RecipeBundle) {
        let root = tempdir().unwrap();
        let dir = root.path().join("report");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("recipe.yaml"),
            format!("name: report\ntype: atomic\nruntime: shell\noutput_targets: {targets}\n"),
        )
        .unwrap();
        fs::write(dir.join("recipe.sh"), "echo '{}'\n").unwrap();
        let registry = RecipeRegistry::new(vec![StorageRoot::new(Tier::Project, root.path())]);
        let bundle = registry.resolve("report").unwrap();
        (root, bundle)
    }

    fn outcome() -> ExecutionOutcome {
        ExecutionOutcome::success("report", Runtime::Shell, json!({ "rows": 3 }), Duration::ZERO)
    }

    #[test]
    fn test_default_file_goes_to_task_dir() {
        let (_root, bundle) = bundle("[file]");
        let task_dir = tempdir().unwrap();
        let handler = OutputHandler::new(Arc::new(DirectoryTaskContext::new(task_dir.path())));

        let report = handler.deliver(&bundle, &outcome(), &["file".into()]).unwrap();
        let expected = task_dir.path().join("report.json");
        assert_eq!(report.files, vec![expected.clone()]);

        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(expected).unwrap()).unwrap();
        assert_eq!(written["data"]["rows"], 3);
    }

    #[test]
    fn test_empty_request_uses_declared_targets() {
        let (_root, bundle) = bundle("[stdout, clipboard]");
        let stdout = MemorySink::default();
        let clipboard = MemoryClipboard::default();
        let handler = OutputHandler::default()
            .with_stdout(Arc::new(stdout.clone()))
            .with_clipboard(Arc::new(clipboard.clone()));

        let report = handler.deliver(&bundle, &outcome(), &[]).unwrap();
        assert_eq!(report.delivered, vec!["stdout", "clipboard"]);
        assert!(stdout.contents().contains("\"rows\": 3"));
        assert!(clipboard.text().unwrap().contains("\"recipe\": \"report\""));
    }

    #[test]
    fn test_write_failure_names_target() {
        let (_root, bundle) = bundle("[stdout, clipboard]");
        let stdout = MemorySink::default();
        let handler = OutputHandler::default()
            .with_stdout(Arc::new(stdout.clone()))
            .with_clipboard(Arc::new(MemoryClipboard::failing("no display")));

        let err = handler
            .deliver(&bundle, &outcome(), &["stdout".into(), "clipboard".into()])
            .unwrap_err();
        assert_eq!(
            err,
            OutputError::Write {
                target: "clipboard".into(),
                delivered: vec!["stdout".into()],
                reason: "no display".into(),
            }
        );
        assert!(!stdout.contents().is_empty());
    }

    #[test]
    fn test_undeclared_file_target_rejected() {
        let (_root, bundle) = bundle("[stdout]");
        let task_dir = tempdir().unwrap();
        let handler = OutputHandler::new(Arc::new(DirectoryTaskContext::new(task_dir.path())))
            .with_stdout(Arc::new(MemorySink::default()));

        let err = handler
            .deliver(&bundle, &outcome(), &["file:out.json".into()])
            .unwrap_err();
        assert_eq!(err.target(), "file:out.json");
        assert!(err.delivered().is_empty());
        assert!(!task_dir.path().join("out.json").exists());
    }
}
