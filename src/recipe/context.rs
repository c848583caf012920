//! Shared state for one workflow run
//!
//! Created per top-level workflow invocation and handed to every nested
//! recipe; its entries take part in environment resolution.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct WorkflowContext {
    run_id: Arc<str>,
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl WorkflowContext {
    /// Create an empty context with a generated run ID
    pub fn new() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string().into(),
            values: Arc::default(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    /// Returns the previous value
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.values.lock().insert(key.into(), value.into())
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        self.values.lock().remove(key)
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.values.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

impl Default for WorkflowContext {
    fn default() -> Self {
        Self::new()
    }
}
