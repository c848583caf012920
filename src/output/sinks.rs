//! Stdout and clipboard sinks

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

/// Somewhere text can be written, normally the process stdout
pub trait TextSink: Send + Sync {
    fn write_text(&self, text: &str) -> std::io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutSink;

impl TextSink for StdoutSink {
    fn write_text(&self, text: &str) -> std::io::Result<()> {
        let mut out = std::io::stdout().lock();
        out.write_all(text.as_bytes())?;
        out.flush()
    }
}

/// Collects everything written; clones share the buffer
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    buffer: Arc<Mutex<String>>,
}

impl MemorySink {
    pub fn contents(&self) -> String {
        self.buffer.lock().clone()
    }
}

impl TextSink for MemorySink {
    fn write_text(&self, text: &str) -> std::io::Result<()> {
        self.buffer.lock().push_str(text);
        Ok(())
    }
}

pub trait ClipboardSink: Send + Sync {
    fn set_text(&self, text: &str) -> Result<(), String>;
}

/// The desktop clipboard
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClipboard;

impl ClipboardSink for SystemClipboard {
    fn set_text(&self, text: &str) -> Result<(), String> {
        let mut clipboard = arboard::Clipboard::new().map_err(|e| e.to_string())?;
        clipboard.set_text(text).map_err(|e| e.to_string())
    }
}

/// Clipboard stand-in that remembers the last text; optionally always fails
#[derive(Debug, Clone, Default)]
pub struct MemoryClipboard {
    text: Arc<Mutex<Option<String>>>,
    failure: Option<String>,
}

impl MemoryClipboard {
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            text: Arc::default(),
            failure: Some(reason.into()),
        }
    }

    pub fn text(&self) -> Option<String> {
        self.text.lock().clone()
    }
}

impl ClipboardSink for MemoryClipboard {
    fn set_text(&self, text: &str) -> Result<(), String> {
        if let Some(reason) = &self.failure {
            return Err(reason.clone());
        }
        *self.text.lock() = Some(text.to_string());
        Ok(())
    }
}
