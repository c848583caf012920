//! Output delivery
//!
//! - `destination` - parsing destination strings
//! - `handler` - validating destinations and writing the outcome to them
//! - `sinks` - stdout and clipboard seams, system and in-memory versions

pub mod destination;
pub mod handler;
pub mod sinks;

pub use destination::Destination;
pub use handler::{DeliveryReport, OutputHandler};
pub use sinks::{ClipboardSink, MemoryClipboard, MemorySink, StdoutSink, SystemClipboard, TextSink};

/// Delivery errors; destinations before the failing one stay written
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutputError {
    #[error("Output target '{target}' is not declared by the recipe")]
    Unsupported {
        target: String,
        delivered: Vec<String>,
    },

    #[error("Writing to '{target}' failed: {reason}")]
    Write {
        target: String,
        delivered: Vec<String>,
        reason: String,
    },
}

impl OutputError {
    /// The destination that failed
    pub fn target(&self) -> &str {
        match self {
            OutputError::Unsupported { target, .. } | OutputError::Write { target, .. } => target,
        }
    }

    /// Destinations written before the failure
    pub fn delivered(&self) -> &[String] {
        match self {
            OutputError::Unsupported { delivered, .. } | OutputError::Write { delivered, .. } => {
                delivered
            }
        }
    }
}
