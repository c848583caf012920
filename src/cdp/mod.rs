//! Remote-debugging protocol client
//!
//! This module talks JSON-over-WebSocket to a browser started with
//! `--remote-debugging-port`:
//! - `transport`: one WebSocket connection, serialized writes, reader task
//! - `dispatcher`: id allocation, pending-command table, deadline sweep, events
//! - `connection`: target discovery, retry policies, proxy classification
//! - `session`: the connected aggregate and its lifecycle state machine
//! - `commands`: typed page commands built on `Session::submit`
//! - `protocol`: wire message types

use std::time::Duration;

pub mod commands;
pub mod connection;
pub mod dispatcher;
pub mod protocol;
pub mod session;
pub mod transport;

pub use commands::{EvaluateOptions, NavigationResult};
pub use connection::{
    is_proxy_error, ConnectionManager, ConnectionOptions, DebuggerAddress, Endpoint, RetryKind,
    RetryPolicy,
};
pub use dispatcher::Dispatcher;
pub use protocol::{CdpEvent, TargetInfo};
pub use session::{Session, SessionState};
pub use transport::{FrameSink, Transport, TransportEvent};

/// Errors produced by the protocol client
#[derive(Debug, Clone, thiserror::Error)]
pub enum CdpError {
    #[error("Connection failed after {attempts} attempt(s): {cause}")]
    Connection {
        attempts: u32,
        proxy_related: bool,
        cause: String,
    },

    #[error("Target discovery failed: {0}")]
    Discovery(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Session is not connected")]
    NotConnected,

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Protocol error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("JavaScript exception: {0}")]
    JavaScript(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CdpError {
    /// Whether the error means the session could not be reached at all
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            CdpError::Connection { .. }
                | CdpError::Discovery(_)
                | CdpError::WebSocket(_)
                | CdpError::ConnectionLost(_)
                | CdpError::NotConnected
        )
    }
}

impl From<serde_json::Error> for CdpError {
    fn from(e: serde_json::Error) -> Self {
        CdpError::Serialization(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CdpError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        CdpError::WebSocket(e.to_string())
    }
}
