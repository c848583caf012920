//! Session lifecycle
//!
//! A `Session` is the connected aggregate: the endpoint it reached, the live
//! transport, and the dispatcher correlating replies. Its state is published
//! on a watch channel so callers can observe reconnection.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::{ConnectionManager, DebuggerAddress, Endpoint, RetryPolicy};
use super::dispatcher::Dispatcher;
use super::protocol::CdpEvent;
use super::transport::{Transport, TransportEvent};
use super::CdpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Reconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Ready => "ready",
            SessionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

struct SessionInner {
    manager: ConnectionManager,
    address: DebuggerAddress,
    policy: RetryPolicy,
    endpoint: RwLock<Option<Endpoint>>,
    transport: RwLock<Option<Arc<Transport>>>,
    dispatcher: Arc<Dispatcher>,
    state: watch::Sender<SessionState>,
    auto_reconnect: AtomicBool,
    establishing: tokio::sync::Mutex<()>,
    sweeper: JoinHandle<()>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Handle to a browser session; clones share the same connection
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .field("endpoint", &*self.inner.endpoint.read())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        manager: ConnectionManager,
        address: DebuggerAddress,
        policy: RetryPolicy,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new());
        let sweeper = dispatcher.spawn_sweeper(manager.options().sweep_interval);
        let (state, _) = watch::channel(SessionState::Disconnected);
        let auto_reconnect = AtomicBool::new(manager.options().auto_reconnect);

        Self {
            inner: Arc::new(SessionInner {
                manager,
                address,
                policy,
                endpoint: RwLock::new(None),
                transport: RwLock::new(None),
                dispatcher,
                state,
                auto_reconnect,
                establishing: tokio::sync::Mutex::new(()),
                sweeper,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.endpoint.read().clone()
    }

    pub fn address(&self) -> &DebuggerAddress {
        &self.inner.address
    }

    pub fn command_timeout(&self) -> Duration {
        self.inner.manager.options().command_timeout
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.inner.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    /// Replies that arrived after their command had already been resolved
    pub fn discarded_replies(&self) -> u64 {
        self.inner.dispatcher.discarded_replies()
    }

    pub fn pending_commands(&self) -> usize {
        self.inner.dispatcher.pending_count()
    }

    /// Receive every future event named `method`
    pub fn subscribe(&self, method: &str) -> mpsc::UnboundedReceiver<CdpEvent> {
        self.inner.dispatcher.subscribe(method)
    }

    /// Send a command with the default command timeout
    pub async fn submit(&self, method: &str, params: Value) -> Result<Value, CdpError> {
        self.submit_with_timeout(method, params, self.command_timeout())
            .await
    }

    pub async fn submit_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CdpError> {
        let transport = self
            .inner
            .transport
            .read()
            .clone()
            .ok_or(CdpError::NotConnected)?;
        self.inner
            .dispatcher
            .submit(transport.as_ref(), method, params, timeout)
            .await
    }

    /// Drop the current connection and establish a fresh one.
    ///
    /// Commands still pending on the old connection are rejected, never resent.
    pub async fn reconnect(&self) -> Result<(), CdpError> {
        let previous = self.inner.transport.write().take();
        if let Some(transport) = previous {
            transport.close().await;
        }
        self.inner.dispatcher.fail_all("session reconnecting");
        self.establish_from(SessionState::Reconnecting).await
    }

    /// Close the connection and stop reconnecting
    pub async fn close(&self) {
        self.inner.auto_reconnect.store(false, Ordering::SeqCst);
        let previous = self.inner.transport.write().take();
        if let Some(transport) = previous {
            transport.close().await;
        }
        self.inner.dispatcher.fail_all("session closed");
        self.set_state(SessionState::Disconnected);
        info!(host = %self.inner.address.host, port = self.inner.address.port, "Browser session closed");
    }

    pub(crate) async fn establish(&self) -> Result<(), CdpError> {
        self.establish_from(SessionState::Connecting).await
    }

    async fn establish_from(&self, initial: SessionState) -> Result<(), CdpError> {
        let _guard = self.inner.establishing.lock().await;
        if initial == SessionState::Reconnecting && self.inner.transport.read().is_some() {
            return Ok(());
        }
        self.set_state(initial);

        let this = self.clone();
        let result = self
            .inner
            .manager
            .with_retry(&self.inner.policy, move |attempt| {
                let this = this.clone();
                async move { this.attempt_once(attempt).await }
            })
            .await;

        match result {
            Ok(endpoint) => {
                info!(
                    target = %endpoint.target_id,
                    url = %endpoint.websocket_url,
                    "Browser session ready"
                );
                self.set_state(SessionState::Ready);
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn attempt_once(&self, attempt: u32) -> Result<Endpoint, CdpError> {
        debug!(attempt, "Establishing browser session");
        let endpoint = self.inner.manager.discover(&self.inner.address).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Transport::open(&endpoint.websocket_url, events_tx).await?);
        spawn_pump(
            Arc::downgrade(&self.inner),
            self.inner.dispatcher.clone(),
            events_rx,
        );

        self.set_state(SessionState::Handshaking);
        if let Err(e) = self.handshake(&transport).await {
            transport.close().await;
            return Err(e);
        }

        *self.inner.endpoint.write() = Some(endpoint.clone());
        *self.inner.transport.write() = Some(transport);
        Ok(endpoint)
    }

    async fn handshake(&self, transport: &Transport) -> Result<(), CdpError> {
        let timeout = self.inner.manager.options().handshake_timeout;
        for method in ["Page.enable", "Runtime.enable"] {
            self.inner
                .dispatcher
                .submit(transport, method, json!({}), timeout)
                .await?;
        }
        Ok(())
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Session state changed");
        }
    }

    fn on_transport_lost(&self, reason: &str) {
        self.inner.transport.write().take();

        // An in-flight establish retries on its own
        let state = *self.inner.state.borrow();
        if matches!(state, SessionState::Connecting | SessionState::Handshaking) {
            debug!(reason, %state, "Connection lost while establishing");
            return;
        }

        if self.inner.auto_reconnect.load(Ordering::SeqCst) {
            warn!(reason, "Browser connection lost, reconnecting");
            self.set_state(SessionState::Reconnecting);
            let session = self.clone();
            tokio::spawn(async move {
                if let Err(e) = session.establish_from(SessionState::Reconnecting).await {
                    warn!(error = %e, "Automatic reconnection failed");
                }
            });
        } else {
            warn!(reason, "Browser connection lost");
            self.set_state(SessionState::Disconnected);
        }
    }
}

fn spawn_pump(
    session: Weak<SessionInner>,
    dispatcher: Arc<Dispatcher>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message(text) => dispatcher.handle_incoming(&text),
                TransportEvent::Lost(reason) => {
                    dispatcher.fail_all(&reason);
                    if let Some(inner) = session.upgrade() {
                        Session { inner }.on_transport_lost(&reason);
                    }
                    break;
                }
            }
        }
    });
}
