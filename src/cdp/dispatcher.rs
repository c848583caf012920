//! Command dispatcher
//!
//! Correlates replies with commands by id. Every submitted command gets a
//! deadline; a periodic sweep rejects the ones that passed it. Whichever of
//! reply or sweep removes an entry from the pending table first decides the
//! outcome, so a caller is never resolved twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::protocol::{CdpEvent, CdpMessage, CdpRequest};
use super::transport::FrameSink;
use super::CdpError;

/// Stand-in deadline for timeouts too large to add to an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + timeout`, saturating at a deadline no run will reach
pub(crate) fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

struct PendingCommand {
    method: String,
    submitted_at: Instant,
    deadline: Instant,
    reply: oneshot::Sender<Result<Value, CdpError>>,
}

pub struct Dispatcher {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCommand>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<CdpEvent>>>>,
    discarded: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            discarded: AtomicU64::new(0),
        }
    }

    /// Send `method` through `sink` and wait for its reply, rejection or deadline
    pub async fn submit(
        &self,
        sink: &dyn FrameSink,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CdpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let params = if params.is_null() { json!({}) } else { params };
        let frame = serde_json::to_string(&CdpRequest {
            id,
            method,
            params: &params,
        })?;

        let (tx, rx) = oneshot::channel();
        let submitted_at = Instant::now();
        self.pending.lock().insert(
            id,
            PendingCommand {
                method: method.to_string(),
                submitted_at,
                deadline: deadline_after(submitted_at, timeout),
                reply: tx,
            },
        );

        trace!(id, method, "Submitting command");
        if let Err(e) = sink.send_frame(frame).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        rx.await
            .unwrap_or_else(|_| Err(CdpError::ConnectionLost("dispatcher shut down".to_string())))
    }

    /// Route one raw frame from the transport
    pub fn handle_incoming(&self, text: &str) {
        let message: CdpMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "Discarding unparseable protocol message");
                return;
            }
        };

        if let Some(id) = message.id {
            let entry = self.pending.lock().remove(&id);
            match entry {
                Some(command) => {
                    let result = match message.error {
                        Some(err) => Err(CdpError::Protocol {
                            code: err.code,
                            message: err.message,
                        }),
                        None => Ok(message.result.unwrap_or(Value::Null)),
                    };
                    trace!(id, method = %command.method, "Command resolved");
                    let _ = command.reply.send(result);
                }
                None => {
                    self.discarded.fetch_add(1, Ordering::SeqCst);
                    debug!(id, "Discarding reply for a command that is no longer pending");
                }
            }
        } else if let Some(method) = message.method {
            self.dispatch_event(CdpEvent {
                method,
                params: message.params.unwrap_or(Value::Null),
                session_id: message.session_id,
            });
        }
    }

    fn dispatch_event(&self, event: CdpEvent) {
        let mut subscribers = self.subscribers.lock();
        match subscribers.get_mut(&event.method) {
            Some(senders) => {
                senders.retain(|tx| tx.send(event.clone()).is_ok());
                if senders.is_empty() {
                    subscribers.remove(&event.method);
                }
            }
            None => trace!(method = %event.method, "Dropping event without subscribers"),
        }
    }

    /// Receive every future event named `method`
    pub fn subscribe(&self, method: &str) -> mpsc::UnboundedReceiver<CdpEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Reject every command whose deadline is at or before `now`
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<(u64, PendingCommand)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, command)| command.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|command| (id, command)))
                .collect()
        };

        let count = expired.len();
        for (id, command) in expired {
            let after = command.deadline.duration_since(command.submitted_at);
            warn!(id, method = %command.method, ?after, "Command deadline elapsed");
            let _ = command.reply.send(Err(CdpError::Timeout {
                operation: command.method,
                after,
            }));
        }
        count
    }

    /// Reject everything still pending, e.g. after the transport was lost
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingCommand> = self.pending.lock().drain().map(|(_, c)| c).collect();
        let count = drained.len();
        for command in drained {
            let _ = command
                .reply
                .send(Err(CdpError::ConnectionLost(reason.to_string())));
        }
        if count > 0 {
            warn!(count, reason, "Rejected pending commands");
        }
        count
    }

    /// Start the periodic deadline sweep; it stops once the dispatcher is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let dispatcher = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(dispatcher) = dispatcher.upgrade() else {
                    break;
                };
                dispatcher.sweep_expired(Instant::now());
            }
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Replies that arrived for ids no longer pending
    pub fn discarded_replies(&self) -> u64 {
        self.discarded.load(Ordering::SeqCst)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
