//! WebSocket transport
//!
//! Owns exactly one connection to a debugging endpoint. Writes go through a
//! mutex because the sink half is not safe for concurrent writers; a reader
//! task hands every text frame to the owner without interpreting it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use super::CdpError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// What the reader task reports to the owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One decoded text frame
    Message(String),
    /// The connection is gone; sent at most once per transport
    Lost(String),
}

/// Anything the dispatcher can write a serialized command to
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: String) -> Result<(), CdpError>;
}

pub struct Transport {
    url: String,
    sink: tokio::sync::Mutex<WsSink>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Transport {
    /// Connect to `url` and start forwarding frames to `events`
    pub async fn open(
        url: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, CdpError> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| CdpError::WebSocket(format!("{}: {}", url, e)))?;

        let (sink, source) = stream.split();
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(source, events, closed.clone()));

        debug!(url, "Debugger transport opened");

        Ok(Self {
            url: url.to_string(),
            sink: tokio::sync::Mutex::new(sink),
            closed,
            reader,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Write one text frame
    pub async fn send(&self, text: String) -> Result<(), CdpError> {
        if self.is_closed() {
            return Err(CdpError::ConnectionLost("transport closed".to_string()));
        }
        trace!(frame = %text, "CDP send");
        let mut sink = self.sink.lock().await;
        sink.send(Message::text(text)).await?;
        Ok(())
    }

    /// Owner-initiated close; no `Lost` notification follows
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut sink = self.sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
            debug!(url = %self.url, "Debugger transport closed");
        }
        self.reader.abort();
    }
}

#[async_trait]
impl FrameSink for Transport {
    async fn send_frame(&self, frame: String) -> Result<(), CdpError> {
        self.send(frame).await
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.reader.abort();
    }
}

async fn read_loop(
    mut source: WsSource,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
) {
    let reason = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => {
                trace!(frame = %text, "CDP recv");
                if events.send(TransportEvent::Message(text.to_string())).is_err() {
                    return;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|f| format!("closed by peer: {}", f.reason))
                    .unwrap_or_else(|| "closed by peer".to_string());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break e.to_string(),
            None => break "stream ended".to_string(),
        }
    };

    if !closed.swap(true, Ordering::SeqCst) {
        debug!(%reason, "Debugger transport lost");
        let _ = events.send(TransportEvent::Lost(reason));
    }
}
