#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pagewright::cdp::{ConnectionManager, ConnectionOptions, DebuggerAddress, RetryPolicy, Session};
use pagewright::env::{AmbientEnv, EnvResolver};
use pagewright::recipe::{RecipeRegistry, StorageRoot, Tier};
use pagewright::RecipeExecutor;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

pub fn create_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// How the fake browser answers one command
#[derive(Debug, Clone)]
pub enum Reply {
    Result(Value),
    Error(i64, String),
    /// Answer after a pause; other commands are answered meanwhile
    Delayed(Duration, Value),
    /// Never answer
    Silent,
    /// Drop the WebSocket connection
    Close,
}

pub type Handler = Arc<dyn Fn(&str, &Value) -> Reply + Send + Sync>;

/// An in-process stand-in for a browser's remote-debugging endpoint
pub struct FakeBrowser {
    pub http_addr: SocketAddr,
    pub ws_addr: SocketAddr,
    received: Arc<Mutex<Vec<(String, Value)>>>,
    connections: Arc<AtomicUsize>,
    tasks: Vec<JoinHandle<()>>,
}

impl FakeBrowser {
    pub async fn start(handler: Handler) -> Self {
        let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = ws_listener.local_addr().unwrap();
        let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_addr = http_listener.local_addr().unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let ws_url = format!("ws://{}/devtools/page/FAKE-PAGE", ws_addr);
        let http_task = tokio::spawn(serve_http(http_listener, ws_url));
        let ws_task = tokio::spawn(serve_ws(
            ws_listener,
            handler,
            received.clone(),
            connections.clone(),
        ));

        Self {
            http_addr,
            ws_addr,
            received,
            connections,
            tasks: vec![http_task, ws_task],
        }
    }

    /// A browser that answers the handshake and evaluates nothing but the
    /// ready-state probe
    pub async fn start_default() -> Self {
        Self::start(Arc::new(|method, params| default_reply(method, params))).await
    }

    pub fn address(&self) -> DebuggerAddress {
        DebuggerAddress::new("127.0.0.1", self.http_addr.port())
    }

    pub fn received(&self) -> Vec<(String, Value)> {
        self.received.lock().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.received().into_iter().map(|(m, _)| m).collect()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for FakeBrowser {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Wrap a value the way `Runtime.evaluate` reports it
pub fn remote_value(value: Value) -> Reply {
    let kind = match &value {
        Value::Null => "object",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        _ => "object",
    };
    Reply::Result(json!({ "result": { "type": kind, "value": value } }))
}

pub fn thrown(description: &str) -> Reply {
    Reply::Result(json!({
        "result": { "type": "object", "subtype": "error", "description": description },
        "exceptionDetails": {
            "text": "Uncaught",
            "lineNumber": 0,
            "columnNumber": 0,
            "exception": { "type": "object", "subtype": "error", "description": description }
        }
    }))
}

/// Handshake and navigation support shared by most handlers
pub fn default_reply(method: &str, params: &Value) -> Reply {
    match method {
        "Page.navigate" => Reply::Result(json!({ "frameId": "FRAME-1", "loaderId": "L-1" })),
        "Runtime.evaluate" => {
            let expression = params["expression"].as_str().unwrap_or_default();
            if expression == "document.readyState" {
                remote_value(json!("complete"))
            } else {
                remote_value(Value::Null)
            }
        }
        _ => Reply::Result(json!({})),
    }
}

async fn serve_http(listener: TcpListener, ws_url: String) {
    while let Ok((mut stream, _)) = listener.accept().await {
        let ws_url = ws_url.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let mut request = Vec::new();
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        request.extend_from_slice(&buf[..n]);
                        if request.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                }
            }

            let text = String::from_utf8_lossy(&request);
            let target = json!({
                "id": "FAKE-PAGE",
                "type": "page",
                "title": "about:blank",
                "url": "about:blank",
                "webSocketDebuggerUrl": ws_url,
            });
            let body = if text.starts_with("GET /json/list") {
                json!([target]).to_string()
            } else if text.contains("/json/new") {
                target.to_string()
            } else {
                "{}".to_string()
            };
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}

async fn serve_ws(
    listener: TcpListener,
    handler: Handler,
    received: Arc<Mutex<Vec<(String, Value)>>>,
    connections: Arc<AtomicUsize>,
) {
    while let Ok((stream, _)) = listener.accept().await {
        connections.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve_ws_connection(stream, handler.clone(), received.clone()));
    }
}

async fn serve_ws_connection(
    stream: TcpStream,
    handler: Handler,
    received: Arc<Mutex<Vec<(String, Value)>>>,
) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(Ok(message)) = source.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let id = frame["id"].clone();
        let method = frame["method"].as_str().unwrap_or_default().to_string();
        let params = frame.get("params").cloned().unwrap_or(Value::Null);
        received.lock().push((method.clone(), params.clone()));

        match handler(&method, &params) {
            Reply::Result(result) => {
                let _ = tx.send(Message::Text(json!({ "id": id, "result": result }).to_string()));
            }
            Reply::Error(code, message) => {
                let _ = tx.send(Message::Text(
                    json!({ "id": id, "error": { "code": code, "message": message } }).to_string(),
                ));
            }
            Reply::Delayed(delay, result) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ =
                        tx.send(Message::Text(json!({ "id": id, "result": result }).to_string()));
                });
            }
            Reply::Silent => {}
            Reply::Close => {
                let _ = tx.send(Message::Close(None));
                break;
            }
        }
    }
    drop(tx);
    let _ = writer.await;
}

/// Options with short timeouts so failures surface quickly
pub fn fast_options() -> ConnectionOptions {
    ConnectionOptions {
        command_timeout: Duration::from_secs(5),
        handshake_timeout: Duration::from_secs(2),
        discovery_timeout: Duration::from_secs(2),
        sweep_interval: Duration::from_millis(10),
        auto_reconnect: false,
        bypass_proxy_for_loopback: true,
        proxy_policy: quick_policy(2),
    }
}

pub fn quick_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(10),
        multiplier: 1.0,
        jitter: Duration::ZERO,
        ..RetryPolicy::standard()
    }
}

pub async fn connect(browser: &FakeBrowser, options: ConnectionOptions) -> Session {
    ConnectionManager::new(options)
        .unwrap()
        .connect(&browser.address(), quick_policy(2))
        .await
        .expect("Failed to connect to fake browser")
}

/// Write a bundle directory `<root>/<name>/` with a YAML metadata file, atomic unless `metadata` names a kind
pub fn write_recipe(root: &Path, name: &str, metadata: &str, payload_file: &str, payload: &str) {
    let dir = root.join(name);
    fs::create_dir_all(&dir).expect("Failed to create recipe dir");
    let declares_kind = metadata
        .lines()
        .any(|line| line.starts_with("type:") || line.starts_with("kind:"));
    let kind = if declares_kind { "" } else { "type: atomic\n" };
    fs::write(dir.join("recipe.yaml"), format!("name: {}\n{}{}", name, kind, metadata))
        .expect("Failed to write recipe metadata");
    fs::write(dir.join(payload_file), payload).expect("Failed to write recipe payload");
}

pub fn shell_recipe(root: &Path, name: &str, metadata: &str, script: &str) {
    write_recipe(
        root,
        name,
        &format!("runtime: shell\n{}", metadata),
        "recipe.sh",
        script,
    );
}

/// Executor over one project root with an empty, fixed ambient environment
pub fn executor_for(root: &Path) -> RecipeExecutor {
    executor_with_env(root, HashMap::new())
}

pub fn executor_with_env(root: &Path, ambient: HashMap<String, String>) -> RecipeExecutor {
    let registry = RecipeRegistry::new(vec![StorageRoot::new(Tier::Project, root)]);
    let resolver = EnvResolver::new(None, None).with_ambient(AmbientEnv::fixed(ambient));
    RecipeExecutor::new(registry, resolver)
}
