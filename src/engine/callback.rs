//! Workflow call-back channel
//!
//! A workflow process reaches back into the engine over a loopback TCP
//! socket speaking line-delimited JSON-RPC 2.0. The address and a one-off
//! token are passed in the environment. Each connection must `auth` first.
//! Requests from all connections are handled one at a time, in arrival
//! order, so nested recipe calls never overlap.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::result::ExecutionOutcome;
use crate::recipe::WorkflowContext;

pub const CALLBACK_ADDR_ENV: &str = "PAGEWRIGHT_CALLBACK_ADDR";
pub const CALLBACK_TOKEN_ENV: &str = "PAGEWRIGHT_CALLBACK_TOKEN";

const PARSE_ERROR: i32 = -32700;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const UNAUTHORIZED: i32 = -32001;

/// JSON-RPC request
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC response
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// JSON-RPC error
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// Params of `recipe.run`
#[derive(Debug, Clone, Deserialize)]
pub struct NestedRun {
    pub name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Runs the recipes a workflow asks for
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    async fn run_recipe(&self, request: NestedRun) -> ExecutionOutcome;
}

#[derive(Deserialize)]
struct AuthParams {
    token: String,
}

#[derive(Deserialize)]
struct KeyParams {
    key: String,
}

#[derive(Deserialize)]
struct SetParams {
    key: String,
    value: Value,
}

struct ServerState {
    token: String,
    handler: Arc<dyn CallbackHandler>,
    context: WorkflowContext,
    gate: tokio::sync::Mutex<()>,
    handled: AtomicU64,
}

pub struct CallbackServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    acceptor: JoinHandle<()>,
}

impl CallbackServer {
    /// Bind an ephemeral loopback port and start accepting connections
    pub async fn start(
        handler: Arc<dyn CallbackHandler>,
        context: WorkflowContext,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(ServerState {
            token: uuid::Uuid::new_v4().simple().to_string(),
            handler,
            context,
            gate: tokio::sync::Mutex::new(()),
            handled: AtomicU64::new(0),
        });

        let acceptor = tokio::spawn(accept_loop(listener, state.clone()));
        info!(%addr, "Workflow call-back server listening");

        Ok(Self {
            addr,
            state,
            acceptor,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn token(&self) -> &str {
        &self.state.token
    }

    /// Variables that tell the workflow process how to call back
    pub fn env_vars(&self) -> [(String, String); 2] {
        [
            (CALLBACK_ADDR_ENV.to_string(), self.addr.to_string()),
            (CALLBACK_TOKEN_ENV.to_string(), self.state.token.clone()),
        ]
    }

    /// Requests handled so far, authenticated or not
    pub fn handled(&self) -> u64 {
        self.state.handled.load(Ordering::SeqCst)
    }

    pub fn shutdown(self) {
        debug!(addr = %self.addr, "Stopping call-back server");
        self.acceptor.abort();
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>) {
    // dropping the set aborts every connection task
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Call-back connection accepted");
                    connections.spawn(serve_connection(stream, state.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "Call-back accept failed");
                    break;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<ServerState>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut authenticated = false;

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }

        let response = {
            let _turn = state.gate.lock().await;
            state.handled.fetch_add(1, Ordering::SeqCst);
            handle_line(&state, &line, &mut authenticated).await
        };

        let mut frame = match serde_json::to_string(&response) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to encode call-back response");
                break;
            }
        };
        frame.push('\n');
        if write_half.write_all(frame.as_bytes()).await.is_err() {
            break;
        }
    }
}

async fn handle_line(state: &ServerState, line: &str, authenticated: &mut bool) -> RpcResponse {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return RpcResponse::err(Value::Null, PARSE_ERROR, format!("parse error: {}", e)),
    };
    let id = request.id.clone();

    if request.method == "auth" {
        return match serde_json::from_value::<AuthParams>(request.params) {
            Ok(params) if params.token == state.token => {
                *authenticated = true;
                RpcResponse::ok(id, json!(true))
            }
            Ok(_) => RpcResponse::err(id, UNAUTHORIZED, "invalid token"),
            Err(e) => RpcResponse::err(id, INVALID_PARAMS, e.to_string()),
        };
    }
    if !*authenticated {
        return RpcResponse::err(id, UNAUTHORIZED, "call auth first");
    }

    debug!(method = %request.method, "Call-back request");
    match request.method.as_str() {
        "recipe.run" => match serde_json::from_value::<NestedRun>(request.params) {
            Ok(run) => {
                let outcome = state.handler.run_recipe(run).await;
                RpcResponse::ok(id, outcome.to_json())
            }
            Err(e) => RpcResponse::err(id, INVALID_PARAMS, e.to_string()),
        },
        "ctx.get" => match serde_json::from_value::<KeyParams>(request.params) {
            Ok(params) => RpcResponse::ok(id, json!(state.context.get(&params.key))),
            Err(e) => RpcResponse::err(id, INVALID_PARAMS, e.to_string()),
        },
        "ctx.set" => match serde_json::from_value::<SetParams>(request.params) {
            Ok(params) => {
                let value = match params.value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                let previous = state.context.set(params.key, value);
                RpcResponse::ok(id, json!(previous))
            }
            Err(e) => RpcResponse::err(id, INVALID_PARAMS, e.to_string()),
        },
        "ctx.all" => RpcResponse::ok(id, json!(state.context.snapshot())),
        other => RpcResponse::err(id, METHOD_NOT_FOUND, format!("unknown method '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::Runtime;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct EchoHandler {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CallbackHandler for EchoHandler {
        async fn run_recipe(&self, request: NestedRun) -> ExecutionOutcome {
            self.calls.lock().push(request.name.clone());
            ExecutionOutcome::success(request.name, Runtime::Shell, request.params, Duration::ZERO)
        }
    }

    struct Client {
        lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        writer: tokio::net::tcp::OwnedWriteHalf,
        next_id: u64,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let (read, writer) = TcpStream::connect(addr).await.unwrap().into_split();
            Self {
                lines: BufReader::new(read).lines(),
                writer,
                next_id: 1,
            }
        }

        async fn call(&mut self, method: &str, params: Value) -> Value {
            let id = self.next_id;
            self.next_id += 1;
            let frame = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
            self.writer
                .write_all(format!("{}\n", frame).as_bytes())
                .await
                .unwrap();
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    async fn start() -> (CallbackServer, Arc<EchoHandler>, WorkflowContext) {
        let handler = Arc::new(EchoHandler {
            calls: Mutex::new(Vec::new()),
        });
        let context = WorkflowContext::new();
        let server = CallbackServer::start(handler.clone(), context.clone())
            .await
            .unwrap();
        (server, handler, context)
    }

    #[tokio::test]
    async fn test_requires_auth() {
        let (server, handler, _ctx) = start().await;
        let mut client = Client::connect(server.addr()).await;

        let denied = client.call("recipe.run", json!({ "name": "x" })).await;
        assert_eq!(denied["error"]["code"], UNAUTHORIZED);

        let bad = client.call("auth", json!({ "token": "wrong" })).await;
        assert_eq!(bad["error"]["code"], UNAUTHORIZED);
        assert!(handler.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_recipe_and_context_calls() {
        let (server, handler, ctx) = start().await;
        let mut client = Client::connect(server.addr()).await;

        let ok = client.call("auth", json!({ "token": server.token() })).await;
        assert_eq!(ok["result"], true);

        let set = client.call("ctx.set", json!({ "key": "user", "value": "ada" })).await;
        assert_eq!(set["result"], Value::Null);
        assert_eq!(ctx.get("user").as_deref(), Some("ada"));

        ctx.set("count", "2");
        let all = client.call("ctx.all", json!({})).await;
        assert_eq!(all["result"], json!({ "user": "ada", "count": "2" }));

        let outcome = client
            .call("recipe.run", json!({ "name": "step-one", "params": { "n": 1 } }))
            .await;
        assert_eq!(outcome["result"]["success"], true);
        assert_eq!(outcome["result"]["data"], json!({ "n": 1 }));
        assert_eq!(*handler.calls.lock(), vec!["step-one"]);

        let unknown = client.call("page.click", json!({})).await;
        assert_eq!(unknown["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(server.handled(), 5);
    }

    #[tokio::test]
    async fn test_env_vars_advertise_server() {
        let (server, _handler, _ctx) = start().await;
        let vars = server.env_vars();
        assert_eq!(vars[0].0, CALLBACK_ADDR_ENV);
        assert_eq!(vars[0].1, server.addr().to_string());
        assert_eq!(vars[1].1, server.token());
        assert!(server.addr().ip().is_loopback());
    }
}
