#![allow(dead_code)] // each integration binary uses a subset of the helpers

//! Shared test fixtures.
//!
//! `MockUpstream` is a minimal but protocol-complete MCP server speaking
//! the SSE + HTTP-POST transport: `GET /sse` opens a session and emits the
//! `endpoint` handshake, `POST /message?sessionId=...` accepts JSON-RPC and
//! answers over the session's event stream.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::Router;
use dashmap::DashMap;
use futures_util::stream::Stream;
use futures_util::{future, stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::convert::Infallible;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Clone)]
struct MockState {
    sessions: Arc<DashMap<String, mpsc::Sender<(String, Value)>>>,
    tools: Arc<RwLock<Vec<Value>>>,
    prompts: Arc<RwLock<Vec<Value>>>,
    resources: Arc<RwLock<Vec<Value>>>,
    /// Methods that never get a reply (for timeout tests).
    silent_methods: Arc<RwLock<HashSet<String>>>,
    /// When set, `prompts/list` answers with an RPC error.
    fail_prompts: Arc<RwLock<bool>>,
    /// Every JSON-RPC message received on the POST endpoint.
    received: Arc<Mutex<Vec<Value>>>,
}

/// A scripted upstream MCP server for integration tests.
pub struct MockUpstream {
    pub base_url: String,
    pub port: u16,
    state: MockState,
    server: JoinHandle<()>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let state = MockState {
            sessions: Arc::new(DashMap::new()),
            tools: Arc::new(RwLock::new(Vec::new())),
            prompts: Arc::new(RwLock::new(Vec::new())),
            resources: Arc::new(RwLock::new(Vec::new())),
            silent_methods: Arc::new(RwLock::new(HashSet::new())),
            fail_prompts: Arc::new(RwLock::new(false)),
            received: Arc::new(Mutex::new(Vec::new())),
        };

        let router = Router::new()
            .route("/sse", get(handle_sse))
            .route("/message", post(handle_message))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Self {
            base_url: format!("http://127.0.0.1:{}", port),
            port,
            state,
            server,
        }
    }

    pub fn set_tools(&self, tools: Vec<Value>) {
        *self.state.tools.write() = tools;
    }

    pub fn set_prompts(&self, prompts: Vec<Value>) {
        *self.state.prompts.write() = prompts;
    }

    pub fn set_resources(&self, resources: Vec<Value>) {
        *self.state.resources.write() = resources;
    }

    pub fn set_fail_prompts(&self, fail: bool) {
        *self.state.fail_prompts.write() = fail;
    }

    /// Make a method go unanswered from now on.
    pub fn silence_method(&self, method: &str) {
        self.state.silent_methods.write().insert(method.to_string());
    }

    /// Close every live SSE session, simulating a dropped stream. The
    /// listener stays up, so clients can reconnect.
    pub fn drop_sessions(&self) {
        self.state.sessions.clear();
    }

    /// Kill the server outright; reconnect attempts will be refused.
    pub fn shutdown(&self) {
        self.server.abort();
        self.state.sessions.clear();
    }

    /// Messages received on the POST endpoint, oldest first.
    pub fn received(&self) -> Vec<Value> {
        self.state.received.lock().clone()
    }

    pub fn received_count(&self, method: &str) -> usize {
        self.state
            .received
            .lock()
            .iter()
            .filter(|m| m.get("method").and_then(Value::as_str) == Some(method))
            .count()
    }

    pub fn session_count(&self) -> usize {
        self.state.sessions.len()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn handle_sse(
    State(state): State<MockState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel::<(String, Value)>(64);
    state.sessions.insert(session_id.clone(), tx);

    let handshake = json!({"endpoint": "/message", "sessionId": session_id});
    let first = stream::once(future::ready(Ok::<Event, Infallible>(
        Event::default().event("endpoint").data(handshake.to_string()),
    )));
    let rest = ReceiverStream::new(rx)
        .map(|(event, data)| Ok(Event::default().event(event).data(data.to_string())));

    Sse::new(first.chain(rest)).keep_alive(KeepAlive::default())
}

#[derive(Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn handle_message(
    State(state): State<MockState>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> StatusCode {
    let message: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(_) => return StatusCode::BAD_REQUEST,
    };
    state.received.lock().push(message.clone());

    let tx = match state.sessions.get(&query.session_id) {
        Some(session) => session.value().clone(),
        None => return StatusCode::NOT_FOUND,
    };

    tokio::spawn(async move {
        for reply in respond(&state, &message) {
            let _ = tx.send(("message".to_string(), reply)).await;
        }
    });

    StatusCode::ACCEPTED
}

fn respond(state: &MockState, message: &Value) -> Vec<Value> {
    let method = match message.get("method").and_then(Value::as_str) {
        Some(method) => method,
        None => return Vec::new(),
    };
    let id = message.get("id").cloned().unwrap_or(Value::Null);
    if id.is_null() {
        // notifications get no reply
        return Vec::new();
    }
    if state.silent_methods.read().contains(method) {
        return Vec::new();
    }

    let reply = match method {
        "tools/list" => success(&id, json!({"tools": *state.tools.read()})),
        "prompts/list" => {
            if *state.fail_prompts.read() {
                failure(&id, -32603, "prompt listing unavailable")
            } else {
                success(&id, json!({"prompts": *state.prompts.read()}))
            }
        },
        "resources/list" => success(&id, json!({"resources": *state.resources.read()})),
        "tools/call" => {
            let params = message.get("params").cloned().unwrap_or(json!({}));
            let name = params.get("name").and_then(Value::as_str).unwrap_or("");
            match name {
                "echo" => {
                    let text = params
                        .pointer("/arguments/text")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    success(&id, json!({"echo": text}))
                },
                other => failure(&id, -32602, &format!("unknown tool: {}", other)),
            }
        },
        "prompts/get" => {
            let name = message
                .pointer("/params/name")
                .and_then(Value::as_str)
                .unwrap_or("");
            success(&id, json!({"description": name, "messages": []}))
        },
        "resources/get" => {
            let uri = message
                .pointer("/params/uri")
                .and_then(Value::as_str)
                .unwrap_or("");
            success(&id, json!({"contents": [{"uri": uri, "text": "ok"}]}))
        },
        "health/check" => success(&id, json!({"status": "ok"})),
        "notify" => {
            // push an unsolicited notification ahead of the reply
            let notification = json!({
                "jsonrpc": "2.0",
                "method": "notifications/test",
                "params": {"origin": "mock"}
            });
            return vec![notification, success(&id, json!({"notified": true}))];
        },
        other => failure(&id, -32601, &format!("Method not found: {}", other)),
    };
    vec![reply]
}

fn success(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn failure(id: &Value, code: i32, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message}
    })
}

/// Grab a free TCP port from the OS.
pub fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll until `predicate` holds or the deadline passes.
pub async fn wait_for<F>(mut predicate: F, deadline: std::time::Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    predicate()
}
