//! A running virtual-server instance.
//!
//! Owns the HTTP listener bound to the definition's port, terminates client
//! SSE sessions, serves list/get/call requests from the aggregated view,
//! and proxies invocations to the correct upstream through the transport
//! registry. The routing map is immutable for the lifetime of the instance;
//! rebuilds happen only on start.

use crate::catalog::CapabilityCatalog;
use crate::error::{Error, Result};
use crate::transport::{TransportRegistry, TransportStatusEvent};
use crate::types::{
    CapabilityKind, McpError, McpMessage, McpRequest, McpResponse, Prompt, RequestId, Resource,
    Tool, UnderlyingServerStatus, UpstreamStatus, VmcpStatus,
};
use crate::vmcp::{aggregate, AggregatedView, AggregationRule, StatusCell};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::Router;
use dashmap::DashMap;
use futures_util::stream::Stream;
use futures_util::{future, stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Static parameters of one instance.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub source_server_ids: Vec<String>,
    pub aggregation_rules: Vec<AggregationRule>,
}

/// Health report for one virtual server.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub underlying_servers_status: Vec<UnderlyingServerStatus>,
}

/// One connected client SSE session.
struct ClientSession {
    tx: mpsc::Sender<Value>,
}

#[derive(Debug, Clone, PartialEq)]
struct SourceHealth {
    status: UpstreamStatus,
    last_error: Option<String>,
}

/// Shared state handed to the axum handlers.
#[derive(Clone)]
struct InstanceState {
    view: Arc<AggregatedView>,
    registry: Arc<TransportRegistry>,
    sessions: Arc<DashMap<String, ClientSession>>,
    source_health: Arc<DashMap<String, SourceHealth>>,
    sources: Arc<Vec<String>>,
    methods: Arc<HashSet<&'static str>>,
}

impl InstanceState {
    fn is_source_healthy(&self, source: &str) -> bool {
        self.source_health
            .get(source)
            .map(|h| h.status == UpstreamStatus::Online)
            .unwrap_or(false)
    }
}

/// A virtual server bound to one port.
pub struct VmcpInstance {
    config: InstanceConfig,
    registry: Arc<TransportRegistry>,
    catalog: Arc<CapabilityCatalog>,
    status: Arc<StatusCell>,
    sessions: Arc<DashMap<String, ClientSession>>,
    source_health: Arc<DashMap<String, SourceHealth>>,
    view: parking_lot::RwLock<Option<Arc<AggregatedView>>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    cancel: parking_lot::Mutex<Option<CancellationToken>>,
}

impl VmcpInstance {
    pub fn new(
        config: InstanceConfig,
        registry: Arc<TransportRegistry>,
        catalog: Arc<CapabilityCatalog>,
        status: Arc<StatusCell>,
    ) -> Self {
        Self {
            config,
            registry,
            catalog,
            status,
            sessions: Arc::new(DashMap::new()),
            source_health: Arc::new(DashMap::new()),
            view: parking_lot::RwLock::new(None),
            tasks: parking_lot::Mutex::new(Vec::new()),
            cancel: parking_lot::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn is_running(&self) -> bool {
        self.view.read().is_some()
    }

    /// Start the instance: aggregate, register handlers for the non-empty
    /// kinds, bind the listener, go `running`.
    pub async fn start(&self) -> Result<()> {
        // a prior listener, if any, goes away first
        self.shutdown_runtime().await;
        self.status.set_status(VmcpStatus::Starting);

        let view = Arc::new(aggregate(
            &self.config.source_server_ids,
            &self.config.aggregation_rules,
            &self.catalog,
        ));
        if view.is_empty() {
            self.status.set_status(VmcpStatus::Error);
            return Err(Error::StartupNoCapabilities);
        }
        if view.duplicates_dropped > 0 {
            debug!(
                vmcp = %self.config.name,
                dropped = view.duplicates_dropped,
                "duplicate capabilities dropped by first-wins"
            );
        }

        for source in &self.config.source_server_ids {
            let status = if self.registry.is_connected(source) {
                UpstreamStatus::Online
            } else {
                UpstreamStatus::Offline
            };
            self.source_health.insert(
                source.clone(),
                SourceHealth {
                    status,
                    last_error: None,
                },
            );
        }

        let state = InstanceState {
            view: view.clone(),
            registry: self.registry.clone(),
            sessions: self.sessions.clone(),
            source_health: self.source_health.clone(),
            sources: Arc::new(self.config.source_server_ids.clone()),
            methods: Arc::new(registered_methods(&view)),
        };

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(vmcp = %self.config.name, %addr, "bind failed: {}", e);
                self.source_health.clear();
                self.status.set_status(VmcpStatus::Error);
                return Err(Error::PortUnavailable(self.config.port));
            },
        };

        let cancel = CancellationToken::new();
        let router = build_router(state.clone());
        let serve_cancel = cancel.clone();
        let server = tokio::spawn(async move {
            let shutdown = async move { serve_cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!("vmcp listener error: {}", e);
            }
        });

        let watcher = tokio::spawn(watch_sources(
            state,
            self.status.clone(),
            self.registry.subscribe(),
            cancel.clone(),
        ));

        *self.view.write() = Some(view);
        *self.cancel.lock() = Some(cancel);
        self.tasks.lock().extend([server, watcher]);

        self.status.set_status(VmcpStatus::Running);
        self.recompute_status();
        info!(
            vmcp = %self.config.name,
            port = self.config.port,
            "virtual server running"
        );
        Ok(())
    }

    /// Stop the instance: end every client session, close the listener,
    /// drop the aggregated view. Idempotent.
    pub async fn stop(&self) {
        self.shutdown_runtime().await;
        self.status.set_status(VmcpStatus::Stopped);
        info!(vmcp = %self.config.name, "virtual server stopped");
    }

    async fn shutdown_runtime(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        // dropping the session senders ends every client SSE stream
        self.sessions.clear();
        self.source_health.clear();
        *self.view.write() = None;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let aborter = task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                aborter.abort();
            }
        }
    }

    /// Probe every source with a lightweight `health/check` request.
    pub async fn check_health(&self) -> HealthReport {
        let mut underlying = Vec::new();
        let mut healthy = true;

        for source in &self.config.source_server_ids {
            let entry = if !self.registry.is_connected(source) {
                UnderlyingServerStatus {
                    name: source.clone(),
                    status: UpstreamStatus::Error,
                    last_error: Some("not connected".to_string()),
                }
            } else {
                let request = McpRequest::new("health/check", json!({}), RequestId::generate());
                match self.registry.request(source, request).await {
                    Ok(_) => UnderlyingServerStatus {
                        name: source.clone(),
                        status: UpstreamStatus::Online,
                        last_error: None,
                    },
                    Err(e) => UnderlyingServerStatus {
                        name: source.clone(),
                        status: UpstreamStatus::Error,
                        last_error: Some(e.to_string()),
                    },
                }
            };
            if entry.status != UpstreamStatus::Online {
                healthy = false;
            }
            underlying.push(entry);
        }

        self.status.set_underlying(underlying.clone());
        HealthReport {
            healthy,
            underlying_servers_status: underlying,
        }
    }

    /// The aggregated view served by this instance, frozen at start.
    pub fn capabilities(&self) -> Result<(Vec<Tool>, Vec<Prompt>, Vec<Resource>)> {
        let view = self.view.read();
        let view = view
            .as_ref()
            .ok_or_else(|| Error::InstanceNotRunning(self.config.id.clone()))?;
        Ok((
            view.tools.clone(),
            view.prompts.clone(),
            view.resources.clone(),
        ))
    }

    fn recompute_status(&self) {
        recompute(
            &self.config.source_server_ids,
            &self.source_health,
            &self.status,
        );
    }
}

/// Only methods backed by a non-empty kind are registered.
fn registered_methods(view: &AggregatedView) -> HashSet<&'static str> {
    let mut methods = HashSet::new();
    if !view.tools.is_empty() {
        methods.insert("tools/list");
        methods.insert("tools/call");
    }
    if !view.prompts.is_empty() {
        methods.insert("prompts/list");
        methods.insert("prompts/get");
    }
    if !view.resources.is_empty() {
        methods.insert("resources/list");
        methods.insert("resources/get");
    }
    methods
}

fn build_router(state: InstanceState) -> Router {
    Router::new()
        .route("/sse", get(handle_sse))
        .route("/message", post(handle_message))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Removes the session entry when the client stream is dropped.
struct SessionGuard {
    sessions: Arc<DashMap<String, ClientSession>>,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.remove(&self.id);
        debug!(session = %self.id, "client session closed");
    }
}

/// `GET /sse`: establish a client session. The `endpoint` event goes out
/// first; every later JSON-RPC message is a `message` event.
async fn handle_sse(
    State(state): State<InstanceState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel::<Value>(64);
    state
        .sessions
        .insert(session_id.clone(), ClientSession { tx });
    debug!(session = %session_id, "client session established");

    let handshake = json!({"endpoint": "/message", "sessionId": session_id});
    let first = stream::once(future::ready(Ok::<Event, Infallible>(
        Event::default().event("endpoint").data(handshake.to_string()),
    )));

    let guard = SessionGuard {
        sessions: state.sessions.clone(),
        id: session_id,
    };
    let rest = ReceiverStream::new(rx).map(move |message| {
        let _keep_alive = &guard;
        Ok(Event::default().event("message").data(message.to_string()))
    });

    Sse::new(first.chain(rest)).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId", default)]
    session_id: Option<String>,
}

/// `POST /message?sessionId=...`: accept a client JSON-RPC message.
///
/// The POST reply carries no payload; responses travel back on the
/// session's SSE stream.
async fn handle_message(
    State(state): State<InstanceState>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> StatusCode {
    let session_id = match query.session_id {
        Some(id) => id,
        None => return StatusCode::NOT_FOUND,
    };
    let tx = match state.sessions.get(&session_id) {
        Some(session) => session.tx.clone(),
        None => return StatusCode::NOT_FOUND,
    };

    let value: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(e) => {
            let response = McpResponse::failure(None, McpError::parse_error(e.to_string()));
            deliver(&tx, &response).await;
            return StatusCode::ACCEPTED;
        },
    };
    let message = match McpMessage::from_value(value) {
        Ok(message) => message,
        Err(e) => {
            let response = McpResponse::failure(None, McpError::invalid_request(e));
            deliver(&tx, &response).await;
            return StatusCode::ACCEPTED;
        },
    };

    match message {
        McpMessage::Request(request) => {
            let state = state.clone();
            tokio::spawn(async move {
                let response = dispatch(&state, request).await;
                deliver(&tx, &response).await;
            });
        },
        McpMessage::Notification(notification) => {
            debug!(method = %notification.method, "ignoring client notification");
        },
        McpMessage::Response(_) => {
            debug!("ignoring unsolicited client response");
        },
    }

    StatusCode::ACCEPTED
}

async fn deliver(tx: &mpsc::Sender<Value>, response: &McpResponse) {
    match serde_json::to_value(response) {
        Ok(value) => {
            let _ = tx.send(value).await;
        },
        Err(e) => warn!("failed to serialize response: {}", e),
    }
}

/// MCP request dispatcher over the frozen aggregated view.
async fn dispatch(state: &InstanceState, request: McpRequest) -> McpResponse {
    let method = request.method.clone();
    if !state.methods.contains(method.as_str()) {
        return McpResponse::failure(Some(request.id), McpError::method_not_found(&method));
    }

    match method.as_str() {
        "tools/list" => {
            McpResponse::success(request.id, json!({"tools": state.view.tools}))
        },
        "tools/call" => proxy_named(state, request, CapabilityKind::Tool, "tools/call").await,
        "prompts/list" => {
            McpResponse::success(request.id, json!({"prompts": state.view.prompts}))
        },
        "prompts/get" => proxy_named(state, request, CapabilityKind::Prompt, "prompts/get").await,
        "resources/list" => {
            McpResponse::success(request.id, json!({"resources": state.view.resources}))
        },
        "resources/get" => proxy_resource_get(state, request).await,
        other => McpResponse::failure(Some(request.id), McpError::method_not_found(other)),
    }
}

/// Proxy a name-keyed invocation (`tools/call`, `prompts/get`) to the
/// source the routing map records for it.
async fn proxy_named(
    state: &InstanceState,
    request: McpRequest,
    kind: CapabilityKind,
    method: &str,
) -> McpResponse {
    let params = request.params.clone().unwrap_or_else(|| json!({}));
    let name = match params.get("name").and_then(Value::as_str) {
        Some(name) => name.to_string(),
        None => {
            return McpResponse::failure(
                Some(request.id),
                McpError::invalid_params(format!("missing {} name", kind)),
            );
        },
    };

    let target = match state.view.routing.get(kind, &name) {
        Some(target) => target.clone(),
        None => {
            return McpResponse::failure(
                Some(request.id),
                McpError::new(
                    crate::types::METHOD_NOT_FOUND,
                    format!("No {} named '{}'", kind, name),
                ),
            );
        },
    };

    let mut proxied_params = params;
    proxied_params["name"] = json!(target.identifier);
    proxy_to_source(state, request.id, &target.source, method, proxied_params).await
}

/// Proxy `resources/get`. Unmapped `mcp://<source>/...` uris pass through to
/// the named source, provided it is one of this server's sources.
async fn proxy_resource_get(state: &InstanceState, request: McpRequest) -> McpResponse {
    let params = request.params.clone().unwrap_or_else(|| json!({}));
    let uri = match params.get("uri").and_then(Value::as_str) {
        Some(uri) => uri.to_string(),
        None => {
            return McpResponse::failure(
                Some(request.id),
                McpError::invalid_params("missing resource uri"),
            );
        },
    };

    let source = match state.view.routing.get(CapabilityKind::Resource, &uri) {
        Some(target) => target.source.clone(),
        None => match scoped_resource_source(&uri) {
            Some(source) if state.sources.contains(&source) => source,
            _ => {
                return McpResponse::failure(
                    Some(request.id),
                    McpError::new(
                        crate::types::METHOD_NOT_FOUND,
                        format!("No resource with uri '{}'", uri),
                    ),
                );
            },
        },
    };

    proxy_to_source(state, request.id, &source, "resources/get", params).await
}

/// Extract `<source>` from an `mcp://<source>/...` uri.
fn scoped_resource_source(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix("mcp://")?;
    let source = rest.split('/').next()?;
    if source.is_empty() {
        None
    } else {
        Some(source.to_string())
    }
}

async fn proxy_to_source(
    state: &InstanceState,
    client_id: RequestId,
    source: &str,
    method: &str,
    params: Value,
) -> McpResponse {
    // an unhealthy source fails fast instead of waiting out the timeout
    if !state.is_source_healthy(source) {
        return McpResponse::failure(
            Some(client_id),
            McpError::internal(format!("upstream '{}' unavailable", source)),
        );
    }

    let proxied = McpRequest::new(method, params, RequestId::generate());
    match state.registry.request(source, proxied).await {
        Ok(response) => McpResponse {
            jsonrpc: crate::types::JSONRPC_VERSION.to_string(),
            id: Some(client_id),
            result: response.result,
            error: response.error,
        },
        Err(e) => {
            warn!(source, method, "proxy request failed: {}", e);
            McpResponse::failure(Some(client_id), e.to_rpc_error())
        },
    }
}

/// Track transport status events for this server's sources and drive the
/// running/partially_degraded/error transitions.
async fn watch_sources(
    state: InstanceState,
    status: Arc<StatusCell>,
    mut events: broadcast::Receiver<TransportStatusEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => match event {
                Ok(event) => {
                    if !state.sources.contains(&event.upstream) {
                        continue;
                    }
                    state.source_health.insert(
                        event.upstream.clone(),
                        SourceHealth {
                            status: event.status,
                            last_error: event.detail.clone(),
                        },
                    );
                    recompute(&state.sources, &state.source_health, &status);
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "status event stream lagged");
                },
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

/// Derive the vmcp status from per-source health: every source healthy is
/// `running`, at least one is `partially_degraded`, none is `error`.
fn recompute(
    sources: &[String],
    source_health: &DashMap<String, SourceHealth>,
    status: &StatusCell,
) {
    let mut underlying = Vec::new();
    let mut healthy = 0usize;
    for source in sources {
        let health = source_health
            .get(source)
            .map(|h| h.value().clone())
            .unwrap_or(SourceHealth {
                status: UpstreamStatus::Offline,
                last_error: None,
            });
        if health.status == UpstreamStatus::Online {
            healthy += 1;
        }
        underlying.push(UnderlyingServerStatus {
            name: source.clone(),
            status: health.status,
            last_error: health.last_error,
        });
    }

    let next = if healthy == sources.len() {
        VmcpStatus::Running
    } else if healthy > 0 {
        VmcpStatus::PartiallyDegraded
    } else {
        VmcpStatus::Error
    };
    status.set_underlying(underlying);
    status.set_status(next);
}
