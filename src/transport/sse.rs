//! SSE client transport for upstream MCP servers.
//!
//! The channel is asymmetric: server-to-client messages arrive on a
//! long-lived `GET <base>/sse` event stream, client-to-server messages go
//! out as `POST <base><endpoint>?sessionId=<opaque>`. The first stream event
//! is `endpoint` and carries the POST path and session id; every later
//! `message` event is a JSON-RPC message correlated against the pending
//! table by `id` before user hooks run.
//!
//! On stream loss the transport reconnects with exponential backoff. A
//! reconnect yields a fresh session: queued messages flush, but requests
//! that were in flight fail with a retryable error because their
//! correlation ids died with the old session.

use crate::error::TransportError;
use crate::transport::events::{EndpointEvent, SseEvent, SseParser};
use crate::types::{McpMessage, McpRequest, McpResponse, RequestId};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-upstream transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base URL of the upstream (scheme://host:port, no trailing path).
    pub base_url: String,

    /// Optional bearer token sent on every HTTP request.
    pub auth_token: Option<String>,

    /// Deadline for `request()` completions and for the endpoint handshake.
    pub timeout: Duration,

    /// Base reconnect delay, doubled per attempt.
    pub retry_delay: Duration,

    /// Reconnect attempts before the transport closes terminally.
    pub max_retries: u32,

    /// Outbound queue high-water mark while disconnected.
    pub queue_high_water: usize,
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: None,
            timeout: Duration::from_millis(30_000),
            retry_delay: Duration::from_millis(1_000),
            max_retries: 5,
            queue_high_water: 1024,
        }
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }
}

/// Hooks invoked by the transport's reader task.
///
/// `on_message` fires for every inbound JSON-RPC message after correlation
/// has been attempted, so a caller that observes both a `request()`
/// completion and a hook invocation sees the completion first. `on_error`
/// fires on stream failures (retryable while reconnecting); `on_close` only
/// on terminal closure.
pub trait TransportObserver: Send + Sync {
    fn on_message(&self, _message: &McpMessage) {}
    fn on_error(&self, _error: &TransportError) {}
    fn on_reconnect(&self) {}
    fn on_close(&self) {}
}

/// A correlated JSON-RPC channel to one upstream.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the stream and complete the endpoint handshake. Idempotent when
    /// already open.
    async fn start(&self) -> Result<(), TransportError>;

    /// Fire-and-forget send. Enqueues while disconnected and auto-starts an
    /// idle transport; never waits for a reply.
    async fn send(&self, message: McpMessage) -> Result<(), TransportError>;

    /// Correlated request: resolves with the matching response, or fails on
    /// timeout or transport loss.
    async fn request(&self, request: McpRequest) -> Result<McpResponse, TransportError>;

    /// Tear down the stream; pending requests complete with a non-retryable
    /// error and the queue is dropped.
    async fn close(&self);

    fn is_connected(&self) -> bool;

    fn set_observer(&self, observer: Arc<dyn TransportObserver>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone)]
struct PostTarget {
    url: String,
    session_id: String,
}

type PendingSender = oneshot::Sender<Result<McpResponse, TransportError>>;

struct Shared {
    config: TransportConfig,
    client: reqwest::Client,
    state: Mutex<ConnState>,
    target: RwLock<Option<PostTarget>>,
    pending: DashMap<RequestId, PendingSender>,
    queue: Mutex<VecDeque<McpMessage>>,
    observer: RwLock<Option<Arc<dyn TransportObserver>>>,
    /// Serializes start/close; at most one lifecycle transition at a time.
    lifecycle: tokio::sync::Mutex<()>,
    cancel: Mutex<Option<CancellationToken>>,
}

/// An open SSE stream after the endpoint handshake.
struct SseConnection {
    stream: BoxStream<'static, reqwest::Result<Bytes>>,
    parser: SseParser,
    /// Events that arrived in the same chunk as the handshake.
    buffered: VecDeque<SseEvent>,
}

/// SSE+POST transport implementation.
#[derive(Clone)]
pub struct SseTransport {
    shared: Arc<Shared>,
}

impl SseTransport {
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        // no global client timeout: it would sever the long-lived SSE read
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                client,
                state: Mutex::new(ConnState::Idle),
                target: RwLock::new(None),
                pending: DashMap::new(),
                queue: Mutex::new(VecDeque::new()),
                observer: RwLock::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                cancel: Mutex::new(None),
            }),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.shared.config.base_url
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn start(&self) -> Result<(), TransportError> {
        let _guard = self.shared.lifecycle.lock().await;

        {
            let state = self.shared.state.lock();
            // Reconnecting means the reader task is alive and working on it
            if matches!(*state, ConnState::Connected | ConnState::Reconnecting) {
                return Ok(());
            }
        }
        *self.shared.state.lock() = ConnState::Connecting;

        let timeout_ms = self.shared.config.timeout.as_millis() as u64;
        let conn = match tokio::time::timeout(
            self.shared.config.timeout,
            open_session(&self.shared),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                *self.shared.state.lock() = ConnState::Idle;
                return Err(e);
            },
            Err(_) => {
                *self.shared.state.lock() = ConnState::Idle;
                return Err(TransportError::ConnectionTimeout(timeout_ms));
            },
        };

        *self.shared.state.lock() = ConnState::Connected;
        info!(upstream = %self.shared.config.base_url, "SSE transport connected");

        let cancel = CancellationToken::new();
        *self.shared.cancel.lock() = Some(cancel.clone());
        tokio::spawn(run_loop(self.shared.clone(), conn, cancel));

        flush_queue(&self.shared).await;
        Ok(())
    }

    async fn send(&self, message: McpMessage) -> Result<(), TransportError> {
        let target = {
            let connected = matches!(*self.shared.state.lock(), ConnState::Connected);
            if connected {
                self.shared.target.read().clone()
            } else {
                None
            }
        };

        if let Some(target) = target {
            return post_message(&self.shared, &target, &message).await;
        }

        if matches!(*self.shared.state.lock(), ConnState::Closed) {
            return Err(TransportError::NotConnected);
        }
        enqueue(&self.shared, message)?;

        // auto-start convenience: first send on an idle transport connects it
        let should_start = matches!(*self.shared.state.lock(), ConnState::Idle);
        if should_start {
            let transport = self.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.start().await {
                    warn!(
                        upstream = %transport.shared.config.base_url,
                        "auto-start after send failed: {}", e
                    );
                }
            });
        }
        Ok(())
    }

    async fn request(&self, request: McpRequest) -> Result<McpResponse, TransportError> {
        let id = request.id.clone();
        let (tx, rx) = oneshot::channel();

        match self.shared.pending.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(TransportError::InvalidMessage(format!(
                    "request id '{}' already in flight",
                    id
                )));
            },
            Entry::Vacant(slot) => {
                slot.insert(tx);
            },
        }

        if let Err(e) = self.send(McpMessage::Request(request)).await {
            self.shared.pending.remove(&id);
            return Err(e);
        }

        let timeout_ms = self.shared.config.timeout.as_millis() as u64;
        match tokio::time::timeout(self.shared.config.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // completion sender dropped without a verdict: the channel died
            Ok(Err(_)) => Err(TransportError::ConnectionClosed { retryable: true }),
            Err(_) => {
                self.shared.pending.remove(&id);
                Err(TransportError::Timeout(timeout_ms))
            },
        }
    }

    async fn close(&self) {
        let _guard = self.shared.lifecycle.lock().await;

        let was_closed = {
            let mut state = self.shared.state.lock();
            let was = matches!(*state, ConnState::Closed);
            *state = ConnState::Closed;
            was
        };

        if let Some(cancel) = self.shared.cancel.lock().take() {
            cancel.cancel();
        }
        *self.shared.target.write() = None;
        self.shared.queue.lock().clear();
        fail_pending(&self.shared, TransportError::ConnectionClosed { retryable: false });

        if !was_closed {
            debug!(upstream = %self.shared.config.base_url, "SSE transport closed");
            notify_close(&self.shared);
        }
    }

    fn is_connected(&self) -> bool {
        matches!(*self.shared.state.lock(), ConnState::Connected)
    }

    fn set_observer(&self, observer: Arc<dyn TransportObserver>) {
        *self.shared.observer.write() = Some(observer);
    }
}

/// Open the stream and wait for the `endpoint` handshake event.
async fn open_session(shared: &Arc<Shared>) -> Result<SseConnection, TransportError> {
    let base = shared.config.base_url.trim_end_matches('/');
    let url = format!("{}/sse", base);

    let mut builder = shared
        .client
        .get(&url)
        .header(reqwest::header::ACCEPT, "text/event-stream");
    if let Some(token) = &shared.config.auth_token {
        builder = builder.bearer_auth(token);
    }

    let response = builder
        .send()
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    if !response.status().is_success() {
        return Err(TransportError::ConnectionFailed(format!(
            "SSE endpoint returned {}",
            response.status()
        )));
    }

    let mut stream = response.bytes_stream().boxed();
    let mut parser = SseParser::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let mut events = parser.feed(&chunk).into_iter();
        while let Some(event) = events.next() {
            if event.event != "endpoint" {
                // nothing meaningful can precede the handshake
                continue;
            }
            let payload: EndpointEvent = serde_json::from_str(&event.data).map_err(|e| {
                TransportError::InvalidMessage(format!("malformed endpoint event: {}", e))
            })?;
            let target = PostTarget {
                url: format!("{}{}", base, payload.endpoint),
                session_id: payload.session_id,
            };
            *shared.target.write() = Some(target);
            return Ok(SseConnection {
                stream,
                parser,
                buffered: events.collect(),
            });
        }
    }

    Err(TransportError::ConnectionFailed(
        "stream ended before endpoint event".to_string(),
    ))
}

enum ReadEnd {
    Cancelled,
    StreamLost,
}

/// Reader task: deliver events in arrival order until cancellation or loss,
/// then drive the reconnect loop.
async fn run_loop(shared: Arc<Shared>, mut conn: SseConnection, cancel: CancellationToken) {
    loop {
        match read_events(&shared, &mut conn, &cancel).await {
            ReadEnd::Cancelled => return,
            ReadEnd::StreamLost => {},
        }
        if cancel.is_cancelled() {
            return;
        }

        warn!(upstream = %shared.config.base_url, "SSE stream lost, reconnecting");
        *shared.state.lock() = ConnState::Reconnecting;
        *shared.target.write() = None;

        // in-flight correlation ids are lost with the session
        let lost = TransportError::ConnectionClosed { retryable: true };
        fail_pending(&shared, lost.clone());
        notify_error(&shared, &lost);

        match reconnect(&shared, &cancel).await {
            Some(new_conn) => {
                conn = new_conn;
                *shared.state.lock() = ConnState::Connected;
                info!(upstream = %shared.config.base_url, "SSE transport reconnected");
                notify_reconnect(&shared);
                flush_queue(&shared).await;
            },
            None => {
                if cancel.is_cancelled() {
                    return;
                }
                *shared.state.lock() = ConnState::Closed;
                let err = TransportError::ReconnectionFailed {
                    attempts: shared.config.max_retries,
                };
                warn!(upstream = %shared.config.base_url, "{}", err);
                notify_error(&shared, &err);
                notify_close(&shared);
                return;
            },
        }
    }
}

async fn read_events(
    shared: &Arc<Shared>,
    conn: &mut SseConnection,
    cancel: &CancellationToken,
) -> ReadEnd {
    while let Some(event) = conn.buffered.pop_front() {
        handle_event(shared, event);
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return ReadEnd::Cancelled,
            chunk = conn.stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    for event in conn.parser.feed(&bytes) {
                        handle_event(shared, event);
                    }
                },
                Some(Err(e)) => {
                    notify_error(
                        shared,
                        &TransportError::MessageReceiveFailed(e.to_string()),
                    );
                    return ReadEnd::StreamLost;
                },
                None => return ReadEnd::StreamLost,
            }
        }
    }
}

/// Correlate an inbound event against the pending table, then invoke the
/// user hook with the raw message.
fn handle_event(shared: &Arc<Shared>, event: SseEvent) {
    if event.event != "message" {
        debug!(event = %event.event, "ignoring non-message SSE event");
        return;
    }

    let value: serde_json::Value = match serde_json::from_str(&event.data) {
        Ok(v) => v,
        Err(e) => {
            notify_error(shared, &TransportError::InvalidMessage(e.to_string()));
            return;
        },
    };
    let message = match McpMessage::from_value(value) {
        Ok(m) => m,
        Err(e) => {
            notify_error(shared, &TransportError::InvalidMessage(e));
            return;
        },
    };

    if let McpMessage::Response(response) = &message {
        if let Some(id) = &response.id {
            if let Some((_, tx)) = shared.pending.remove(id) {
                let outcome = match &response.error {
                    Some(err) => Err(TransportError::Rpc(err.clone())),
                    None => Ok(response.clone()),
                };
                let _ = tx.send(outcome);
            }
        }
    }

    notify_message(shared, &message);
}

/// Exponential-backoff reconnect, bounded by `max_retries`.
async fn reconnect(shared: &Arc<Shared>, cancel: &CancellationToken) -> Option<SseConnection> {
    for attempt in 1..=shared.config.max_retries {
        let delay = shared
            .config
            .retry_delay
            .saturating_mul(1u32 << (attempt.min(16) - 1));
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {},
        }

        debug!(
            upstream = %shared.config.base_url,
            attempt, "attempting SSE reconnect"
        );
        match tokio::time::timeout(shared.config.timeout, open_session(shared)).await {
            Ok(Ok(conn)) => return Some(conn),
            Ok(Err(e)) => warn!(attempt, "reconnect attempt failed: {}", e),
            Err(_) => warn!(attempt, "reconnect attempt timed out"),
        }
    }
    None
}

async fn post_message(
    shared: &Arc<Shared>,
    target: &PostTarget,
    message: &McpMessage,
) -> Result<(), TransportError> {
    let mut builder = shared
        .client
        .post(&target.url)
        .query(&[("sessionId", target.session_id.as_str())])
        .json(message)
        .timeout(shared.config.timeout);
    if let Some(token) = &shared.config.auth_token {
        builder = builder.bearer_auth(token);
    }

    let response = builder
        .send()
        .await
        .map_err(|e| TransportError::MessageSendFailed(e.to_string()))?;
    if !response.status().is_success() {
        return Err(TransportError::MessageSendFailed(format!(
            "message endpoint returned {}",
            response.status()
        )));
    }
    Ok(())
}

/// Bounded enqueue used while disconnected: beyond the high-water mark the
/// oldest notification is dropped and requests fail fast.
fn enqueue(shared: &Shared, message: McpMessage) -> Result<(), TransportError> {
    let mut queue = shared.queue.lock();
    if queue.len() >= shared.config.queue_high_water {
        if message.is_request() {
            return Err(TransportError::QueueFull);
        }
        if let Some(pos) = queue.iter().position(|m| !m.is_request()) {
            queue.remove(pos);
            warn!("outbound queue full, dropped oldest notification");
        } else {
            warn!("outbound queue full of requests, dropped incoming notification");
            return Ok(());
        }
    }
    queue.push_back(message);
    Ok(())
}

/// Flush queued messages in FIFO order after (re)connect.
async fn flush_queue(shared: &Arc<Shared>) {
    loop {
        let target = match shared.target.read().clone() {
            Some(t) => t,
            None => return,
        };
        let message = match shared.queue.lock().pop_front() {
            Some(m) => m,
            None => return,
        };

        if let Err(e) = post_message(shared, &target, &message).await {
            warn!("failed to flush queued message: {}", e);
            if let McpMessage::Request(request) = &message {
                if let Some((_, tx)) = shared.pending.remove(&request.id) {
                    let _ = tx.send(Err(e.clone()));
                }
            }
            notify_error(shared, &e);
        }
    }
}

fn fail_pending(shared: &Shared, error: TransportError) {
    let ids: Vec<RequestId> = shared.pending.iter().map(|entry| entry.key().clone()).collect();
    for id in ids {
        if let Some((_, tx)) = shared.pending.remove(&id) {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

fn notify_message(shared: &Shared, message: &McpMessage) {
    let observer = shared.observer.read().clone();
    if let Some(observer) = observer {
        observer.on_message(message);
    }
}

fn notify_error(shared: &Shared, error: &TransportError) {
    let observer = shared.observer.read().clone();
    if let Some(observer) = observer {
        observer.on_error(error);
    }
}

fn notify_reconnect(shared: &Shared) {
    let observer = shared.observer.read().clone();
    if let Some(observer) = observer {
        observer.on_reconnect();
    }
}

fn notify_close(shared: &Shared) {
    let observer = shared.observer.read().clone();
    if let Some(observer) = observer {
        observer.on_close();
    }
}
