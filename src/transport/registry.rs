//! Named collection of upstream transports.
//!
//! The registry exclusively owns transports. Operations on a given name are
//! serialized by a per-entry lock, and every transport carries a registry
//! observer that fans connection events out on a broadcast channel for the
//! config state and running virtual servers to consume.

use crate::error::{Error, Result, TransportError};
use crate::transport::{Transport, TransportObserver};
use crate::types::{McpRequest, McpResponse, UpstreamStatus};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Connection status change for one upstream.
#[derive(Debug, Clone)]
pub struct TransportStatusEvent {
    pub upstream: String,
    pub status: UpstreamStatus,
    pub detail: Option<String>,
}

struct RegistryEntry {
    transport: Arc<dyn Transport>,
    /// Serializes connect/disconnect/remove for this name.
    op_lock: tokio::sync::Mutex<()>,
    /// Set while the registry itself is closing the transport, so the
    /// observer can tell an operator disconnect from a terminal failure.
    detached: Arc<AtomicBool>,
}

/// Observer installed on every registered transport.
struct RegistryObserver {
    name: String,
    entries: Arc<DashMap<String, Arc<RegistryEntry>>>,
    status_tx: broadcast::Sender<TransportStatusEvent>,
    detached: Arc<AtomicBool>,
}

impl RegistryObserver {
    fn emit(&self, status: UpstreamStatus, detail: Option<String>) {
        let _ = self.status_tx.send(TransportStatusEvent {
            upstream: self.name.clone(),
            status,
            detail,
        });
    }
}

impl TransportObserver for RegistryObserver {
    fn on_error(&self, error: &TransportError) {
        let status = match error {
            TransportError::ConnectionFailed(_)
            | TransportError::ConnectionTimeout(_)
            | TransportError::ConnectionClosed { .. }
            | TransportError::MessageReceiveFailed(_) => Some(UpstreamStatus::Offline),
            TransportError::ReconnectionFailed { .. } => Some(UpstreamStatus::Error),
            _ => None,
        };
        if let Some(status) = status {
            self.emit(status, Some(error.to_string()));
        }
    }

    fn on_reconnect(&self) {
        self.emit(UpstreamStatus::Online, None);
    }

    fn on_close(&self) {
        if self.detached.load(Ordering::SeqCst) {
            // operator-initiated disconnect keeps the entry
            self.emit(UpstreamStatus::Offline, None);
        } else {
            debug!(upstream = %self.name, "terminal transport close, removing from registry");
            self.entries.remove(&self.name);
            self.emit(
                UpstreamStatus::Error,
                Some("connection closed".to_string()),
            );
        }
    }
}

/// Registry of upstream transports keyed by upstream name.
pub struct TransportRegistry {
    entries: Arc<DashMap<String, Arc<RegistryEntry>>>,
    status_tx: broadcast::Sender<TransportStatusEvent>,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportRegistry {
    pub fn new() -> Self {
        let (status_tx, _) = broadcast::channel(64);
        Self {
            entries: Arc::new(DashMap::new()),
            status_tx,
        }
    }

    /// Subscribe to connection status changes across all upstreams.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Register a transport under a name. Double-add is rejected.
    pub fn add(&self, name: &str, transport: Arc<dyn Transport>) -> Result<()> {
        let detached = Arc::new(AtomicBool::new(false));
        let entry = Arc::new(RegistryEntry {
            transport: transport.clone(),
            op_lock: tokio::sync::Mutex::new(()),
            detached: detached.clone(),
        });

        match self.entries.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::TransportAlreadyRegistered(name.to_string()));
            },
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
            },
        }

        transport.set_observer(Arc::new(RegistryObserver {
            name: name.to_string(),
            entries: self.entries.clone(),
            status_tx: self.status_tx.clone(),
            detached,
        }));

        debug!(upstream = %name, "transport registered");
        Ok(())
    }

    /// Connect a registered transport. No-op when already connected.
    pub async fn connect(&self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;
        let _guard = entry.op_lock.lock().await;

        if entry.transport.is_connected() {
            return Ok(());
        }

        match entry.transport.start().await {
            Ok(()) => {
                let _ = self.status_tx.send(TransportStatusEvent {
                    upstream: name.to_string(),
                    status: UpstreamStatus::Online,
                    detail: None,
                });
                Ok(())
            },
            Err(e) => {
                warn!(upstream = %name, "connect failed: {}", e);
                let _ = self.status_tx.send(TransportStatusEvent {
                    upstream: name.to_string(),
                    status: UpstreamStatus::Error,
                    detail: Some(e.to_string()),
                });
                Err(Error::Transport(e))
            },
        }
    }

    /// Close a registered transport but keep its entry.
    pub async fn disconnect(&self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;
        let _guard = entry.op_lock.lock().await;

        entry.detached.store(true, Ordering::SeqCst);
        entry.transport.close().await;
        entry.detached.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Close and deregister a transport.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let (_, entry) = self
            .entries
            .remove(name)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;
        let _guard = entry.op_lock.lock().await;

        entry.detached.store(true, Ordering::SeqCst);
        entry.transport.close().await;
        debug!(upstream = %name, "transport removed");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.entries.get(name).map(|entry| entry.transport.clone())
    }

    /// Issue a correlated request through the named transport.
    pub async fn request(&self, name: &str, request: McpRequest) -> Result<McpResponse> {
        let entry = self.entry(name)?;
        entry
            .transport
            .request(request)
            .await
            .map_err(Error::Transport)
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .map(|entry| entry.transport.is_connected())
            .unwrap_or(false)
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn entry(&self, name: &str) -> Result<Arc<RegistryEntry>> {
        self.entries
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{McpMessage, RequestId};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    /// In-memory transport double that records lifecycle calls and lets a
    /// test fire observer hooks directly.
    struct FakeTransport {
        connected: AtomicBool,
        starts: AtomicU32,
        observer: parking_lot::RwLock<Option<Arc<dyn TransportObserver>>>,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(false),
                starts: AtomicU32::new(0),
                observer: parking_lot::RwLock::new(None),
            })
        }

        fn observer(&self) -> Arc<dyn TransportObserver> {
            self.observer.read().clone().expect("observer installed")
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn start(&self) -> std::result::Result<(), TransportError> {
            self.connected.store(true, Ordering::SeqCst);
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&self, _message: McpMessage) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn request(
            &self,
            request: McpRequest,
        ) -> std::result::Result<McpResponse, TransportError> {
            Ok(McpResponse::success(
                request.id,
                json!({"method": request.method}),
            ))
        }

        async fn close(&self) {
            self.connected.store(false, Ordering::SeqCst);
            let observer = self.observer.read().clone();
            if let Some(observer) = observer {
                observer.on_close();
            }
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn set_observer(&self, observer: Arc<dyn TransportObserver>) {
            *self.observer.write() = Some(observer);
        }
    }

    #[tokio::test]
    async fn test_double_add_rejected() {
        let registry = TransportRegistry::new();
        registry.add("u1", FakeTransport::new()).unwrap();

        let result = registry.add("u1", FakeTransport::new());
        assert!(matches!(
            result,
            Err(Error::TransportAlreadyRegistered(name)) if name == "u1"
        ));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let registry = TransportRegistry::new();
        let fake = FakeTransport::new();
        registry.add("u1", fake.clone()).unwrap();

        registry.connect("u1").await.unwrap();
        registry.connect("u1").await.unwrap();

        assert_eq!(fake.starts.load(Ordering::SeqCst), 1);
        assert!(registry.is_connected("u1"));
    }

    #[tokio::test]
    async fn test_request_delegates_and_unknown_name_fails() {
        let registry = TransportRegistry::new();
        registry.add("u1", FakeTransport::new()).unwrap();

        let response = registry
            .request(
                "u1",
                McpRequest::new("tools/list", json!({}), RequestId::Number(1)),
            )
            .await
            .unwrap();
        assert_eq!(response.result.unwrap()["method"], json!("tools/list"));

        let missing = registry
            .request(
                "nope",
                McpRequest::new("tools/list", json!({}), RequestId::Number(2)),
            )
            .await;
        assert!(matches!(missing, Err(Error::ServerNotFound(_))));
    }

    #[tokio::test]
    async fn test_disconnect_keeps_entry() {
        let registry = TransportRegistry::new();
        let fake = FakeTransport::new();
        registry.add("u1", fake.clone()).unwrap();
        registry.connect("u1").await.unwrap();

        registry.disconnect("u1").await.unwrap();
        assert!(!registry.is_connected("u1"));
        assert!(registry.get("u1").is_some());
    }

    #[tokio::test]
    async fn test_terminal_close_auto_removes_entry() {
        let registry = TransportRegistry::new();
        let fake = FakeTransport::new();
        registry.add("u1", fake.clone()).unwrap();
        registry.connect("u1").await.unwrap();

        let mut events = registry.subscribe();
        // reconnect exhaustion fires on_close with no operator involvement
        fake.observer().on_close();

        assert!(registry.get("u1").is_none());
        let event = events.recv().await.unwrap();
        assert_eq!(event.status, UpstreamStatus::Error);
    }

    #[tokio::test]
    async fn test_status_events_for_connect_and_reconnect() {
        let registry = TransportRegistry::new();
        let fake = FakeTransport::new();
        registry.add("u1", fake.clone()).unwrap();

        let mut events = registry.subscribe();
        registry.connect("u1").await.unwrap();
        assert_eq!(events.recv().await.unwrap().status, UpstreamStatus::Online);

        fake.observer()
            .on_error(&TransportError::ConnectionClosed { retryable: true });
        assert_eq!(events.recv().await.unwrap().status, UpstreamStatus::Offline);

        fake.observer().on_reconnect();
        assert_eq!(events.recv().await.unwrap().status, UpstreamStatus::Online);
    }

    #[tokio::test]
    async fn test_remove_closes_and_deregisters() {
        let registry = TransportRegistry::new();
        let fake = FakeTransport::new();
        registry.add("u1", fake.clone()).unwrap();
        registry.connect("u1").await.unwrap();

        registry.remove("u1").await.unwrap();
        assert!(registry.get("u1").is_none());
        assert!(!fake.is_connected());
        assert!(registry.list().is_empty());
    }
}
