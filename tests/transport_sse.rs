//! Integration tests for the SSE client transport.
//!
//! These run against a real axum mock upstream speaking the SSE + POST
//! protocol: endpoint handshake, request/response correlation, observer
//! ordering, timeouts, queueing while disconnected, and the reconnect loop.

mod common;

use common::{wait_for, MockUpstream};
use nexus_mcp::error::TransportError;
use nexus_mcp::transport::{SseTransport, Transport, TransportConfig, TransportObserver};
use nexus_mcp::types::{McpMessage, McpNotification, McpRequest, RequestId};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Observer that records everything it sees.
#[derive(Default)]
struct Recorder {
    messages: Mutex<Vec<McpMessage>>,
    errors: Mutex<Vec<TransportError>>,
    closed: AtomicBool,
    reconnected: AtomicBool,
}

impl TransportObserver for Recorder {
    fn on_message(&self, message: &McpMessage) {
        self.messages.lock().push(message.clone());
    }

    fn on_error(&self, error: &TransportError) {
        self.errors.lock().push(error.clone());
    }

    fn on_reconnect(&self) {
        self.reconnected.store(true, Ordering::SeqCst);
    }

    fn on_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn fast_transport(base_url: &str, timeout_ms: u64) -> SseTransport {
    let mut config = TransportConfig::new(base_url);
    config.timeout = Duration::from_millis(timeout_ms);
    config.retry_delay = Duration::from_millis(50);
    config.max_retries = 5;
    SseTransport::new(config).unwrap()
}

#[tokio::test]
async fn test_start_handshake_and_request_roundtrip() {
    let mock = MockUpstream::start().await;
    mock.set_tools(vec![json!({"name": "echo"})]);

    let transport = fast_transport(&mock.base_url, 5_000);
    transport.start().await.unwrap();
    assert!(transport.is_connected());
    assert_eq!(mock.session_count(), 1);

    let response = transport
        .request(McpRequest::new(
            "tools/call",
            json!({"name": "echo", "arguments": {"text": "hi"}}),
            RequestId::Number(1),
        ))
        .await
        .unwrap();

    assert_eq!(response.id, Some(RequestId::Number(1)));
    assert_eq!(response.result.unwrap(), json!({"echo": "hi"}));

    // start is idempotent: no second session
    transport.start().await.unwrap();
    assert_eq!(mock.session_count(), 1);

    transport.close().await;
}

#[tokio::test]
async fn test_rpc_error_surfaces_with_upstream_code() {
    let mock = MockUpstream::start().await;
    let transport = fast_transport(&mock.base_url, 5_000);
    transport.start().await.unwrap();

    let result = transport
        .request(McpRequest::new(
            "tools/call",
            json!({"name": "no_such_tool"}),
            RequestId::Number(2),
        ))
        .await;

    match result {
        Err(TransportError::Rpc(error)) => {
            assert_eq!(error.code, -32602);
            assert!(!TransportError::Rpc(error).is_retryable());
        },
        other => panic!("expected rpc error, got {:?}", other),
    }

    transport.close().await;
}

#[tokio::test]
async fn test_observer_sees_notifications_and_correlated_responses() {
    let mock = MockUpstream::start().await;
    let transport = fast_transport(&mock.base_url, 5_000);
    let recorder = Arc::new(Recorder::default());
    transport.set_observer(recorder.clone());
    transport.start().await.unwrap();

    // "notify" pushes an unsolicited notification ahead of the reply
    let response = transport
        .request(McpRequest::new("notify", json!({}), RequestId::Number(3)))
        .await
        .unwrap();
    assert_eq!(response.result.unwrap(), json!({"notified": true}));

    assert!(
        wait_for(|| recorder.messages.lock().len() >= 2, Duration::from_secs(2)).await,
        "observer should see both messages"
    );
    let messages = recorder.messages.lock();
    assert!(matches!(messages[0], McpMessage::Notification(_)));
    assert!(matches!(messages[1], McpMessage::Response(_)));

    transport.close().await;
}

#[tokio::test]
async fn test_request_times_out_when_upstream_is_silent() {
    let mock = MockUpstream::start().await;
    mock.silence_method("tools/list");

    let transport = fast_transport(&mock.base_url, 300);
    transport.start().await.unwrap();

    let result = transport
        .request(McpRequest::new("tools/list", json!({}), RequestId::Number(4)))
        .await;
    assert!(matches!(result, Err(TransportError::Timeout(300))));

    // the pending slot is released; the id may be reused
    let result = transport
        .request(McpRequest::new("tools/list", json!({}), RequestId::Number(4)))
        .await;
    assert!(matches!(result, Err(TransportError::Timeout(_))));

    transport.close().await;
}

#[tokio::test]
async fn test_duplicate_in_flight_id_rejected() {
    let mock = MockUpstream::start().await;
    mock.silence_method("tools/list");

    let transport = fast_transport(&mock.base_url, 2_000);
    transport.start().await.unwrap();

    let hanging = transport.clone();
    let handle = tokio::spawn(async move {
        hanging
            .request(McpRequest::new("tools/list", json!({}), RequestId::Number(5)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let result = transport
        .request(McpRequest::new("tools/list", json!({}), RequestId::Number(5)))
        .await;
    assert!(matches!(result, Err(TransportError::InvalidMessage(_))));

    transport.close().await;
    let _ = handle.await;
}

#[tokio::test]
async fn test_close_fails_pending_with_non_retryable_error() {
    let mock = MockUpstream::start().await;
    mock.silence_method("tools/list");

    let transport = fast_transport(&mock.base_url, 5_000);
    transport.start().await.unwrap();

    let pending = transport.clone();
    let handle = tokio::spawn(async move {
        pending
            .request(McpRequest::new("tools/list", json!({}), RequestId::Number(6)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    transport.close().await;

    match handle.await.unwrap() {
        Err(TransportError::ConnectionClosed { retryable }) => assert!(!retryable),
        other => panic!("expected connection-closed, got {:?}", other),
    }

    // a closed transport refuses further sends
    let result = transport
        .send(McpMessage::Notification(McpNotification::new(
            "notifications/test",
            json!({}),
        )))
        .await;
    assert!(matches!(result, Err(TransportError::NotConnected)));
}

#[tokio::test]
async fn test_send_before_start_queues_and_auto_starts() {
    let mock = MockUpstream::start().await;
    let transport = fast_transport(&mock.base_url, 5_000);

    // never started: the send enqueues and kicks off a connect
    transport
        .send(McpMessage::Notification(McpNotification::new(
            "notifications/warmup",
            json!({"n": 1}),
        )))
        .await
        .unwrap();

    assert!(
        wait_for(
            || mock.received_count("notifications/warmup") == 1,
            Duration::from_secs(2)
        )
        .await,
        "queued notification should flush after auto-start"
    );
    assert!(transport.is_connected());

    transport.close().await;
}

#[tokio::test]
async fn test_request_on_idle_transport_resolves_after_auto_start() {
    let mock = MockUpstream::start().await;
    mock.set_tools(vec![json!({"name": "echo"})]);

    let transport = fast_transport(&mock.base_url, 5_000);
    let response = transport
        .request(McpRequest::new("tools/list", json!({}), RequestId::Number(7)))
        .await
        .unwrap();

    assert_eq!(response.result.unwrap()["tools"][0]["name"], json!("echo"));
    transport.close().await;
}

#[tokio::test]
async fn test_reconnect_after_stream_drop() {
    let mock = MockUpstream::start().await;
    let transport = fast_transport(&mock.base_url, 2_000);
    let recorder = Arc::new(Recorder::default());
    transport.set_observer(recorder.clone());
    transport.start().await.unwrap();

    // a request in flight when the stream drops fails retryable
    mock.silence_method("tools/list");
    let pending = transport.clone();
    let in_flight = tokio::spawn(async move {
        pending
            .request(McpRequest::new("tools/list", json!({}), RequestId::Number(8)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    mock.drop_sessions();

    match in_flight.await.unwrap() {
        Err(e) => assert!(e.is_retryable(), "in-flight failure must be retryable: {}", e),
        Ok(_) => panic!("in-flight request should not survive the drop"),
    }

    assert!(
        wait_for(
            || recorder.reconnected.load(Ordering::SeqCst),
            Duration::from_secs(3)
        )
        .await,
        "transport should reconnect within backoff"
    );

    // the fresh session serves requests again
    let response = transport
        .request(McpRequest::new(
            "tools/call",
            json!({"name": "echo", "arguments": {"text": "back"}}),
            RequestId::Number(9),
        ))
        .await
        .unwrap();
    assert_eq!(response.result.unwrap(), json!({"echo": "back"}));
    assert!(!recorder.closed.load(Ordering::SeqCst));

    transport.close().await;
}

#[tokio::test]
async fn test_reconnect_exhaustion_closes_terminally() {
    let mock = MockUpstream::start().await;

    let mut config = TransportConfig::new(&mock.base_url);
    config.timeout = Duration::from_millis(1_000);
    config.retry_delay = Duration::from_millis(50);
    config.max_retries = 2;
    let transport = SseTransport::new(config).unwrap();

    let recorder = Arc::new(Recorder::default());
    transport.set_observer(recorder.clone());
    transport.start().await.unwrap();

    mock.shutdown();

    assert!(
        wait_for(
            || recorder.closed.load(Ordering::SeqCst),
            Duration::from_secs(5)
        )
        .await,
        "exhausted reconnects must close the transport"
    );
    assert!(recorder
        .errors
        .lock()
        .iter()
        .any(|e| matches!(e, TransportError::ReconnectionFailed { attempts: 2 })));
    assert!(!transport.is_connected());
}
