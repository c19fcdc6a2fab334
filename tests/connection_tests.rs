//! Connection manager scenarios against a scripted mock WebSocket server.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use voice_bridge::connection::{
    event_handler, ConnectionConfig, ConnectionManager, ConnectionState,
};
use voice_bridge::error::BridgeError;
use voice_bridge::queue::JsonMap;
use voice_bridge::resilience::{BreakerConfig, CircuitBreaker};

mod common;

/// A breaker that stays out of the way (tests target the manager).
fn permissive_breaker() -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(BreakerConfig {
        name: "test".to_string(),
        failure_threshold: 1000,
        recovery_timeout: Duration::from_secs(1),
    }))
}

fn manager_for(url: &str, reconnect_base: Duration, max_attempts: u32) -> Arc<ConnectionManager> {
    ConnectionManager::new(
        "test",
        ConnectionConfig {
            url: url.to_string(),
            request_timeout: Duration::from_secs(1),
            reconnect_base,
            max_reconnect_attempts: max_attempts,
            ..ConnectionConfig::default()
        },
        permissive_breaker(),
        None,
        None,
    )
}

#[tokio::test]
async fn test_send_receives_correlated_response() {
    let (url, state) = common::start_mock_ws().await;
    let manager = manager_for(&url, Duration::from_secs(60), 5);

    manager.connect().await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);

    let value = manager
        .send("ping", JsonMap::new(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(value["echo"], "ping");

    assert_eq!(state.request_count(), 1);
    assert_eq!(state.handshakes.load(Ordering::SeqCst), 1);
    assert_eq!(manager.snapshot().pending_requests, 0);

    manager.close().await;
}

#[tokio::test]
async fn test_timeout_removes_pending_and_late_response_drops() {
    let (url, state) = common::start_mock_ws().await;
    state.respond.store(false, Ordering::SeqCst);
    let manager = manager_for(&url, Duration::from_secs(60), 5);
    manager.connect().await.unwrap();

    let result = manager
        .send("slow", JsonMap::new(), Duration::from_millis(300))
        .await;
    assert!(matches!(result, Err(BridgeError::Timeout { .. })));
    assert_eq!(manager.snapshot().pending_requests, 0);

    // The remote answers late; the response must be dropped, not misattributed
    let (late_id, _) = state.requests.lock().unwrap()[0].clone();
    state.inject(json!({
        "type": "response",
        "id": late_id,
        "data": { "echo": "slow" },
        "timestamp": 0.0,
    }));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.snapshot().pending_requests, 0);

    // The connection still works for fresh requests
    state.respond.store(true, Ordering::SeqCst);
    let value = manager
        .send("again", JsonMap::new(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(value["echo"], "again");

    manager.close().await;
}

#[tokio::test]
async fn test_disconnect_resolves_pending_and_schedules_one_reconnect() {
    let (url, state) = common::start_mock_ws().await;
    state.respond.store(false, Ordering::SeqCst);
    let manager = manager_for(&url, Duration::from_secs(60), 5);
    manager.connect().await.unwrap();

    // Park a request in flight
    let in_flight = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .send("parked", JsonMap::new(), Duration::from_secs(10))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(manager.snapshot().pending_requests, 1);

    state.close_current();

    let result = in_flight.await.unwrap();
    assert!(matches!(result, Err(BridgeError::ConnectionLost(_))));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
    assert_eq!(snapshot.pending_requests, 0);
    assert_eq!(snapshot.reconnect_attempts, 1);

    // No second timer appears while the first sleeps
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(manager.snapshot().reconnect_attempts, 1);

    manager.close().await;
}

#[tokio::test]
async fn test_reconnects_until_failed() {
    // Nothing listens here; every attempt is refused
    let manager = manager_for("ws://127.0.0.1:1", Duration::from_millis(50), 3);

    let result = manager.connect().await;
    assert!(result.is_err());

    // Attempts run at 50ms, 100ms, 150ms; well within the wait
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(manager.state(), ConnectionState::Failed);
    assert_eq!(manager.snapshot().reconnect_attempts, 3);

    manager.close().await;
}

#[tokio::test]
async fn test_reconnect_recovers_after_outage() {
    let (url, state) = common::start_mock_ws().await;
    let manager = manager_for(&url, Duration::from_millis(100), 10);
    manager.connect().await.unwrap();

    state.close_current();
    tokio::time::sleep(Duration::from_millis(600)).await;

    // The scheduled attempt reconnected to the still-running server
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(state.handshakes.load(Ordering::SeqCst) >= 2);

    // And the attempt counter was reset by the successful connect
    assert_eq!(manager.snapshot().reconnect_attempts, 0);

    manager.close().await;
}

#[tokio::test]
async fn test_event_frames_dispatch_to_handler() {
    let (url, state) = common::start_mock_ws().await;
    let manager = manager_for(&url, Duration::from_secs(60), 5);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    manager.register_event_handler(
        "workflow_started",
        event_handler(move |data: JsonMap| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(data);
            }
        }),
    );

    manager.connect().await.unwrap();
    state.inject(json!({
        "type": "event",
        "method": "workflow_started",
        "data": { "workflow": "daily-briefing" },
        "timestamp": 0.0,
    }));

    let data = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data["workflow"], "daily-briefing");

    manager.close().await;
}

#[tokio::test]
async fn test_unmatched_and_error_frames_are_not_fatal() {
    let (url, state) = common::start_mock_ws().await;
    let manager = manager_for(&url, Duration::from_secs(60), 5);
    manager.connect().await.unwrap();

    state.inject(json!({
        "type": "response",
        "id": "nobody-asked",
        "data": {},
        "timestamp": 0.0,
    }));
    state.inject(json!({
        "type": "error",
        "data": { "message": "upstream hiccup" },
        "timestamp": 0.0,
    }));
    state.inject(json!({
        "type": "event",
        "method": "unregistered_event",
        "data": {},
        "timestamp": 0.0,
    }));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(manager.state(), ConnectionState::Connected);
    let value = manager
        .send("still_alive", JsonMap::new(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(value["echo"], "still_alive");

    manager.close().await;
}

#[tokio::test]
async fn test_send_while_disconnected_fails_fast() {
    let manager = manager_for("ws://127.0.0.1:1", Duration::from_secs(60), 3);

    let result = manager
        .send("nope", JsonMap::new(), Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(BridgeError::ConnectionLost(_))));

    manager.close().await;
}

#[tokio::test]
async fn test_close_suppresses_reconnect() {
    let (url, state) = common::start_mock_ws().await;
    let manager = manager_for(&url, Duration::from_millis(100), 10);
    manager.connect().await.unwrap();

    manager.close().await;
    state.close_current();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.snapshot().reconnect_attempts, 0);
}
