//! Shared mock servers for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::{
    extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// Control messages tests can push into the live mock connection.
pub enum Control {
    /// Send a raw text frame to the client.
    Frame(String),
    /// Close the current connection.
    Close,
}

/// Shared state of the mock WebSocket server.
pub struct MockWsState {
    /// Request frames seen, as (id, method).
    pub requests: Mutex<Vec<(String, String)>>,
    /// Handshake frames seen.
    pub handshakes: AtomicUsize,
    /// Whether request frames get an echo response.
    pub respond: AtomicBool,
    /// Control channel into the most recent connection.
    control: Mutex<Option<mpsc::UnboundedSender<Control>>>,
}

impl MockWsState {
    /// Push a frame to the currently connected client.
    pub fn inject(&self, frame: Value) {
        if let Some(tx) = self.control.lock().unwrap().as_ref() {
            let _ = tx.send(Control::Frame(frame.to_string()));
        }
    }

    /// Drop the current connection.
    pub fn close_current(&self) {
        if let Some(tx) = self.control.lock().unwrap().as_ref() {
            let _ = tx.send(Control::Close);
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

/// Start a scripted mock WebSocket endpoint. Returns its ws:// URL and state.
///
/// The server accepts sequential connections (so reconnects work), records
/// handshake and request frames, and echoes responses when `respond` is set.
pub async fn start_mock_ws() -> (String, Arc<MockWsState>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(MockWsState {
        requests: Mutex::new(Vec::new()),
        handshakes: AtomicUsize::new(0),
        respond: AtomicBool::new(true),
        control: Mutex::new(None),
    });

    let server_state = state.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let Ok(ws) = accept_async(stream).await else {
                continue;
            };

            let (tx, mut rx) = mpsc::unbounded_channel();
            *server_state.control.lock().unwrap() = Some(tx);
            let (mut sink, mut source) = ws.split();

            loop {
                tokio::select! {
                    message = source.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
                                continue;
                            };
                            match frame["type"].as_str() {
                                Some("handshake") => {
                                    server_state.handshakes.fetch_add(1, Ordering::SeqCst);
                                }
                                Some("request") => {
                                    let id = frame["id"].as_str().unwrap_or("").to_string();
                                    let method = frame["method"].as_str().unwrap_or("").to_string();
                                    server_state
                                        .requests
                                        .lock()
                                        .unwrap()
                                        .push((id.clone(), method.clone()));
                                    if server_state.respond.load(Ordering::SeqCst) {
                                        let response = json!({
                                            "type": "response",
                                            "id": id,
                                            "data": { "echo": method },
                                            "timestamp": 0.0,
                                        });
                                        if sink
                                            .send(Message::Text(response.to_string().into()))
                                            .await
                                            .is_err()
                                        {
                                            break;
                                        }
                                    }
                                }
                                _ => {}
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if sink.send(Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(_)) => break,
                    },
                    control = rx.recv() => match control {
                        Some(Control::Frame(frame)) => {
                            if sink.send(Message::Text(frame.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(Control::Close) => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                        None => break,
                    },
                }
            }
        }
    });

    (format!("ws://{addr}"), state)
}

/// Shared state of the mock webhook endpoint.
pub struct MockWebhookState {
    pub healthy: AtomicBool,
    pub hits: AtomicUsize,
    pub bodies: Mutex<Vec<Value>>,
}

/// Start a mock HTTP webhook. Returns its URL and state.
pub async fn start_mock_webhook() -> (String, Arc<MockWebhookState>) {
    let state = Arc::new(MockWebhookState {
        healthy: AtomicBool::new(true),
        hits: AtomicUsize::new(0),
        bodies: Mutex::new(Vec::new()),
    });

    let app = Router::new()
        .route("/webhook", post(handle_webhook))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}/webhook"), state)
}

async fn handle_webhook(
    State(state): State<Arc<MockWebhookState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    state.bodies.lock().unwrap().push(body);

    if state.healthy.load(Ordering::SeqCst) {
        (StatusCode::OK, Json(json!({ "response": "ack" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "down" })),
        )
    }
}
