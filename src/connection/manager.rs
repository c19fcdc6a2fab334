//! Reconnecting request/response multiplexer over a WebSocket.
//!
//! # States
//! ```text
//! Disconnected → Connecting → Connected
//!                    ↑            │ (probe failure, read error, peer close)
//!                    │            ▼
//!               Reconnecting ← Disconnected
//!                    │
//!                    ▼ (attempts exhausted)
//!                  Failed
//! ```
//!
//! # Design Decisions
//! - Outbound requests are matched to responses by correlation id, not order
//! - Reconnect backoff is linear (`base * attempt`); queued retries own the
//!   exponential policy
//! - A request that cannot be delivered falls back to the out-of-band caller,
//!   then to the retry queue, in that order

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::connection::frame::{Frame, FrameType};
use crate::error::{BridgeError, Result};
use crate::observability::metrics;
use crate::queue::{JsonMap, QueueStore};
use crate::resilience::CircuitBreaker;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Async event handler invoked for inbound event frames.
pub type EventHandler = Arc<dyn Fn(JsonMap) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure into an [`EventHandler`].
pub fn event_handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(JsonMap) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |data| Box::pin(f(data)))
}

/// One-shot out-of-band delivery path used when the socket is down
/// (e.g. an HTTP webhook).
#[async_trait::async_trait]
pub trait OutOfBand: Send + Sync {
    async fn call(&self, method: &str, data: &JsonMap) -> Result<Value>;
}

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket endpoint.
    pub url: String,

    /// Client name announced in the handshake frame.
    pub client_name: String,

    /// Optional token carried in the handshake frame.
    pub auth_token: Option<String>,

    /// Liveness ping interval while connected.
    pub ping_interval: Duration,

    /// Default deadline for request/response round trips.
    pub request_timeout: Duration,

    /// Base delay for linear reconnect backoff.
    pub reconnect_base: Duration,

    /// Reconnect attempts before giving up (`Failed`).
    pub max_reconnect_attempts: u32,

    /// Consecutive missed pongs before the connection is declared dead.
    pub probe_failure_threshold: u32,

    /// `max_retries` applied to items this manager defers into the queue.
    pub queued_max_retries: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            client_name: "voice-bridge".to_string(),
            auth_token: None,
            ping_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            reconnect_base: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            probe_failure_threshold: 3,
            queued_max_retries: 3,
        }
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Diagnostic view of a manager.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub service: String,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub pending_requests: usize,
}

/// Owns one long-lived bidirectional connection to a remote endpoint.
pub struct ConnectionManager {
    service: String,
    config: ConnectionConfig,
    breaker: Arc<CircuitBreaker>,
    queue: Option<QueueStore>,
    fallback: Option<Arc<dyn OutOfBand>>,

    state: Mutex<ConnectionState>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    pending: DashMap<String, oneshot::Sender<Result<Value>>>,
    event_handlers: DashMap<String, EventHandler>,

    reconnect_attempts: AtomicU32,
    reconnect_scheduled: AtomicBool,
    closing: AtomicBool,
    last_pong: Mutex<Instant>,

    /// Probe + inbound loop handles for the current connection instance.
    loops: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,

    /// Self-handle for tasks spawned from `&self` methods.
    weak: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(
        service: &str,
        config: ConnectionConfig,
        breaker: Arc<CircuitBreaker>,
        queue: Option<QueueStore>,
        fallback: Option<Arc<dyn OutOfBand>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            service: service.to_string(),
            config,
            breaker,
            queue,
            fallback,
            state: Mutex::new(ConnectionState::Disconnected),
            writer: tokio::sync::Mutex::new(None),
            pending: DashMap::new(),
            event_handlers: DashMap::new(),
            reconnect_attempts: AtomicU32::new(0),
            reconnect_scheduled: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            last_pong: Mutex::new(Instant::now()),
            loops: tokio::sync::Mutex::new(Vec::new()),
            reconnect_task: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    fn strong(&self) -> Option<Arc<Self>> {
        self.weak.upgrade()
    }

    /// Register the handler for an inbound event tag. Startup-time wiring.
    pub fn register_event_handler(&self, event: &str, handler: EventHandler) {
        if self
            .event_handlers
            .insert(event.to_string(), handler)
            .is_some()
        {
            tracing::warn!(service = %self.service, event = %event, "Replaced existing event handler");
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            service: self.service.clone(),
            state: self.state(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::SeqCst),
            pending_requests: self.pending.len(),
        }
    }

    /// Open the connection, perform the handshake, and start the probe and
    /// inbound loops. Gated by the circuit breaker; a failed attempt
    /// schedules reconnection.
    pub async fn connect(&self) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(BridgeError::ConnectionLost("client closed".to_string()));
        }

        {
            let mut state = lock(&self.state);
            if *state == ConnectionState::Connected {
                tracing::debug!(service = %self.service, "Already connected");
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }

        tracing::info!(service = %self.service, url = %self.config.url, "Connecting");

        let Some(this) = self.strong() else {
            return Err(BridgeError::ConnectionLost("manager dropped".to_string()));
        };
        match self.breaker.call(|| this.open_socket()).await {
            Ok(()) => {
                tracing::info!(service = %self.service, "Connected");
                Ok(())
            }
            Err(e) => {
                tracing::error!(service = %self.service, error = %e, "Connection attempt failed");
                *lock(&self.state) = ConnectionState::Disconnected;
                self.schedule_reconnect();
                Err(e)
            }
        }
    }

    async fn open_socket(self: Arc<Self>) -> Result<()> {
        let (ws, _response) = connect_async(self.config.url.as_str()).await?;
        let (sink, source) = ws.split();

        // Tear down loops from any previous connection instance before the
        // new ones start; stale loops must never touch the fresh pending map.
        self.abort_loops().await;
        *self.writer.lock().await = Some(sink);

        self.transmit(&Frame::handshake(
            &self.config.client_name,
            self.config.auth_token.as_deref(),
        ))
        .await?;

        *lock(&self.state) = ConnectionState::Connected;
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        *lock(&self.last_pong) = Instant::now();

        let probe = tokio::spawn(Self::probe_loop(self.clone()));
        let inbound = tokio::spawn(Self::inbound_loop(self.clone(), source));
        let mut loops = self.loops.lock().await;
        loops.push(probe);
        loops.push(inbound);

        Ok(())
    }

    /// Send a request frame and await the correlated response.
    ///
    /// On timeout the correlation id is deregistered; a late response is
    /// dropped as unmatched, never misattributed.
    pub async fn send(&self, method: &str, data: JsonMap, timeout: Duration) -> Result<Value> {
        if self.state() != ConnectionState::Connected {
            return Err(BridgeError::ConnectionLost(format!(
                "{} is not connected",
                self.service
            )));
        }

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        if let Err(e) = self.transmit(&Frame::request(&id, method, data)).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::ConnectionLost(format!(
                "{} dropped while awaiting response",
                self.service
            ))),
            Err(_) => {
                self.pending.remove(&id);
                Err(BridgeError::Timeout { id, timeout })
            }
        }
    }

    /// Deliver a request through the best available path.
    ///
    /// Live socket first, the out-of-band caller when the socket is down, the
    /// retry queue as the last line of defense. Both network paths run under
    /// this dependency's breaker. The caller of a queued request gets a
    /// `Deferred` error carrying the queue item id.
    pub async fn dispatch(&self, method: &str, data: JsonMap) -> Result<Value> {
        let mut cause: Option<BridgeError> = None;

        if self.state() == ConnectionState::Connected {
            let payload = data.clone();
            match self
                .breaker
                .call(|| self.send(method, payload, self.config.request_timeout))
                .await
            {
                Ok(value) => {
                    metrics::record_dependency_call(&self.service, "ok");
                    return Ok(value);
                }
                Err(e) if e.is_transient() || matches!(e, BridgeError::CircuitOpen { .. }) => {
                    tracing::warn!(service = %self.service, method = %method, error = %e, "Socket path failed");
                    cause = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(fallback) = &self.fallback {
            match self.breaker.call(|| fallback.call(method, &data)).await {
                Ok(value) => {
                    metrics::record_dependency_call(&self.service, "ok");
                    return Ok(value);
                }
                Err(e) if e.is_transient() || matches!(e, BridgeError::CircuitOpen { .. }) => {
                    tracing::warn!(service = %self.service, method = %method, error = %e, "Out-of-band path failed");
                    cause = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let Some(queue) = &self.queue else {
            metrics::record_dependency_call(&self.service, "error");
            return Err(cause.unwrap_or_else(|| {
                BridgeError::ConnectionLost(format!("{} is not connected", self.service))
            }));
        };

        let queue_id = queue
            .enqueue(
                &self.service,
                method,
                data,
                self.config.queued_max_retries,
                None,
            )
            .await?;
        metrics::record_dependency_call(&self.service, "deferred");
        tracing::info!(service = %self.service, method = %method, item = queue_id, "Request deferred to retry queue");
        Err(BridgeError::Deferred { queue_id })
    }

    /// Fire-and-forget event frame (no response expected).
    pub async fn send_event(&self, method: &str, data: JsonMap) -> Result<()> {
        self.transmit(&Frame::event(method, data)).await
    }

    /// Raw binary frame, used for audio streaming.
    pub async fn send_binary(&self, bytes: Vec<u8>) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| BridgeError::ConnectionLost(format!("{} has no socket", self.service)))?;
        sink.send(Message::Binary(Bytes::from(bytes))).await?;
        Ok(())
    }

    async fn transmit(&self, frame: &Frame) -> Result<()> {
        let json = serde_json::to_string(frame)
            .map_err(|e| BridgeError::Transport(format!("frame encoding failed: {e}")))?;
        let mut guard = self.writer.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| BridgeError::ConnectionLost(format!("{} has no socket", self.service)))?;
        sink.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Liveness probe loop. Pings on a fixed interval; pong staleness beyond
    /// two intervals counts as a miss, and `probe_failure_threshold`
    /// consecutive misses (or a transport error) kill the connection.
    async fn probe_loop(this: Arc<Self>) {
        let mut ticker = tokio::time::interval(this.config.ping_interval);
        ticker.tick().await; // immediate first tick, connection is fresh
        let mut misses = 0u32;

        loop {
            ticker.tick().await;
            if this.state() != ConnectionState::Connected {
                break;
            }

            let pong_age = lock(&this.last_pong).elapsed();
            if pong_age > this.config.ping_interval * 2 {
                misses += 1;
                tracing::warn!(
                    service = %this.service,
                    misses = misses,
                    "Liveness probe unanswered"
                );
                if misses >= this.config.probe_failure_threshold {
                    this.handle_disconnect("liveness probes unanswered").await;
                    break;
                }
            } else {
                misses = 0;
            }

            let result = {
                let mut guard = this.writer.lock().await;
                match guard.as_mut() {
                    Some(sink) => sink.send(Message::Ping(Bytes::new())).await,
                    None => break,
                }
            };
            if let Err(e) = result {
                tracing::warn!(service = %this.service, error = %e, "Ping transmit failed");
                this.handle_disconnect("ping transmit failed").await;
                break;
            }
        }
    }

    /// Inbound loop. Reads frames until the connection closes or errors.
    async fn inbound_loop(this: Arc<Self>, mut source: WsSource) {
        while let Some(message) = source.next().await {
            match message {
                Ok(Message::Text(text)) => this.handle_frame(text.as_str()),
                Ok(Message::Pong(_)) => {
                    *lock(&this.last_pong) = Instant::now();
                }
                Ok(Message::Ping(payload)) => {
                    let mut guard = this.writer.lock().await;
                    if let Some(sink) = guard.as_mut() {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                }
                Ok(Message::Close(_)) => {
                    this.handle_disconnect("peer closed the connection").await;
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(service = %this.service, error = %e, "Read error");
                    this.handle_disconnect("read error").await;
                    return;
                }
            }
        }
        this.handle_disconnect("stream ended").await;
    }

    /// Decode one inbound frame and dispatch it by logical type.
    fn handle_frame(&self, raw: &str) {
        let frame: Frame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(service = %self.service, error = %e, "Invalid frame, dropping");
                return;
            }
        };

        match frame.frame_type {
            FrameType::Response => {
                let Some(id) = frame.id.as_deref() else {
                    tracing::warn!(service = %self.service, "Response frame without id");
                    return;
                };
                match self.pending.remove(id) {
                    Some((_, tx)) => {
                        let _ = tx.send(Ok(frame.data.unwrap_or(Value::Null)));
                    }
                    None => {
                        // Timed out or never ours; dropping is the contract
                        tracing::warn!(service = %self.service, id = %id, "Response for unknown request, dropping");
                    }
                }
            }
            FrameType::Event => {
                let Some(event) = frame.method.clone() else {
                    tracing::warn!(service = %self.service, "Event frame without method tag");
                    return;
                };
                match self.event_handlers.get(&event).map(|h| h.value().clone()) {
                    Some(handler) => {
                        tokio::spawn((handler.as_ref())(frame.data_object()));
                    }
                    None => {
                        tracing::debug!(service = %self.service, event = %event, "No handler for event");
                    }
                }
            }
            FrameType::Error => {
                tracing::error!(
                    service = %self.service,
                    data = %frame.data.unwrap_or(serde_json::Value::Null),
                    "Error frame from peer"
                );
            }
            FrameType::Handshake => {
                tracing::debug!(service = %self.service, "Handshake acknowledged");
            }
            FrameType::Request => {
                tracing::warn!(service = %self.service, "Unexpected request frame from peer, dropping");
            }
        }
    }

    /// Tear down after the connection died. Idempotent: only the first signal
    /// for a given connection instance does the work.
    async fn handle_disconnect(&self, reason: &str) {
        {
            let mut state = lock(&self.state);
            match *state {
                ConnectionState::Connected | ConnectionState::Connecting => {
                    *state = ConnectionState::Disconnected;
                }
                _ => return,
            }
        }

        tracing::warn!(service = %self.service, reason = %reason, "Disconnected");

        *self.writer.lock().await = None;
        self.fail_pending(&format!("{}: {reason}", self.service));

        if !self.closing.load(Ordering::SeqCst) {
            self.schedule_reconnect();
        }
    }

    /// Resolve every outstanding request with a connection error.
    fn fail_pending(&self, reason: &str) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let count = ids.len();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(BridgeError::ConnectionLost(reason.to_string())));
            }
        }
        if count > 0 {
            tracing::warn!(service = %self.service, count = count, "Failed pending requests");
        }
    }

    /// Schedule one reconnect attempt with linear backoff. No-ops if an
    /// attempt is already scheduled; transitions to `Failed` once the attempt
    /// budget is spent.
    fn schedule_reconnect(&self) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        if self.reconnect_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let attempts = self.reconnect_attempts.load(Ordering::SeqCst);
        if attempts >= self.config.max_reconnect_attempts {
            tracing::error!(service = %self.service, attempts = attempts, "Max reconnection attempts reached");
            *lock(&self.state) = ConnectionState::Failed;
            self.reconnect_scheduled.store(false, Ordering::SeqCst);
            return;
        }

        let Some(this) = self.strong() else {
            self.reconnect_scheduled.store(false, Ordering::SeqCst);
            return;
        };

        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = crate::resilience::backoff::reconnect_delay(attempt, self.config.reconnect_base);
        metrics::record_reconnect(&self.service);
        tracing::info!(
            service = %self.service,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnection"
        );

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.closing.load(Ordering::SeqCst) {
                return;
            }
            *lock(&this.state) = ConnectionState::Reconnecting;
            this.reconnect_scheduled.store(false, Ordering::SeqCst);
            // connect() reschedules on failure
            let _ = this.connect().await;
        });
        *lock(&self.reconnect_task) = Some(handle);
    }

    async fn abort_loops(&self) {
        let mut loops = self.loops.lock().await;
        for handle in loops.drain(..) {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Close the connection and stop all background tasks. Suppresses any
    /// further reconnection; outstanding requests resolve with
    /// `ConnectionLost`.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        *lock(&self.state) = ConnectionState::Disconnected;

        if let Some(handle) = lock(&self.reconnect_task).take() {
            handle.abort();
        }
        self.abort_loops().await;

        let mut guard = self.writer.lock().await;
        if let Some(mut sink) = guard.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        drop(guard);

        self.fail_pending(&format!("{} shutting down", self.service));
        tracing::info!(service = %self.service, "Connection closed");
    }

    /// Name of the dependency this manager serves.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Breaker stats for diagnostics.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
