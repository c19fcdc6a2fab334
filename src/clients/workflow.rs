//! Workflow endpoint client.
//!
//! # Responsibilities
//! - Trigger workflow runs over the WebSocket stream when available
//! - Fall back to the HTTP webhook when the stream is down
//! - Re-send queued requests through the webhook (retry handler)
//! - Surface connection diagnostics
//!
//! # Design Decisions
//! - The webhook is the mandatory delivery path; the stream is an
//!   optimization and may be absent entirely
//! - Queued retries always use the webhook: it is the idempotent-safe,
//!   one-shot path

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::schema::{ResilienceConfig, WorkflowConfig};
use crate::connection::{ConnectionConfig, ConnectionManager, EventHandler, OutOfBand};
use crate::error::{BridgeError, Result};
use crate::queue::{JsonMap, QueueStore, RetryHandler};
use crate::resilience::{BreakerConfig, CircuitBreaker};

/// Connection timeout for webhook calls, separate from the request deadline.
const WEBHOOK_CONNECT_TIMEOUT_SECS: u64 = 10;

/// One-shot HTTP webhook caller; the out-of-band path of the manager.
pub struct WebhookCaller {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl WebhookCaller {
    fn new(config: &WorkflowConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(WEBHOOK_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| BridgeError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: config.webhook_url.clone(),
            api_key: config.api_key.clone(),
        })
    }

    /// Reachability probe. Any HTTP answer counts; only transport failures
    /// mean the endpoint is down.
    async fn reachable(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "Webhook probe failed");
                false
            }
        }
    }
}

#[async_trait]
impl OutOfBand for WebhookCaller {
    async fn call(&self, method: &str, data: &JsonMap) -> Result<Value> {
        let request_id = Uuid::new_v4().to_string();
        let body = json!({
            "method": method,
            "data": data,
            "timestamp": std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        });

        let mut request = self
            .client
            .post(&self.url)
            .json(&body)
            .header("X-Request-ID", &request_id);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            tracing::debug!(url = %self.url, method = %method, status = %status, "Webhook delivered");
            Ok(response.json().await.unwrap_or(Value::Null))
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(BridgeError::Remote(format!(
                "webhook returned {status}: {text}"
            )))
        }
    }
}

/// Retry executor for queued workflow requests.
struct WorkflowRetryHandler {
    webhook: Arc<WebhookCaller>,
}

#[async_trait]
impl RetryHandler for WorkflowRetryHandler {
    async fn handle(
        &self,
        method: &str,
        payload: &JsonMap,
        _metadata: Option<&JsonMap>,
    ) -> Result<()> {
        self.webhook.call(method, payload).await.map(|_| ())
    }
}

/// Client for the workflow automation endpoint.
pub struct WorkflowClient {
    manager: Arc<ConnectionManager>,
    webhook: Arc<WebhookCaller>,
    queue: QueueStore,
    has_stream: bool,
}

impl WorkflowClient {
    pub const SERVICE: &'static str = "workflow";

    pub fn new(
        config: &WorkflowConfig,
        resilience: &ResilienceConfig,
        client_name: &str,
        queue: QueueStore,
    ) -> Result<Arc<Self>> {
        let webhook = Arc::new(WebhookCaller::new(config)?);

        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            name: Self::SERVICE.to_string(),
            failure_threshold: resilience.failure_threshold,
            recovery_timeout: Duration::from_secs(resilience.recovery_timeout_secs),
        }));

        let manager = ConnectionManager::new(
            Self::SERVICE,
            ConnectionConfig {
                url: config.websocket_url.clone().unwrap_or_default(),
                client_name: client_name.to_string(),
                auth_token: config.api_key.clone(),
                ping_interval: Duration::from_secs(config.ping_interval_secs),
                request_timeout: Duration::from_secs(config.request_timeout_secs),
                reconnect_base: Duration::from_secs(config.reconnect_interval_secs),
                max_reconnect_attempts: config.max_reconnect_attempts,
                probe_failure_threshold: config.probe_failure_threshold,
                queued_max_retries: config.queued_max_retries,
            },
            breaker,
            Some(queue.clone()),
            Some(webhook.clone() as Arc<dyn OutOfBand>),
        );

        Ok(Arc::new(Self {
            manager,
            webhook,
            queue,
            has_stream: config.websocket_url.is_some(),
        }))
    }

    /// The retry handler to register with the queue processor.
    pub fn retry_handler(&self) -> Arc<dyn RetryHandler> {
        Arc::new(WorkflowRetryHandler {
            webhook: self.webhook.clone(),
        })
    }

    /// Open the stream connection when one is configured. Webhook-only setups
    /// are complete without connecting.
    pub async fn connect(&self) -> Result<()> {
        if !self.has_stream {
            tracing::info!("Workflow client in webhook-only mode");
            return Ok(());
        }
        self.manager.connect().await
    }

    /// Trigger a workflow run. Falls back webhook → retry queue when the
    /// stream is unavailable.
    pub async fn trigger(&self, method: &str, data: JsonMap) -> Result<Value> {
        self.manager.dispatch(method, data).await
    }

    /// Register a handler for server-pushed workflow events.
    pub fn register_event_handler(&self, event: &str, handler: EventHandler) {
        self.manager.register_event_handler(event, handler);
    }

    /// Connection diagnostics for the `test` CLI subcommand.
    pub async fn test_connection(&self) -> Value {
        let snapshot = self.manager.snapshot();
        let queue_stats = self.queue.stats().await.unwrap_or_default();

        json!({
            "websocket": {
                "configured": self.has_stream,
                "state": snapshot.state,
                "reconnect_attempts": snapshot.reconnect_attempts,
                "pending_requests": snapshot.pending_requests,
            },
            "webhook": {
                "configured": true,
                "reachable": self.webhook.reachable().await,
            },
            "circuit_breaker": self.manager.breaker().stats(),
            "queue": queue_stats
                .iter()
                .map(|(status, count)| (status.as_str().to_string(), json!(count)))
                .collect::<serde_json::Map<_, _>>(),
        })
    }

    pub fn snapshot(&self) -> crate::connection::ConnectionSnapshot {
        self.manager.snapshot()
    }

    pub async fn close(&self) {
        self.manager.close().await;
    }
}
