//! Streaming speech-to-text client.
//!
//! # Responsibilities
//! - Stream audio frames to the transcription service
//! - Dispatch partial and final transcription events to registered handlers
//! - Probe service health over HTTP
//!
//! # Design Decisions
//! - No webhook fallback and no retry queue: live audio cannot be replayed
//!   later, a dropped stream is simply restarted
//! - Partial transcriptions are advisory; only finals drive the workflow

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::schema::{ResilienceConfig, TranscriptionConfig};
use crate::connection::{event_handler, ConnectionConfig, ConnectionManager};
use crate::error::Result;
use crate::queue::JsonMap;
use crate::resilience::{BreakerConfig, CircuitBreaker};

/// Partial results refine as audio arrives; finals are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptionKind {
    Partial,
    Final,
}

/// One transcription result from the service.
#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub kind: TranscriptionKind,
    pub confidence: Option<f64>,
    pub language: Option<String>,
}

impl Transcription {
    fn from_event(kind: TranscriptionKind, data: &JsonMap) -> Option<Self> {
        let text = data.get("text")?.as_str()?.to_string();
        Some(Self {
            text,
            kind,
            confidence: data.get("confidence").and_then(Value::as_f64),
            language: data
                .get("language")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// Callback receiving transcription results.
pub type TranscriptionHandler = Arc<dyn Fn(Transcription) + Send + Sync>;

/// Client for the streaming transcription service.
pub struct TranscriptionClient {
    manager: Arc<ConnectionManager>,
    http: reqwest::Client,
    config: TranscriptionConfig,
    streaming: AtomicBool,
}

impl TranscriptionClient {
    pub const SERVICE: &'static str = "transcription";

    /// Health probe deadline; shorter than request timeouts on purpose.
    const HEALTH_TIMEOUT_SECS: u64 = 5;

    pub fn new(
        config: &TranscriptionConfig,
        resilience: &ResilienceConfig,
        client_name: &str,
    ) -> Result<Arc<Self>> {
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            name: Self::SERVICE.to_string(),
            failure_threshold: resilience.failure_threshold,
            recovery_timeout: Duration::from_secs(resilience.recovery_timeout_secs),
        }));

        let manager = ConnectionManager::new(
            Self::SERVICE,
            ConnectionConfig {
                url: config.websocket_url.clone(),
                client_name: client_name.to_string(),
                auth_token: None,
                ping_interval: Duration::from_secs(config.ping_interval_secs),
                request_timeout: Duration::from_secs(config.request_timeout_secs),
                reconnect_base: Duration::from_secs(config.reconnect_interval_secs),
                max_reconnect_attempts: config.max_reconnect_attempts,
                probe_failure_threshold: config.probe_failure_threshold,
                queued_max_retries: 0,
            },
            breaker,
            None,
            None,
        );

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(Self::HEALTH_TIMEOUT_SECS))
            .build()
            .map_err(|e| {
                crate::error::BridgeError::Configuration(format!(
                    "failed to build HTTP client: {e}"
                ))
            })?;

        Ok(Arc::new(Self {
            manager,
            http,
            config: config.clone(),
            streaming: AtomicBool::new(false),
        }))
    }

    pub async fn connect(&self) -> Result<()> {
        self.manager.connect().await
    }

    /// Register the callback for partial and final transcriptions.
    /// Startup-time wiring, before audio starts flowing.
    pub fn register_transcription_handler(&self, handler: TranscriptionHandler) {
        let partial = handler.clone();
        self.manager.register_event_handler(
            "partial_transcript",
            event_handler(move |data: JsonMap| {
                let handler = partial.clone();
                async move {
                    if let Some(t) = Transcription::from_event(TranscriptionKind::Partial, &data) {
                        handler(t);
                    }
                }
            }),
        );

        let fin = handler;
        self.manager.register_event_handler(
            "final_transcript",
            event_handler(move |data: JsonMap| {
                let handler = fin.clone();
                async move {
                    if let Some(t) = Transcription::from_event(TranscriptionKind::Final, &data) {
                        handler(t);
                    }
                }
            }),
        );
    }

    /// Announce a new audio stream (language, model, sample rate).
    pub async fn start_stream(&self) -> Result<()> {
        let mut data = JsonMap::new();
        data.insert("language".to_string(), Value::from(self.config.language.clone()));
        data.insert("model".to_string(), Value::from(self.config.model.clone()));
        data.insert("sample_rate".to_string(), Value::from(self.config.sample_rate));

        self.manager.send_event("start_stream", data).await?;
        self.streaming.store(true, Ordering::SeqCst);
        tracing::info!(model = %self.config.model, "Transcription stream started");
        Ok(())
    }

    /// Forward one chunk of raw audio.
    pub async fn send_audio(&self, bytes: Vec<u8>) -> Result<()> {
        self.manager.send_binary(bytes).await
    }

    /// End the current audio stream.
    pub async fn stop_stream(&self) -> Result<()> {
        self.manager.send_event("stop_stream", JsonMap::new()).await?;
        self.streaming.store(false, Ordering::SeqCst);
        tracing::info!("Transcription stream stopped");
        Ok(())
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    /// HTTP health probe against the service.
    pub async fn health(&self) -> bool {
        let url = format!("{}/health", self.config.http_url.trim_end_matches('/'));
        match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Transcription health probe failed");
                false
            }
        }
    }

    pub fn snapshot(&self) -> crate::connection::ConnectionSnapshot {
        self.manager.snapshot()
    }

    pub fn breaker_stats(&self) -> crate::resilience::circuit_breaker::BreakerStats {
        self.manager.breaker().stats()
    }

    pub async fn close(&self) {
        self.manager.close().await;
    }
}
