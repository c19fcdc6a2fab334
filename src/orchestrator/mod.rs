//! Integration orchestrator.
//!
//! # Data Flow
//! ```text
//! transcription events (final)
//!     → workflow trigger ("process_transcription")
//!     → response text → TTS synthesis → AudioSink playback
//!     → lifecycle events → broker (optional)
//!
//! Background:
//!     queue processor drains deferred requests
//!     health loop snapshots every dependency
//! ```
//!
//! # Design Decisions
//! - Every client is an owned struct constructed here; no process-wide
//!   singletons
//! - A dependency that fails to connect degrades the system, it does not
//!   abort startup; the retry queue and reconnect loops pick up the slack
//! - Shutdown signals every task and awaits them; nothing is abandoned
//!   mid-I/O

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::clients::{
    BrokerClient, EventPriority, Transcription, TranscriptionClient, TranscriptionKind, TtsClient,
    WorkflowClient,
};
use crate::config::schema::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::lifecycle::Shutdown;
use crate::queue::{JsonMap, QueueProcessor, QueueStore, StoreOptions};

/// Playback boundary. Audio decoding and output devices live outside this
/// crate; the orchestrator only hands bytes across this seam.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, audio: Arc<Vec<u8>>) -> Result<()>;
}

/// Default sink: logs and discards.
pub struct NullSink;

#[async_trait]
impl AudioSink for NullSink {
    async fn play(&self, audio: Arc<Vec<u8>>) -> Result<()> {
        tracing::info!(bytes = audio.len(), "Discarding synthesized audio (no sink configured)");
        Ok(())
    }
}

/// Overall system states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    Initializing,
    Ready,
    Listening,
    Processing,
    Speaking,
    Error,
    ShuttingDown,
}

#[derive(Default)]
struct Counters {
    transcriptions: AtomicU64,
    workflow_requests: AtomicU64,
    tts_clips: AtomicU64,
    errors: AtomicU64,
}

/// Composes the resilience core and the service clients into the
/// end-to-end voice flow.
pub struct Orchestrator {
    config: BridgeConfig,
    session_id: Uuid,
    started_at: Instant,
    state: Mutex<SystemState>,

    queue: QueueStore,
    processor: Arc<QueueProcessor>,
    workflow: Arc<WorkflowClient>,
    transcription: Arc<TranscriptionClient>,
    tts: Arc<TtsClient>,
    broker: Option<Arc<BrokerClient>>,
    sink: Arc<dyn AudioSink>,

    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,

    /// Self-handle for tasks spawned from `&self` methods.
    weak: Weak<Orchestrator>,
}

impl Orchestrator {
    pub fn new(config: BridgeConfig) -> Result<Arc<Self>> {
        Self::with_audio_sink(config, Arc::new(NullSink))
    }

    pub fn with_audio_sink(config: BridgeConfig, sink: Arc<dyn AudioSink>) -> Result<Arc<Self>> {
        let queue = QueueStore::open(
            &config.queue.db_path,
            StoreOptions {
                max_items: config.queue.max_items,
                backoff_cap_secs: config.queue.backoff_cap_secs,
                retention: Duration::from_secs(config.queue.retention_days * 24 * 60 * 60),
                item_ttl: Duration::from_secs(config.queue.item_ttl_days * 24 * 60 * 60),
            },
        )?;

        let processor = Arc::new(QueueProcessor::new(
            queue.clone(),
            Duration::from_secs(config.queue.process_interval_secs),
        ));

        let client_name = config.orchestrator.client_name.clone();
        let workflow = WorkflowClient::new(
            &config.workflow,
            &config.resilience,
            &client_name,
            queue.clone(),
        )?;
        let transcription =
            TranscriptionClient::new(&config.transcription, &config.resilience, &client_name)?;
        let tts = TtsClient::new(&config.tts, &config.resilience)?;
        let broker = config.broker.enabled.then(|| {
            BrokerClient::new(
                &config.broker,
                &config.resilience,
                &client_name,
                queue.clone(),
            )
        });

        Ok(Arc::new_cyclic(|weak| Self {
            config,
            session_id: Uuid::new_v4(),
            started_at: Instant::now(),
            state: Mutex::new(SystemState::Initializing),
            queue,
            processor,
            workflow,
            transcription,
            tts,
            broker,
            sink,
            shutdown: Shutdown::new(),
            tasks: Mutex::new(Vec::new()),
            counters: Counters::default(),
            weak: weak.clone(),
        }))
    }

    /// Wire handlers, connect every dependency, and start background tasks.
    ///
    /// Connection failures degrade to reconnect-and-queue behavior rather
    /// than aborting startup.
    pub async fn initialize(&self) -> Result<()> {
        tracing::info!(session = %self.session_id, "Initializing orchestrator");

        self.processor
            .register_handler(WorkflowClient::SERVICE, self.workflow.retry_handler());
        if let Some(broker) = &self.broker {
            self.processor
                .register_handler(BrokerClient::SERVICE, broker.retry_handler());
        }

        let weak = self.weak.clone();
        self.transcription
            .register_transcription_handler(Arc::new(move |transcription| {
                let Some(orchestrator) = weak.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    orchestrator.handle_transcription(transcription).await;
                });
            }));

        if let Err(e) = self.workflow.connect().await {
            tracing::warn!(error = %e, "Workflow stream unavailable, starting degraded");
        }
        if let Err(e) = self.transcription.connect().await {
            tracing::warn!(error = %e, "Transcription service unavailable, starting degraded");
        }
        if let Some(broker) = &self.broker {
            if let Err(e) = broker.connect().await {
                tracing::warn!(error = %e, "Broker unavailable, starting degraded");
            }
        }

        let processor = self.processor.clone();
        let processor_task = tokio::spawn(processor.run(self.shutdown.subscribe()));

        let Some(this) = self.weak.upgrade() else {
            return Err(BridgeError::Configuration(
                "orchestrator dropped during initialization".to_string(),
            ));
        };
        let health_task = tokio::spawn(Self::health_loop(this, self.shutdown.subscribe()));

        {
            let mut tasks = lock(&self.tasks);
            tasks.push(processor_task);
            tasks.push(health_task);
        }

        self.set_state(SystemState::Ready);
        tracing::info!(session = %self.session_id, "Orchestrator ready");
        Ok(())
    }

    /// Initialize, run until a termination signal, then shut down.
    pub async fn run(&self) -> Result<()> {
        self.initialize().await?;
        crate::lifecycle::signals::wait_for_signal().await;
        self.shutdown().await;
        Ok(())
    }

    /// Process one final transcription through the workflow → TTS flow.
    pub async fn handle_transcription(&self, transcription: Transcription) {
        if transcription.kind != TranscriptionKind::Final {
            return;
        }
        if transcription.text.trim().is_empty() {
            return;
        }

        self.counters.transcriptions.fetch_add(1, Ordering::Relaxed);
        self.set_state(SystemState::Processing);
        tracing::info!(chars = transcription.text.len(), "Processing transcription");

        self.publish_event(
            "transcription",
            json_map(&[("text", Value::from(transcription.text.clone()))]),
        )
        .await;

        let mut data = JsonMap::new();
        data.insert("text".to_string(), Value::from(transcription.text.clone()));
        data.insert(
            "session_id".to_string(),
            Value::from(self.session_id.to_string()),
        );

        self.counters.workflow_requests.fetch_add(1, Ordering::Relaxed);
        match self.workflow.trigger("process_transcription", data).await {
            Ok(response) => {
                if let Some(reply) = extract_reply(&response) {
                    self.speak(&reply).await;
                } else {
                    tracing::debug!("Workflow response carried no reply text");
                }
            }
            Err(BridgeError::Deferred { queue_id }) => {
                tracing::info!(item = queue_id, "Workflow request deferred; reply will not be spoken");
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "Workflow request failed");
                self.publish_event("error", json_map(&[("error", Value::from(e.to_string()))]))
                    .await;
            }
        }

        self.set_state(SystemState::Ready);
    }

    async fn speak(&self, text: &str) {
        if !self.tts.enabled() {
            tracing::debug!("TTS disabled, skipping reply playback");
            return;
        }

        self.set_state(SystemState::Speaking);
        match self.tts.synthesize(text).await {
            Ok(audio) => {
                self.counters.tts_clips.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.sink.play(audio).await {
                    tracing::error!(error = %e, "Audio playback failed");
                }
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "Speech synthesis failed");
            }
        }
    }

    async fn publish_event(&self, event_type: &str, payload: JsonMap) {
        let Some(broker) = &self.broker else {
            return;
        };
        if let Err(e) = broker
            .publish_relaxed(event_type, payload, EventPriority::Normal)
            .await
        {
            tracing::warn!(event = %event_type, error = %e, "Event publish failed");
        }
    }

    /// Periodic health snapshot: logs plus metrics.
    async fn health_loop(this: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let interval =
            Duration::from_secs(this.config.orchestrator.health_check_interval_secs);
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let workflow = this.workflow.snapshot();
                    let transcription = this.transcription.snapshot();
                    let queue_size = this.queue.size().await.unwrap_or(0);
                    tracing::info!(
                        workflow_state = %workflow.state,
                        transcription_state = %transcription.state,
                        queue_size = queue_size,
                        "Health check"
                    );
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health loop received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Full diagnostics with active probes. Backs the `test` subcommand.
    pub async fn test_integrations(&self) -> Value {
        let workflow = self.workflow.test_connection().await;
        let transcription = json!({
            "connection": self.transcription.snapshot(),
            "http_reachable": self.transcription.health().await,
            "circuit_breaker": self.transcription.breaker_stats(),
        });
        let tts = json!({
            "enabled": self.tts.enabled(),
            "reachable": self.tts.health().await,
            "circuit_breaker": self.tts.breaker_stats(),
        });
        let broker = match &self.broker {
            Some(broker) => json!({
                "enabled": true,
                "connection": broker.snapshot(),
                "circuit_breaker": broker.breaker_stats(),
            }),
            None => json!({ "enabled": false }),
        };
        let queue = self.queue_stats_json().await;

        json!({
            "session_id": self.session_id.to_string(),
            "state": self.state(),
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "workflow": workflow,
            "transcription": transcription,
            "tts": tts,
            "broker": broker,
            "queue": queue,
        })
    }

    /// Cheap passive snapshot. Backs the `health` subcommand.
    pub async fn health_snapshot(&self) -> Value {
        json!({
            "state": self.state(),
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "workflow": self.workflow.snapshot(),
            "transcription": self.transcription.snapshot(),
            "queue": self.queue_stats_json().await,
            "stats": {
                "transcriptions": self.counters.transcriptions.load(Ordering::Relaxed),
                "workflow_requests": self.counters.workflow_requests.load(Ordering::Relaxed),
                "tts_clips": self.counters.tts_clips.load(Ordering::Relaxed),
                "errors": self.counters.errors.load(Ordering::Relaxed),
            },
        })
    }

    async fn queue_stats_json(&self) -> Value {
        let stats = self.queue.stats().await.unwrap_or_default();
        Value::Object(
            stats
                .iter()
                .map(|(status, count)| (status.as_str().to_string(), json!(count)))
                .collect(),
        )
    }

    /// Signal every background task, close every connection, and wait for
    /// all of it to finish.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down orchestrator");
        self.set_state(SystemState::ShuttingDown);
        self.shutdown.trigger();

        self.workflow.close().await;
        self.transcription.close().await;
        if let Some(broker) = &self.broker {
            broker.close().await;
        }

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::error!(error = %e, "Background task panicked during shutdown");
                }
            }
        }

        tracing::info!("Orchestrator shutdown complete");
    }

    pub fn state(&self) -> SystemState {
        *lock(&self.state)
    }

    fn set_state(&self, state: SystemState) {
        *lock(&self.state) = state;
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

/// Pull the spoken reply out of a workflow response. Accepts both
/// `{"response": "..."}` and `{"data": {"response": "..."}}` shapes.
fn extract_reply(response: &Value) -> Option<String> {
    let direct = response.get("response").and_then(Value::as_str);
    let nested = response
        .get("data")
        .and_then(|d| d.get("response"))
        .and_then(Value::as_str);
    direct.or(nested).map(str::to_string)
}

fn json_map(entries: &[(&str, Value)]) -> JsonMap {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_reply_shapes() {
        let direct = json!({"response": "hi there"});
        assert_eq!(extract_reply(&direct).as_deref(), Some("hi there"));

        let nested = json!({"data": {"response": "nested"}});
        assert_eq!(extract_reply(&nested).as_deref(), Some("nested"));

        let none = json!({"status": "ok"});
        assert!(extract_reply(&none).is_none());
    }
}
