//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the bridge.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the bridge.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BridgeConfig {
    /// Workflow endpoint (webhook + optional stream).
    pub workflow: WorkflowConfig,

    /// Streaming speech-to-text service.
    pub transcription: TranscriptionConfig,

    /// Text-to-speech API.
    pub tts: TtsConfig,

    /// Optional event broker.
    pub broker: BrokerConfig,

    /// Durable retry queue settings.
    pub queue: QueueConfig,

    /// Circuit breaker defaults shared by all dependencies.
    pub resilience: ResilienceConfig,

    /// Orchestrator-level settings.
    pub orchestrator: OrchestratorConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Workflow endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// HTTP webhook URL (mandatory; the out-of-band delivery path).
    pub webhook_url: String,

    /// Optional WebSocket URL for the streaming path.
    pub websocket_url: Option<String>,

    /// Bearer token sent on webhook calls and in the stream handshake.
    pub api_key: Option<String>,

    /// Liveness ping interval in seconds.
    pub ping_interval_secs: u64,

    /// Per-request deadline in seconds.
    pub request_timeout_secs: u64,

    /// Base reconnect delay in seconds (linear backoff).
    pub reconnect_interval_secs: u64,

    /// Reconnect attempts before the connection is declared failed.
    pub max_reconnect_attempts: u32,

    /// Consecutive unanswered probes before disconnecting.
    pub probe_failure_threshold: u32,

    /// Retries granted to requests deferred into the queue.
    pub queued_max_retries: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            webhook_url: "http://localhost:5678/webhook/bridge".to_string(),
            websocket_url: None,
            api_key: None,
            ping_interval_secs: 30,
            request_timeout_secs: 30,
            reconnect_interval_secs: 5,
            max_reconnect_attempts: 10,
            probe_failure_threshold: 3,
            queued_max_retries: 3,
        }
    }
}

/// Speech-to-text service configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    /// WebSocket URL for audio streaming.
    pub websocket_url: String,

    /// HTTP URL for health probes.
    pub http_url: String,

    /// Language hint passed at stream start.
    pub language: String,

    /// Model name passed at stream start.
    pub model: String,

    /// Audio sample rate announced at stream start.
    pub sample_rate: u32,

    pub ping_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub reconnect_interval_secs: u64,
    pub max_reconnect_attempts: u32,
    pub probe_failure_threshold: u32,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            websocket_url: "ws://localhost:9090".to_string(),
            http_url: "http://localhost:9090".to_string(),
            language: "en".to_string(),
            model: "base".to_string(),
            sample_rate: 16_000,
            ping_interval_secs: 30,
            request_timeout_secs: 30,
            reconnect_interval_secs: 5,
            max_reconnect_attempts: 10,
            probe_failure_threshold: 3,
        }
    }
}

/// Text-to-speech API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Enable speech synthesis.
    pub enabled: bool,

    /// API base URL.
    pub api_url: String,

    /// API key (bearer).
    pub api_key: String,

    /// Voice to synthesize with.
    pub voice_id: String,

    /// Model identifier.
    pub model_id: String,

    /// Per-request deadline in seconds.
    pub request_timeout_secs: u64,

    /// Synthesized clips kept in the in-memory cache.
    pub cache_entries: usize,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: "https://api.elevenlabs.io".to_string(),
            api_key: String::new(),
            voice_id: String::new(),
            model_id: "eleven_monolingual_v1".to_string(),
            request_timeout_secs: 30,
            cache_entries: 64,
        }
    }
}

/// Event broker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Enable event publishing.
    pub enabled: bool,

    /// WebSocket URL of the broker bridge.
    pub websocket_url: String,

    /// Topic prefix for published events.
    pub topic_prefix: String,

    pub ping_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub reconnect_interval_secs: u64,
    pub max_reconnect_attempts: u32,
    pub queued_max_retries: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            websocket_url: "ws://localhost:5672/bridge".to_string(),
            topic_prefix: "voice".to_string(),
            ping_interval_secs: 30,
            request_timeout_secs: 10,
            reconnect_interval_secs: 5,
            max_reconnect_attempts: 10,
            queued_max_retries: 3,
        }
    }
}

/// Durable retry queue configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// SQLite database path.
    pub db_path: String,

    /// Maximum rows before enqueue triggers cleanup.
    pub max_items: usize,

    /// Background drain interval in seconds.
    pub process_interval_secs: u64,

    /// Cap for exponential retry backoff, in seconds.
    pub backoff_cap_secs: u64,

    /// Days terminal items are kept before purge.
    pub retention_days: u64,

    /// Days a pending item may wait before expiring.
    pub item_ttl_days: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: "bridge_queue.db".to_string(),
            max_items: 1000,
            process_interval_secs: 30,
            backoff_cap_secs: 300,
            retention_days: 7,
            item_ttl_days: 7,
        }
    }
}

/// Circuit breaker defaults applied to every dependency.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Consecutive failures before a circuit opens.
    pub failure_threshold: u32,

    /// Seconds a circuit stays open before a recovery probe.
    pub recovery_timeout_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_secs: 30,
        }
    }
}

/// Orchestrator-level settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Client name announced in stream handshakes.
    pub client_name: String,

    /// Periodic health snapshot interval in seconds.
    pub health_check_interval_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            client_name: "voice-bridge".to_string(),
            health_check_interval_secs: 30,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9464".to_string(),
        }
    }
}
