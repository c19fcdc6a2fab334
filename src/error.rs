//! Error types for voice-bridge.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Main error type shared across the resilience core and the service clients.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Transient remote failure (HTTP 5xx, refused connection, protocol error).
    /// Counted by circuit breakers and retried by the queue.
    #[error("remote failure: {0}")]
    Remote(String),

    /// Circuit is open; the wrapped operation was never invoked.
    #[error("{service}: circuit is open, call rejected")]
    CircuitOpen { service: String },

    /// A single request exceeded its deadline. Distinct from connection loss:
    /// the connection may still be healthy.
    #[error("request {id} timed out after {timeout:?}")]
    Timeout { id: String, timeout: Duration },

    /// The underlying connection died; all in-flight requests resolve with this.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The call could not be delivered now and was persisted to the retry queue.
    /// The queue item id is the only handle the caller gets.
    #[error("deferred to retry queue (item {queue_id})")]
    Deferred { queue_id: i64 },

    /// Transport-level failure (socket I/O, TLS, frame encoding).
    #[error("transport error: {0}")]
    Transport(String),

    /// Misconfiguration (missing handler, bad URL). Terminal, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Queue store read/write failure. Durability is void for the affected item.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl BridgeError {
    /// Whether this error represents a transient dependency failure.
    ///
    /// Transient errors trip circuit breakers and are eligible for queued retry.
    /// Configuration and persistence defects are not: retrying them cannot help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::Remote(_)
                | BridgeError::Timeout { .. }
                | BridgeError::ConnectionLost(_)
                | BridgeError::Transport(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        BridgeError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        BridgeError::Remote(err.to_string())
    }
}

impl From<rusqlite::Error> for BridgeError {
    fn from(err: rusqlite::Error) -> Self {
        BridgeError::Persistence(err.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Transport(err.to_string())
    }
}
