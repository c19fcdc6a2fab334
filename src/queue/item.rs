//! Queue item model.

use serde::Serialize;

/// JSON object payloads carried by queue items and wire frames.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Queue item statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Expired,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "completed" => Some(QueueStatus::Completed),
            "failed" => Some(QueueStatus::Failed),
            "expired" => Some(QueueStatus::Expired),
            _ => None,
        }
    }

    /// Terminal statuses are never retried and are eligible for cleanup.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Expired
        )
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted retry-queue record.
///
/// Timestamps are unix milliseconds. `next_retry_at` is the eligibility gate:
/// the item is invisible to the processor until it has passed.
#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub id: i64,
    pub service: String,
    pub method: String,
    pub payload: JsonMap,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: i64,
    pub updated_at: i64,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
    pub metadata: Option<JsonMap>,
}
