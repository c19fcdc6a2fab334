//! Event broker client.
//!
//! # Responsibilities
//! - Publish lifecycle events (transcriptions, responses, errors) to the
//!   broker bridge
//! - Degrade to queued delivery when the broker is unreachable
//!
//! # Design Decisions
//! - The broker is optional; when disabled every publish is a cheap no-op
//! - Publishes ride the connection manager's dispatch ladder, so a broker
//!   outage defers events instead of losing them

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::config::schema::{BrokerConfig, ResilienceConfig};
use crate::connection::{ConnectionConfig, ConnectionManager};
use crate::error::{BridgeError, Result};
use crate::queue::{JsonMap, QueueStore, RetryHandler};
use crate::resilience::{BreakerConfig, CircuitBreaker};

/// Delivery priority attached to published events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl EventPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventPriority::Low => "low",
            EventPriority::Normal => "normal",
            EventPriority::High => "high",
            EventPriority::Critical => "critical",
        }
    }
}

/// Retry executor for queued publishes: replay through the manager.
struct BrokerRetryHandler {
    manager: Arc<ConnectionManager>,
}

#[async_trait::async_trait]
impl RetryHandler for BrokerRetryHandler {
    async fn handle(
        &self,
        method: &str,
        payload: &JsonMap,
        _metadata: Option<&JsonMap>,
    ) -> Result<()> {
        self.manager
            .send(method, payload.clone(), Duration::from_secs(10))
            .await
            .map(|_| ())
    }
}

/// Client for the optional event broker.
pub struct BrokerClient {
    manager: Arc<ConnectionManager>,
    topic_prefix: String,
}

impl BrokerClient {
    pub const SERVICE: &'static str = "broker";

    pub fn new(
        config: &BrokerConfig,
        resilience: &ResilienceConfig,
        client_name: &str,
        queue: QueueStore,
    ) -> Arc<Self> {
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
                probe_failure_threshold: 3,
                queued_max_retries: config.queued_max_retries,
            },
            breaker,
            Some(queue),
            None,
        );

        Arc::new(Self {
            manager,
            topic_prefix: config.topic_prefix.clone(),
        })
    }

    /// The retry handler to register with the queue processor.
    pub fn retry_handler(&self) -> Arc<dyn RetryHandler> {
        Arc::new(BrokerRetryHandler {
            manager: self.manager.clone(),
        })
    }

    pub async fn connect(&self) -> Result<()> {
        self.manager.connect().await
    }

    /// Publish one event. A broker outage defers the event into the retry
    /// queue; the `Deferred` outcome is surfaced to the caller.
    pub async fn publish(
        &self,
        event_type: &str,
        payload: JsonMap,
        priority: EventPriority,
    ) -> Result<Value> {
        let mut data = JsonMap::new();
        data.insert(
            "topic".to_string(),
            Value::from(format!("{}.{}", self.topic_prefix, event_type)),
        );
        data.insert("event_type".to_string(), Value::from(event_type));
        data.insert("priority".to_string(), Value::from(priority.as_str()));
        data.insert("payload".to_string(), Value::Object(payload));

        self.manager.dispatch("publish", data).await
    }

    /// Publish, treating a deferred outcome as success. For fire-and-forget
    /// lifecycle events where eventual delivery is enough.
    pub async fn publish_relaxed(
        &self,
        event_type: &str,
        payload: JsonMap,
        priority: EventPriority,
    ) -> Result<()> {
        match self.publish(event_type, payload, priority).await {
            Ok(_) => Ok(()),
            Err(BridgeError::Deferred { queue_id }) => {
                tracing::debug!(event = %event_type, item = queue_id, "Event deferred");
                Ok(())
            }
            Err(e) => Err(e),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_labels() {
        assert_eq!(EventPriority::Low.as_str(), "low");
        assert_eq!(EventPriority::Critical.as_str(), "critical");
    }
}
