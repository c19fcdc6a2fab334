//! Background queue processor.
//!
//! # Responsibilities
//! - Hold the service-name → retry-handler registry
//! - Drain eligible items on a fixed interval
//! - Guard against overlapping runs
//!
//! # Design Decisions
//! - Handlers are registered once at startup; replacing one is logged
//! - An item whose service has no handler is a configuration defect and is
//!   failed terminally, without backoff
//! - Items are processed one at a time per run; FIFO order comes from the
//!   store's eligibility scan

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::observability::metrics;
use crate::queue::item::JsonMap;
use crate::queue::store::QueueStore;

/// Executor for queued retries of one service.
///
/// Called with the original method name, payload, and metadata. Must be
/// idempotent: the queue delivers at least once, and a crash between the
/// handler succeeding and the completion write causes redelivery.
#[async_trait]
pub trait RetryHandler: Send + Sync {
    async fn handle(
        &self,
        method: &str,
        payload: &JsonMap,
        metadata: Option<&JsonMap>,
    ) -> Result<()>;
}

/// Drains the retry queue through registered handlers.
pub struct QueueProcessor {
    store: QueueStore,
    handlers: DashMap<String, Arc<dyn RetryHandler>>,
    interval: Duration,
    batch_size: usize,
    running: AtomicBool,
}

impl QueueProcessor {
    pub fn new(store: QueueStore, interval: Duration) -> Self {
        Self {
            store,
            handlers: DashMap::new(),
            interval,
            batch_size: 10,
            running: AtomicBool::new(false),
        }
    }

    /// Register the retry handler for a service. Startup-time wiring; a
    /// replaced handler is a configuration smell and is logged.
    pub fn register_handler(&self, service: &str, handler: Arc<dyn RetryHandler>) {
        if self
            .handlers
            .insert(service.to_string(), handler)
            .is_some()
        {
            tracing::warn!(service = %service, "Replaced existing retry handler");
        } else {
            tracing::info!(service = %service, "Registered retry handler");
        }
    }

    /// Run the drain loop until shutdown is signaled.
    ///
    /// Recovers items stuck in `processing` from a previous run before the
    /// first tick.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if let Err(e) = self.store.recover_stuck().await {
            tracing::error!(error = %e, "Failed to recover stuck queue items");
        }

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Queue processor starting"
        );

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.process_once().await {
                        tracing::error!(error = %e, "Queue processing run failed");
                    }
                    if let Err(e) = self.store.cleanup().await {
                        tracing::error!(error = %e, "Queue cleanup failed");
                    }
                    self.publish_depth().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Queue processor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Drain one batch of eligible items. Re-entrant calls no-op.
    pub async fn process_once(&self) -> Result<usize> {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("Queue processing already in progress");
            return Ok(0);
        }

        let result = self.drain_batch().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn drain_batch(&self) -> Result<usize> {
        let items = self.store.eligible(self.batch_size).await?;
        let mut processed = 0;

        for item in items {
            if !self.store.mark_processing(item.id).await? {
                // Claimed or resolved elsewhere between scan and claim
                continue;
            }

            let Some(handler) = self.handlers.get(&item.service).map(|h| h.value().clone()) else {
                tracing::error!(
                    item = item.id,
                    service = %item.service,
                    "No retry handler registered"
                );
                self.store
                    .mark_failed_terminal(
                        item.id,
                        &format!("no retry handler registered for '{}'", item.service),
                    )
                    .await?;
                continue;
            };

            tracing::info!(
                item = item.id,
                service = %item.service,
                method = %item.method,
                attempt = item.retry_count + 1,
                "Processing queue item"
            );

            match handler
                .handle(&item.method, &item.payload, item.metadata.as_ref())
                .await
            {
                Ok(()) => {
                    self.store.mark_completed(item.id).await?;
                    metrics::record_dependency_call(&item.service, "retry_ok");
                    tracing::info!(item = item.id, "Queue item delivered");
                }
                Err(e) => {
                    self.store.mark_failed(item.id, &e.to_string()).await?;
                    metrics::record_dependency_call(&item.service, "retry_error");
                    tracing::warn!(item = item.id, error = %e, "Queue item attempt failed");
                }
            }
            processed += 1;
        }

        Ok(processed)
    }

    async fn publish_depth(&self) {
        if let Ok(stats) = self.store.stats().await {
            for (status, count) in stats {
                metrics::record_queue_depth(status.as_str(), count);
            }
        }
    }

    /// The backing store, for diagnostics.
    pub fn store(&self) -> &QueueStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::queue::item::QueueStatus;
    use crate::queue::store::StoreOptions;
    use std::sync::atomic::AtomicU32;

    struct CountingHandler {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl RetryHandler for CountingHandler {
        async fn handle(
            &self,
            _method: &str,
            _payload: &JsonMap,
            _metadata: Option<&JsonMap>,
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(BridgeError::Remote("still down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn setup() -> (tempfile::TempDir, QueueProcessor) {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(dir.path().join("queue.db"), StoreOptions::default()).unwrap();
        let processor = QueueProcessor::new(store, Duration::from_secs(30));
        (dir, processor)
    }

    fn payload() -> JsonMap {
        let mut map = JsonMap::new();
        map.insert("text".to_string(), serde_json::json!("hello"));
        map
    }

    #[tokio::test]
    async fn test_roundtrip_success() {
        let (_dir, processor) = setup();
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail: false,
        });
        processor.register_handler("workflow", handler.clone());

        let id = processor
            .store()
            .enqueue("workflow", "trigger", payload(), 3, None)
            .await
            .unwrap();

        let processed = processor.process_once().await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let item = processor.store().get(id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Completed);

        // Completed items are gone from subsequent scans
        assert_eq!(processor.process_once().await.unwrap(), 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_backs_off() {
        let (_dir, processor) = setup();
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail: true,
        });
        processor.register_handler("workflow", handler.clone());

        let id = processor
            .store()
            .enqueue("workflow", "trigger", payload(), 3, None)
            .await
            .unwrap();

        processor.process_once().await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let item = processor.store().get(id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.retry_count, 1);
        assert!(item.next_retry_at.unwrap() > item.created_at);

        // Backed off: the immediate next run sees nothing
        assert_eq!(processor.process_once().await.unwrap(), 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_handler_is_terminal() {
        let (_dir, processor) = setup();

        let id = processor
            .store()
            .enqueue("unknown", "trigger", payload(), 3, None)
            .await
            .unwrap();

        processor.process_once().await.unwrap();

        let item = processor.store().get(id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.retry_count, 0);
        assert!(item.last_error.unwrap().contains("no retry handler"));
    }

    #[tokio::test]
    async fn test_overlap_guard() {
        let (_dir, processor) = setup();
        processor.running.store(true, Ordering::SeqCst);

        processor
            .store()
            .enqueue("workflow", "trigger", payload(), 3, None)
            .await
            .unwrap();

        // Guarded run is a no-op
        assert_eq!(processor.process_once().await.unwrap(), 0);

        processor.running.store(false, Ordering::SeqCst);
    }
}
