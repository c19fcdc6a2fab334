//! SQLite-backed queue persistence.
//!
//! # Responsibilities
//! - Persist queue items across process restarts
//! - Serve eligibility scans (pending, retry time reached, FIFO)
//! - Apply status transitions atomically (conditional updates)
//! - Enforce capacity with age-based cleanup, rejecting loudly when full
//!
//! # Design Decisions
//! - One shared connection behind a mutex; rusqlite calls run on the
//!   blocking pool so queue I/O never stalls connection tasks
//! - WAL journal mode for concurrent readers
//! - Backoff recomputation happens here, at the same time as the status
//!   write, so a crash cannot separate the two

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{BridgeError, Result};
use crate::queue::item::{JsonMap, QueueItem, QueueStatus};
use crate::resilience::backoff::retry_delay;

/// Tunables for the backing store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Maximum rows before enqueue triggers cleanup.
    pub max_items: usize,
    /// Cap for exponential retry backoff, in seconds.
    pub backoff_cap_secs: u64,
    /// Terminal items older than this are purged by cleanup.
    pub retention: Duration,
    /// Pending items older than this are marked expired by cleanup.
    pub item_ttl: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_items: 1000,
            backoff_cap_secs: 300,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            item_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Persistent retry queue store.
#[derive(Clone)]
pub struct QueueStore {
    conn: Arc<Mutex<Connection>>,
    options: StoreOptions,
}

impl QueueStore {
    /// Open (or create) the queue database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BridgeError::Persistence(format!(
                        "failed to create queue directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| BridgeError::Persistence(format!("failed to open queue db: {e}")))?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;

            CREATE TABLE IF NOT EXISTS queue_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                service TEXT NOT NULL,
                method TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                next_retry_at INTEGER,
                last_error TEXT,
                metadata TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_queue_status_next_retry
                ON queue_items(status, next_retry_at);
            CREATE INDEX IF NOT EXISTS idx_queue_service_method
                ON queue_items(service, method);
            "#,
        )
        .map_err(|e| BridgeError::Persistence(format!("failed to initialize queue schema: {e}")))?;

        tracing::info!(path = %path.display(), "Retry queue store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            options,
        })
    }

    /// Persist a new pending item, eligible immediately.
    ///
    /// At capacity, terminal items are purged (old ones first, then oldest
    /// regardless of age); if the queue is still full of live items the
    /// enqueue fails with a `Persistence` error.
    pub async fn enqueue(
        &self,
        service: &str,
        method: &str,
        payload: JsonMap,
        max_retries: u32,
        metadata: Option<JsonMap>,
    ) -> Result<i64> {
        let service = service.to_string();
        let method = method.to_string();
        let max_items = self.options.max_items;
        let retention_ms = self.options.retention.as_millis() as i64;

        let id = self
            .run_blocking(move |conn| {
                let now = now_ms();

                let mut count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM queue_items", [], |r| r.get(0))?;
                if count as usize >= max_items {
                    conn.execute(
                        "DELETE FROM queue_items
                         WHERE status IN ('completed', 'failed', 'expired') AND updated_at < ?1",
                        params![now - retention_ms],
                    )?;
                    count = conn.query_row("SELECT COUNT(*) FROM queue_items", [], |r| r.get(0))?;
                }
                if count as usize >= max_items {
                    let excess = count as usize - max_items + 1;
                    conn.execute(
                        "DELETE FROM queue_items WHERE id IN (
                             SELECT id FROM queue_items
                             WHERE status IN ('completed', 'failed', 'expired')
                             ORDER BY updated_at ASC LIMIT ?1
                         )",
                        params![excess as i64],
                    )?;
                    count = conn.query_row("SELECT COUNT(*) FROM queue_items", [], |r| r.get(0))?;
                }
                if count as usize >= max_items {
                    return Err(BridgeError::Persistence(
                        "retry queue full: every item is live".to_string(),
                    ));
                }

                let payload_json = serde_json::Value::Object(payload).to_string();
                let metadata_json = metadata.map(|m| serde_json::Value::Object(m).to_string());

                conn.execute(
                    "INSERT INTO queue_items
                     (service, method, payload, status, retry_count, max_retries,
                      created_at, updated_at, next_retry_at, metadata)
                     VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?5, ?5, ?6)",
                    params![service, method, payload_json, max_retries, now, metadata_json],
                )?;

                Ok(conn.last_insert_rowid())
            })
            .await?;

        tracing::info!(item = id, "Enqueued retry item");
        Ok(id)
    }

    /// Pending items whose retry time has arrived, oldest created first.
    pub async fn eligible(&self, limit: usize) -> Result<Vec<QueueItem>> {
        self.run_blocking(move |conn| {
            let now = now_ms();
            let mut stmt = conn.prepare(
                "SELECT id, service, method, payload, status, retry_count, max_retries,
                        created_at, updated_at, next_retry_at, last_error, metadata
                 FROM queue_items
                 WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?1)
                 ORDER BY created_at ASC
                 LIMIT ?2",
            )?;

            let rows = stmt.query_map(params![now, limit as i64], row_to_item)?;
            let mut items = Vec::new();
            for row in rows {
                items.push(row?);
            }
            Ok(items)
        })
        .await
    }

    /// Claim a pending item for processing. Returns false if the item was not
    /// pending (already claimed, completed, or gone).
    pub async fn mark_processing(&self, id: i64) -> Result<bool> {
        self.run_blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE queue_items SET status = 'processing', updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now_ms(), id],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Mark an item delivered. Idempotent: a second call changes nothing.
    pub async fn mark_completed(&self, id: i64) -> Result<bool> {
        self.run_blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE queue_items SET status = 'completed', last_error = NULL, updated_at = ?1
                 WHERE id = ?2 AND status IN ('pending', 'processing')",
                params![now_ms(), id],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Record a failed attempt. Below `max_retries` the item returns to
    /// pending with exponential backoff; otherwise it becomes terminal.
    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let error = error.to_string();
        let cap = self.options.backoff_cap_secs;

        self.run_blocking(move |conn| {
            let now = now_ms();
            let row: Option<(u32, u32)> = conn
                .query_row(
                    "SELECT retry_count, max_retries FROM queue_items WHERE id = ?1",
                    params![id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            let Some((retry_count, max_retries)) = row else {
                tracing::warn!(item = id, "mark_failed on unknown queue item");
                return Ok(());
            };

            if retry_count < max_retries {
                let delay_ms = retry_delay(retry_count, cap).as_millis() as i64;
                conn.execute(
                    "UPDATE queue_items
                     SET status = 'pending', retry_count = retry_count + 1,
                         next_retry_at = ?1, last_error = ?2, updated_at = ?3
                     WHERE id = ?4",
                    params![now + delay_ms, error, now, id],
                )?;
            } else {
                conn.execute(
                    "UPDATE queue_items
                     SET status = 'failed', last_error = ?1, updated_at = ?2
                     WHERE id = ?3",
                    params![error, now, id],
                )?;
            }
            Ok(())
        })
        .await
    }

    /// Mark an item terminally failed with no backoff. Used for configuration
    /// defects (no handler registered), which retrying cannot fix.
    pub async fn mark_failed_terminal(&self, id: i64, error: &str) -> Result<()> {
        let error = error.to_string();
        self.run_blocking(move |conn| {
            conn.execute(
                "UPDATE queue_items SET status = 'failed', last_error = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![error, now_ms(), id],
            )?;
            Ok(())
        })
        .await
    }

    /// Return items left in `processing` by a crash to `pending`.
    ///
    /// Handlers are idempotent under at-least-once delivery, so redelivering
    /// is safe; the retry count is not consumed.
    pub async fn recover_stuck(&self) -> Result<usize> {
        let recovered = self
            .run_blocking(move |conn| {
                let now = now_ms();
                let changed = conn.execute(
                    "UPDATE queue_items
                     SET status = 'pending', next_retry_at = ?1, updated_at = ?1
                     WHERE status = 'processing'",
                    params![now],
                )?;
                Ok(changed)
            })
            .await?;

        if recovered > 0 {
            tracing::warn!(count = recovered, "Requeued items stuck in processing");
        }
        Ok(recovered)
    }

    /// Purge old terminal items and expire stale pending ones.
    pub async fn cleanup(&self) -> Result<()> {
        let retention_ms = self.options.retention.as_millis() as i64;
        let ttl_ms = self.options.item_ttl.as_millis() as i64;

        self.run_blocking(move |conn| {
            let now = now_ms();
            conn.execute(
                "DELETE FROM queue_items
                 WHERE status IN ('completed', 'failed', 'expired') AND updated_at < ?1",
                params![now - retention_ms],
            )?;
            let expired = conn.execute(
                "UPDATE queue_items SET status = 'expired', updated_at = ?1
                 WHERE status = 'pending' AND created_at < ?2",
                params![now, now - ttl_ms],
            )?;
            if expired > 0 {
                tracing::warn!(count = expired, "Expired stale pending queue items");
            }
            Ok(())
        })
        .await
    }

    /// Item counts by status.
    pub async fn stats(&self) -> Result<Vec<(QueueStatus, u64)>> {
        self.run_blocking(move |conn| {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM queue_items GROUP BY status")?;
            let rows = stmt.query_map([], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })?;

            let mut stats = Vec::new();
            for row in rows {
                let (status, count) = row?;
                if let Some(status) = QueueStatus::parse(&status) {
                    stats.push((status, count as u64));
                }
            }
            Ok(stats)
        })
        .await
    }

    /// Total number of items.
    pub async fn size(&self) -> Result<u64> {
        self.run_blocking(move |conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM queue_items", [], |r| r.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    /// Fetch one item by id.
    pub async fn get(&self, id: i64) -> Result<Option<QueueItem>> {
        self.run_blocking(move |conn| {
            let item = conn
                .query_row(
                    "SELECT id, service, method, payload, status, retry_count, max_retries,
                            created_at, updated_at, next_retry_at, last_error, metadata
                     FROM queue_items WHERE id = ?1",
                    params![id],
                    row_to_item,
                )
                .optional()?;
            Ok(item)
        })
        .await
    }

    /// Delete items, optionally restricted to one status.
    pub async fn clear(&self, status: Option<QueueStatus>) -> Result<usize> {
        self.run_blocking(move |conn| {
            let deleted = match status {
                Some(status) => conn.execute(
                    "DELETE FROM queue_items WHERE status = ?1",
                    params![status.as_str()],
                )?,
                None => conn.execute("DELETE FROM queue_items", [])?,
            };
            Ok(deleted)
        })
        .await
    }

    /// Run a closure against the shared connection on the blocking pool.
    async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| BridgeError::Persistence(format!("queue task failed: {e}")))?
    }
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<QueueItem> {
    let status: String = row.get(4)?;
    let payload: String = row.get(3)?;
    let metadata: Option<String> = row.get(11)?;

    Ok(QueueItem {
        id: row.get(0)?,
        service: row.get(1)?,
        method: row.get(2)?,
        payload: serde_json::from_str(&payload).unwrap_or_default(),
        status: QueueStatus::parse(&status).unwrap_or(QueueStatus::Failed),
        retry_count: row.get(5)?,
        max_retries: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        next_retry_at: row.get(9)?,
        last_error: row.get(10)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
    })
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
