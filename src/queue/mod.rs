//! Durable retry queue.
//!
//! # Data Flow
//! ```text
//! Failed operation (breaker exhausted or connection down):
//!     → store.rs enqueue (SQLite, survives restarts)
//!
//! Background drain (processor.rs):
//!     Fixed-interval tick
//!     → eligible items (pending, next_retry_at <= now, FIFO)
//!     → mark processing → registered handler → completed | failed
//!     → failed recomputes exponential backoff until max_retries
//! ```
//!
//! # Design Decisions
//! - Every status transition is persisted before its outcome is acted on
//! - Transitions are conditional SQL updates, so two processors can never
//!   interleave on the same item
//! - Items stuck in `processing` by a crash are requeued at startup
//! - A full queue purges old terminal items first and otherwise rejects the
//!   write loudly; enqueues are never silently dropped

pub mod item;
pub mod processor;
pub mod store;

pub use item::{JsonMap, QueueItem, QueueStatus};
pub use processor::{QueueProcessor, RetryHandler};
pub use store::{QueueStore, StoreOptions};
