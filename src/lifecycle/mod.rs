//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     Load config → Validate → Build orchestrator → Connect clients
//!     → Start background tasks (queue processor, health loop)
//!
//! Shutdown (shutdown.rs):
//!     Signal received (signals.rs)
//!     → broadcast to every task → close connections → join all tasks → exit
//! ```
//!
//! # Design Decisions
//! - Every background task subscribes to one broadcast channel
//! - Tasks are awaited on exit, never abandoned mid-I/O

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
