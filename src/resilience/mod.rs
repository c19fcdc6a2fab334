//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to a dependency:
//!     → circuit_breaker.rs (fail fast once the dependency is known-bad)
//!     → On transient failure: caller enqueues into the retry queue
//!     → backoff.rs (delay laws: exponential for queued retries,
//!       linear for connection reattempts)
//! ```
//!
//! # Design Decisions
//! - One breaker per protected dependency, never shared
//! - Only errors classified as transient trip a breaker
//! - Queue retries back off exponentially; reconnects back off linearly

pub mod backoff;
pub mod circuit_breaker;

pub use circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
