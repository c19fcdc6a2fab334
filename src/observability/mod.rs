//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stdout (structured logs)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured fields on every log line (service, error, attempt)
//! - Metric updates are cheap enough for hot paths
//! - The metrics endpoint is optional and config-gated

pub mod logging;
pub mod metrics;
