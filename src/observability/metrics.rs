//! Metrics collection and exposition.
//!
//! # Metrics
//! - `bridge_dependency_calls_total` (counter): calls by service and outcome
//! - `bridge_breaker_state` (gauge): 0=closed, 1=open, 2=half_open
//! - `bridge_breaker_transitions_total` (counter): transitions by breaker and target state
//! - `bridge_queue_items` (gauge): retry-queue depth by status
//! - `bridge_reconnects_total` (counter): reconnect attempts by service
//!
//! # Design Decisions
//! - Prometheus exporter is installed once at startup when enabled
//! - Helpers take plain strings so subsystems stay decoupled from the
//!   metrics backend

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::resilience::CircuitState;

/// Install the Prometheus exporter listening on `addr`.
///
/// Failure to bind is logged, not fatal: metrics are diagnostics, the bridge
/// keeps running without them.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record the outcome of a dependency call ("ok", "error", "rejected", "deferred").
pub fn record_dependency_call(service: &str, outcome: &'static str) {
    counter!(
        "bridge_dependency_calls_total",
        "service" => service.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a breaker state change.
pub fn record_breaker_state(breaker: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::Open => 1.0,
        CircuitState::HalfOpen => 2.0,
    };
    gauge!("bridge_breaker_state", "breaker" => breaker.to_string()).set(value);
    counter!(
        "bridge_breaker_transitions_total",
        "breaker" => breaker.to_string(),
        "to" => state.as_str()
    )
    .increment(1);
}

/// Record retry-queue depth for one status bucket.
pub fn record_queue_depth(status: &str, count: u64) {
    gauge!("bridge_queue_items", "status" => status.to_string()).set(count as f64);
}

/// Record a reconnect attempt.
pub fn record_reconnect(service: &str) {
    counter!("bridge_reconnects_total", "service" => service.to_string()).increment(1);
}
