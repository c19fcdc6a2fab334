//! Circuit breaker for dependency protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: testing if the dependency recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures reach failure_threshold
//! Open → Half-Open: first call after recovery_timeout elapses
//! Half-Open → Closed: probe call succeeds
//! Half-Open → Open: probe call fails
//! ```
//!
//! # Design Decisions
//! - Per-dependency breaker (workflow, TTS, transcription, broker each get one)
//! - Fail fast in Open state; the wrapped operation is never invoked
//! - Single probe in Half-Open; concurrent callers keep seeing `CircuitOpen`
//!   until the probe resolves
//! - Only errors matching the failure classifier trip the breaker; anything
//!   else passes through without touching counters

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::{BridgeError, Result};
use crate::observability::metrics;

/// Maximum retained state transitions, oldest evicted first.
const TRANSITION_HISTORY_LIMIT: usize = 16;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker configuration, immutable after construction.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Name of the protected dependency (logging, metrics, diagnostics).
    pub name: String,

    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,

    /// Time the circuit stays open before a recovery probe is allowed.
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            name: "circuit".to_string(),
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// A recorded state transition.
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at_unix_ms: u64,
}

/// Serializable snapshot of breaker state, used by diagnostics output.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_total: u64,
    pub failure_total: u64,
    pub total_calls: u64,
    pub transitions: Vec<StateTransition>,
}

struct BreakerInner {
    state: CircuitState,
    /// Consecutive failures; reset by any success.
    failure_count: u32,
    success_total: u64,
    failure_total: u64,
    total_calls: u64,
    last_failure_at: Option<Instant>,
    probe_in_flight: bool,
    transitions: VecDeque<StateTransition>,
}

/// Circuit breaker protecting a single dependency.
///
/// All state lives behind one mutex; the wrapped operation always runs with the
/// lock released.
pub struct CircuitBreaker {
    config: BreakerConfig,
    is_failure: fn(&BridgeError) -> bool,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker counting transient errors as failures.
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_classifier(config, BridgeError::is_transient)
    }

    /// Create a breaker with a custom failure classifier.
    pub fn with_classifier(config: BreakerConfig, is_failure: fn(&BridgeError) -> bool) -> Self {
        Self {
            config,
            is_failure,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_total: 0,
                failure_total: 0,
                total_calls: 0,
                last_failure_at: None,
                probe_in_flight: false,
                transitions: VecDeque::new(),
            }),
        }
    }

    /// Name of the protected dependency.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Execute `op` under breaker protection.
    ///
    /// Returns `CircuitOpen` without invoking `op` while the circuit is open or
    /// another caller holds the half-open probe slot.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let is_probe = self.admit()?;

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) if (self.is_failure)(&err) => {
                self.record_failure();
                Err(err)
            }
            Err(err) => {
                // Not a dependency failure; pass through without counting. A
                // probe slot held for this call is released so the next caller
                // can probe.
                if is_probe {
                    let mut inner = self.lock();
                    inner.probe_in_flight = false;
                }
                Err(err)
            }
        }
    }

    /// Admission check. Returns whether this call is the half-open probe, or
    /// `CircuitOpen` if the call must be rejected.
    fn admit(&self) -> Result<bool> {
        let mut inner = self.lock();
        inner.total_calls += 1;

        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let recovered = inner
                    .last_failure_at
                    .map(|at| at.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(false);
                if recovered && !inner.probe_in_flight {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probe_in_flight = true;
                    tracing::info!(breaker = %self.config.name, "Attempting recovery probe");
                    Ok(true)
                } else {
                    Err(BridgeError::CircuitOpen {
                        service: self.config.name.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(BridgeError::CircuitOpen {
                        service: self.config.name.clone(),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        inner.success_total += 1;
        inner.failure_count = 0;

        if inner.state == CircuitState::HalfOpen {
            self.transition(&mut inner, CircuitState::Closed);
            inner.probe_in_flight = false;
            tracing::info!(breaker = %self.config.name, "Circuit closed after successful recovery");
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_total += 1;
        inner.failure_count += 1;
        inner.last_failure_at = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open);
                inner.probe_in_flight = false;
                tracing::warn!(breaker = %self.config.name, "Circuit reopened after failed recovery probe");
            }
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                    tracing::error!(
                        breaker = %self.config.name,
                        failures = inner.failure_count,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        if inner.transitions.len() >= TRANSITION_HISTORY_LIMIT {
            inner.transitions.pop_front();
        }
        inner.transitions.push_back(StateTransition {
            from,
            to,
            at_unix_ms: unix_ms(),
        });
        metrics::record_breaker_state(&self.config.name, to);
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether calls are currently being rejected without a probe slot.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Snapshot for diagnostics.
    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            name: self.config.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_total: inner.success_total,
            failure_total: inner.failure_total,
            total_calls: inner.total_calls,
            transitions: inner.transitions.iter().cloned().collect(),
        }
    }

    /// Force the circuit closed and zero all counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
        inner.failure_count = 0;
        inner.success_total = 0;
        inner.failure_total = 0;
        inner.total_calls = 0;
        inner.last_failure_at = None;
        inner.probe_in_flight = false;
        tracing::info!(breaker = %self.config.name, "Circuit manually reset");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // Breaker state is plain data; a poisoned lock only means a panic
        // elsewhere mid-update, and the counters are still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn test_breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            name: "test".to_string(),
            failure_threshold: threshold,
            recovery_timeout: recovery,
        })
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .call(|| async { Err(BridgeError::Remote("boom".into())) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<()> {
        breaker.call(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_opens_exactly_at_threshold() {
        let breaker = test_breaker(3, Duration::from_secs(30));

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_count() {
        let breaker = test_breaker(3, Duration::from_secs(30));

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        succeed(&breaker).await.unwrap();
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        // Two consecutive after the success, still below the threshold
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_rejects_without_invoking() {
        let breaker = test_breaker(1, Duration::from_secs(30));
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = Arc::new(AtomicU32::new(0));
        let i = invoked.clone();
        let result = breaker
            .call(|| async move {
                i.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(BridgeError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_probe_success_closes_circuit() {
        let breaker = test_breaker(1, Duration::from_millis(20));
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens_circuit() {
        let breaker = test_breaker(1, Duration::from_millis(20));
        let _ = fail(&breaker).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // Reopened: immediate calls are rejected again
        let result = succeed(&breaker).await;
        assert!(matches!(result, Err(BridgeError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_half_open_single_flight() {
        let breaker = Arc::new(test_breaker(1, Duration::from_millis(20)));
        let _ = fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        // First caller takes the probe slot and parks inside the operation
        let probe_breaker = breaker.clone();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = tokio::spawn(async move {
            probe_breaker
                .call(|| async {
                    let _ = release_rx.await;
                    Ok(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Concurrent caller is rejected while the probe is in flight
        let result = succeed(&breaker).await;
        assert!(matches!(result, Err(BridgeError::CircuitOpen { .. })));

        release_tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_non_matching_error_passes_through() {
        let breaker = test_breaker(1, Duration::from_secs(30));

        let result: Result<()> = breaker
            .call(|| async { Err(BridgeError::Configuration("bad url".into())) })
            .await;
        assert!(matches!(result, Err(BridgeError::Configuration(_))));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().failure_total, 0);
    }

    #[tokio::test]
    async fn test_manual_reset() {
        let breaker = test_breaker(1, Duration::from_secs(30));
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        succeed(&breaker).await.unwrap();
    }

    #[tokio::test]
    async fn test_transition_history_is_bounded() {
        let breaker = test_breaker(1, Duration::from_millis(1));

        for _ in 0..40 {
            let _ = fail(&breaker).await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let stats = breaker.stats();
        assert!(stats.transitions.len() <= TRANSITION_HISTORY_LIMIT);
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let breaker = test_breaker(2, Duration::from_secs(30));
        succeed(&breaker).await.unwrap();
        let _ = fail(&breaker).await;

        let stats = breaker.stats();
        assert_eq!(stats.name, "test");
        assert_eq!(stats.success_total, 1);
        assert_eq!(stats.failure_total, 1);
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.failure_count, 1);
    }
}
