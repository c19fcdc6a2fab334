//! Backoff delay calculations.
//!
//! Two distinct laws live here on purpose. Queued retries use capped exponential
//! backoff so a struggling dependency sees geometrically thinning traffic.
//! Connection reattempts use plain linear backoff: reconnects are cheap, and the
//! attempt counter is already capped by configuration.

use std::time::Duration;

/// Delay before the next queued retry, given the number of failures so far.
///
/// `min(2^retry_count, cap_secs)` seconds. The first failure (retry_count 0)
/// waits 1 second.
pub fn retry_delay(retry_count: u32, cap_secs: u64) -> Duration {
    let exp = 2u64.saturating_pow(retry_count);
    Duration::from_secs(exp.min(cap_secs))
}

/// Delay before reconnect attempt `attempt` (1-based): `base * attempt`.
pub fn reconnect_delay(attempt: u32, base: Duration) -> Duration {
    base.saturating_mul(attempt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles() {
        assert_eq!(retry_delay(0, 300), Duration::from_secs(1));
        assert_eq!(retry_delay(1, 300), Duration::from_secs(2));
        assert_eq!(retry_delay(2, 300), Duration::from_secs(4));
        assert_eq!(retry_delay(5, 300), Duration::from_secs(32));
    }

    #[test]
    fn test_retry_delay_caps() {
        assert_eq!(retry_delay(9, 300), Duration::from_secs(300));
        assert_eq!(retry_delay(63, 300), Duration::from_secs(300));
        // Saturates instead of overflowing past 2^63
        assert_eq!(retry_delay(200, 300), Duration::from_secs(300));
    }

    #[test]
    fn test_reconnect_delay_is_linear() {
        let base = Duration::from_secs(5);
        assert_eq!(reconnect_delay(1, base), Duration::from_secs(5));
        assert_eq!(reconnect_delay(2, base), Duration::from_secs(10));
        assert_eq!(reconnect_delay(10, base), Duration::from_secs(50));
    }
}
