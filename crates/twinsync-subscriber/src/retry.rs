//! Pull retry pacing.

use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff with full jitter.
///
/// Each attempt's delay is drawn uniformly from zero up to
/// `min(cap, base * 2^attempt)`, so a fleet of subscribers recovering from
/// the same outage does not stampede the publisher.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Ceiling of the first attempt's delay
    pub base: Duration,
    /// Upper bound for any delay
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling_ms(attempt);
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }

    fn ceiling_ms(&self, attempt: u32) -> u64 {
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(self.cap.as_millis()).unwrap_or(u64::MAX);

        let doubled = base_ms.saturating_mul(1_u64.checked_shl(attempt).unwrap_or(u64::MAX));
        doubled.min(cap_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_stay_within_exponential_ceiling() {
        let policy = RetryPolicy::default();

        for attempt in 0..10 {
            let ceiling = Duration::from_millis(policy.ceiling_ms(attempt));
            for _ in 0..50 {
                assert!(policy.delay(attempt) <= ceiling);
            }
        }
    }

    #[test]
    fn ceiling_doubles_until_cap() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.ceiling_ms(0), 1_000);
        assert_eq!(policy.ceiling_ms(1), 2_000);
        assert_eq!(policy.ceiling_ms(5), 32_000);
        assert_eq!(policy.ceiling_ms(6), 60_000);
        assert_eq!(policy.ceiling_ms(63), 60_000);
        assert_eq!(policy.ceiling_ms(64), 60_000);
    }
}
