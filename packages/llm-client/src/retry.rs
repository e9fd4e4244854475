//! Backoff schedule for retryable completion errors.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with additive jitter.
///
/// Delay before attempt `n + 1` is `min(base * 2^(n-1), max)` plus a
/// uniform random jitter in `[0, jitter]`. There is no aggregate wall-clock
/// budget; the attempt count is the only bound.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.exponential_part(attempt);
        let jitter_ms = if self.jitter.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64)
        };
        exp + Duration::from_millis(jitter_ms)
    }

    fn exponential_part(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let factor = 1u64 << shift;
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_the_cap() {
        let policy = RetryPolicy {
            jitter: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(7), Duration::from_secs(60));
        assert_eq!(policy.delay_for(30), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy::default();
        for attempt in 1..5 {
            let base = RetryPolicy {
                jitter: Duration::ZERO,
                ..Default::default()
            }
            .delay_for(attempt);
            let delay = policy.delay_for(attempt);
            assert!(delay >= base);
            assert!(delay <= base + Duration::from_secs(5));
        }
    }

    #[test]
    fn large_attempt_does_not_overflow() {
        let policy = RetryPolicy {
            jitter: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(60));
    }
}
