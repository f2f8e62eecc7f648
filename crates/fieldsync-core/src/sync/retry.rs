//! Backoff for operations that failed without a conflict.

use std::time::Duration;

/// Exponential backoff: after the n-th failure an operation waits
/// `min(base * 2^(n-1), max)` before it is pushed again.
///
/// There is no attempt limit; operations are only dropped by removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// `max_delay` is raised to `base_delay` if it is smaller.
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Retry on the very next cycle.
    #[must_use]
    pub const fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        self.base_delay
    }

    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay after the `attempts`-th failure (1-based).
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 1_u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Earliest push time (Unix ms) after the `attempts`-th failure at `now_millis`.
    #[must_use]
    pub fn next_attempt_at(&self, now_millis: i64, attempts: u32) -> i64 {
        let delay = i64::try_from(self.delay_for(attempts).as_millis()).unwrap_or(i64::MAX);
        now_millis.saturating_add(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(60));
        let delays: Vec<u64> = (1..=6).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn huge_attempt_counts_stay_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(64), Duration::from_secs(300));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn immediate_policy_never_waits() {
        let policy = RetryPolicy::immediate();
        assert_eq!(policy.next_attempt_at(1_000, 7), 1_000);
    }

    #[test]
    fn next_attempt_is_offset_from_now() {
        let policy = RetryPolicy::new(Duration::from_millis(250), Duration::from_secs(1));
        assert_eq!(policy.next_attempt_at(10_000, 1), 10_250);
        assert_eq!(policy.next_attempt_at(10_000, 3), 11_000);
        assert_eq!(policy.next_attempt_at(i64::MAX - 1, 1), i64::MAX);
    }

    #[test]
    fn max_is_never_below_base() {
        let policy = RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(policy.max_delay(), Duration::from_secs(10));
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
    }
}
