//! Retry policy for failed steps.

use std::time::Duration;

/// Exponential backoff with a cap.
///
/// The delay before retry N (0-based, i.e. the step's retry count before the
/// retry is taken) is `min(initial_delay * multiplier^N, max_delay)`.
///
/// With defaults (3 retries, 1s initial, x2, 60s cap) a step is attempted at
/// most four times, waiting 1s, 2s and 4s between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed per step, not counting the first attempt.
    pub max_retry_count: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Growth factor applied per retry already taken.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

/// Outcome of evaluating a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_count: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retry_count: 0,
            ..Default::default()
        }
    }

    /// Decides whether a step that has already been retried `retry_count`
    /// times may be retried again, and after which delay.
    pub fn evaluate(&self, retry_count: u32) -> RetryDecision {
        RetryDecision {
            should_retry: self.should_retry(retry_count),
            delay: self.delay_for(retry_count),
        }
    }

    /// Returns `true` if another retry is permitted.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retry_count
    }

    /// Calculates the backoff delay for the given retry count.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(0.0).powi(exponent);
        let secs = self.initial_delay.as_secs_f64() * factor;

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retry_count: 10,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
        }
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.max_retry_count, 3);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn exponential_backoff() {
        let policy = policy();

        assert_eq!(policy.delay_for(0), Duration::from_secs(1)); // 1 * 2^0
        assert_eq!(policy.delay_for(1), Duration::from_secs(2)); // 1 * 2^1
        assert_eq!(policy.delay_for(2), Duration::from_secs(4)); // 1 * 2^2
        assert_eq!(policy.delay_for(3), Duration::from_secs(8)); // 1 * 2^3
    }

    #[test]
    fn backoff_capped_at_max() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(60),
            ..policy()
        };

        // 1 * 2^9 = 512, but capped at 60
        assert_eq!(policy.delay_for(9), Duration::from_secs(60));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn fractional_multiplier() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(4),
            multiplier: 1.5,
            ..policy()
        };

        assert_eq!(policy.delay_for(0), Duration::from_secs(4));
        assert_eq!(policy.delay_for(1), Duration::from_secs(6));
        assert_eq!(policy.delay_for(2), Duration::from_secs(9));
    }

    #[test]
    fn should_retry() {
        let policy = RetryPolicy {
            max_retry_count: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn evaluate_combines_both() {
        let policy = RetryPolicy {
            max_retry_count: 2,
            ..policy()
        };

        assert_eq!(
            policy.evaluate(1),
            RetryDecision {
                should_retry: true,
                delay: Duration::from_secs(2),
            }
        );
        assert!(!policy.evaluate(2).should_retry);
    }

    #[test]
    fn no_retry_policy() {
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    #[test]
    fn zero_initial_delay_retries_immediately() {
        let policy = RetryPolicy {
            initial_delay: Duration::ZERO,
            ..policy()
        };
        assert_eq!(policy.delay_for(5), Duration::ZERO);
    }

    #[test]
    fn sequence_is_monotonic_until_cap() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(20),
            ..policy()
        };
        let delays: Vec<_> = (0..8).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 8, 16, 20, 20, 20]);
    }
}
