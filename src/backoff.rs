//! Retry backoff for consumer handler failures
//!
//! The delay for failure `n` (0-indexed) is `first + step × n`, clamped to
//! `max`. It is derived purely from the failure count, so a long run of
//! failures settles at `max` rather than drifting.

use std::time::Duration;

/// Linear, capped retry backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub first: Duration,
    /// Added per further consecutive failure
    pub step: Duration,
    /// Maximum delay
    pub max: Duration,
}

impl Default for BackoffPolicy {
    /// 100ms, +100ms per failure, capped at 5s
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            step: Duration::from_millis(100),
            max: Duration::from_millis(5000),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after `failures` previous consecutive failures
    pub fn next(&self, failures: u32) -> Duration {
        self.step
            .checked_mul(failures)
            .and_then(|extra| self.first.checked_add(extra))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_linear_growth() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next(0), Duration::from_millis(100));
        assert_eq!(policy.next(1), Duration::from_millis(200));
        assert_eq!(policy.next(2), Duration::from_millis(300));
        assert_eq!(policy.next(48), Duration::from_millis(4900));
    }

    #[test]
    fn test_clamped_to_max() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next(49), Duration::from_millis(5000));
        assert_eq!(policy.next(500), Duration::from_millis(5000));
        assert_eq!(policy.next(u32::MAX), Duration::from_millis(5000));
    }

    #[test]
    fn test_first_exceeds_max() {
        let policy = BackoffPolicy {
            first: Duration::from_secs(10),
            step: Duration::from_millis(100),
            max: Duration::from_secs(5),
        };
        assert_eq!(policy.next(0), Duration::from_secs(5));
    }

    #[test]
    fn test_constant_when_step_zero() {
        let policy = BackoffPolicy {
            first: Duration::from_millis(250),
            step: Duration::ZERO,
            max: Duration::from_secs(5),
        };
        for failures in 0..10 {
            assert_eq!(policy.next(failures), Duration::from_millis(250));
        }
    }
}
