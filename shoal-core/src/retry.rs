//! Bounded exponential backoff.
//!
//! Transient lease-table and transport failures are retried at the call site
//! with a `RetryPolicy`. The bounds are configuration, not constants.

use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};
use crate::limits::Limits;

/// Retry bounds for a transient operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Creates a retry policy.
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Fast retries for tests.
    #[must_use]
    pub const fn fast_for_testing() -> Self {
        Self::new(3, Duration::from_millis(1), Duration::from_millis(5))
    }

    /// Returns true if another attempt is allowed after `attempt` failures.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    ///
    /// Doubles from `base_delay`, capped at `max_delay`, with up to 25%
    /// jitter subtracted so that workers retrying the same row spread out.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let uncapped = self.base_delay.saturating_mul(1 << exponent);
        let capped = uncapped.min(self.max_delay);

        let capped_us = u64::try_from(capped.as_micros()).unwrap_or(u64::MAX);
        if capped_us < 4 {
            return capped;
        }
        let jitter_us = rand::thread_rng().gen_range(0..=capped_us / 4);
        Duration::from_micros(capped_us - jitter_us)
    }

    /// Validates the policy against system limits.
    ///
    /// # Errors
    /// Returns an error if attempts are zero or above the limit, or if the
    /// delay range is inverted.
    pub fn validate(&self, limits: &Limits) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidArgument {
                name: "max_attempts",
                reason: "must be positive",
            });
        }
        if self.max_attempts > limits.max_retry_attempts {
            return Err(Error::LimitExceeded {
                limit: "max_retry_attempts",
                max: u64::from(limits.max_retry_attempts),
                actual: u64::from(self.max_attempts),
            });
        }
        if self.max_delay < self.base_delay {
            return Err(Error::InvalidArgument {
                name: "max_delay",
                reason: "must be >= base_delay",
            });
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(100), Duration::from_secs(5))
    }
}
