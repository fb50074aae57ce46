//! Retry policy for model calls
//!
//! Exponential backoff with optional jitter. An agent's options attach a
//! policy to its model calls; after attempts are exhausted the runner
//! falls back to the configured fallback model, if any, before giving up.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    pub initial_interval_ms: u64,

    /// Multiplier applied per retry
    pub backoff_factor: f64,

    /// Ceiling on any single delay, in milliseconds
    pub max_interval_ms: u64,

    /// Randomize each delay in [0.5, 1.5) of its nominal value
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval_ms: 500,
            backoff_factor: 2.0,
            max_interval_ms: 10_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether another attempt is allowed after `attempt` failures
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let nominal = self.initial_interval_ms as f64 * self.backoff_factor.powi(exponent as i32);
        let capped = nominal.min(self.max_interval_ms as f64);
        let final_ms = if self.jitter {
            capped * (0.5 + rand::random::<f64>())
        } else {
            capped
        };
        Duration::from_millis(final_ms.min(self.max_interval_ms as f64) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_without_jitter() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_interval_ms: 100,
            backoff_factor: 2.0,
            max_interval_ms: 10_000,
            jitter: false,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_interval_ms: 1_000,
            backoff_factor: 10.0,
            max_interval_ms: 2_000,
            jitter: false,
        };
        assert_eq!(policy.delay(5), Duration::from_millis(2_000));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(!RetryPolicy::none().should_retry(1));
    }
}
