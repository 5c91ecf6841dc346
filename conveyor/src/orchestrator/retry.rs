//! Per-stage retry policy with exponential backoff.
//!
//! The stage runner never retries; retry is an orchestrator-level policy.
//! Attempt counts live on the stage records, so the policy itself is
//! stateless: it is asked for a decision after each failed attempt.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for per-stage retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts per stage (including the first).
    pub max_attempts: u32,
    /// Base delay before the second attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff multiplier applied per subsequent attempt.
    pub multiplier: f64,
    /// Delay cap in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Returns the backoff delay after the given failed attempt (1-based).
    ///
    /// `delay = base * multiplier^(attempt - 1)`, capped at `max_delay_ms`.
    #[must_use]
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1);
        let raw = (self.base_delay_ms as f64) * self.multiplier.powi(exponent as i32);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Decides what to do after the given failed attempt (1-based).
    #[must_use]
    pub fn decide(&self, failed_attempt: u32) -> RetryDecision {
        if failed_attempt >= self.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry(self.delay_for(failed_attempt))
        }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Dispatch another attempt after the delay.
    Retry(Duration),
    /// Retries exhausted; fail the run.
    GiveUp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 30_000);
    }

    #[test]
    fn test_builder() {
        let policy = RetryPolicy::new()
            .with_max_attempts(5)
            .with_base_delay_ms(200)
            .with_multiplier(3.0)
            .with_max_delay_ms(5000);

        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay_ms, 200);
        assert_eq!(policy.max_delay_ms, 5000);
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let policy = RetryPolicy::new().with_base_delay_ms(100).with_multiplier(2.0);

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(1000)
            .with_multiplier(2.0)
            .with_max_delay_ms(5000);

        assert_eq!(policy.delay_for(10), Duration::from_millis(5000));
    }

    #[test]
    fn test_decide_retries_then_gives_up() {
        let policy = RetryPolicy::new().with_max_attempts(3);

        assert!(matches!(policy.decide(1), RetryDecision::Retry(_)));
        assert!(matches!(policy.decide(2), RetryDecision::Retry(_)));
        assert_eq!(policy.decide(3), RetryDecision::GiveUp);
        assert_eq!(policy.decide(4), RetryDecision::GiveUp);
    }

    #[test]
    fn test_single_attempt_policy_never_retries() {
        let policy = RetryPolicy::new().with_max_attempts(1);
        assert_eq!(policy.decide(1), RetryDecision::GiveUp);
    }
}
