//! Backoff policy for provider errors.
//!
//! Rate limits back off exponentially with a capped delay and hard-fail after
//! a bounded number of consecutive hits. Other errors are tolerated a bounded
//! number of times in a row before the run fails.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry and escalation limits for provider calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Consecutive rate-limit hits tolerated before the run fails.
    pub max_rate_limit_retries: u32,
    /// Consecutive generic errors tolerated before the run fails.
    pub max_generic_errors: u32,
    /// Delay before the first rate-limit retry.
    pub initial_delay_ms: u64,
    /// Upper bound for any single backoff.
    pub max_delay_ms: u64,
    /// Backoff multiplier (2.0 doubles the delay each attempt).
    pub multiplier: f64,
    /// Spread retries with deterministic jitter.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: 5,
            max_generic_errors: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Configuration with no waiting between attempts, for tests and replays.
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            jitter: false,
            ..Default::default()
        }
    }

    /// Backoff before retry number `attempt` (0-indexed), capped at the max.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms as f64);

        if self.jitter {
            // Deterministic spread keyed on the attempt number.
            let factor = match attempt % 4 {
                0 => 0.80,
                1 => 0.95,
                2 => 0.70,
                _ => 0.90,
            };
            Duration::from_millis((capped * factor) as u64)
        } else {
            Duration::from_millis(capped as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_escalation_limits() {
        let config = RetryConfig::default();
        assert_eq!(config.max_rate_limit_retries, 5);
        assert_eq!(config.max_generic_errors, 3);
    }

    #[test]
    fn exponential_growth_without_jitter() {
        let config = RetryConfig {
            jitter: false,
            ..Default::default()
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(1_000));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(2_000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(4_000));
    }

    #[test]
    fn delay_is_capped() {
        let config = RetryConfig {
            jitter: false,
            ..Default::default()
        };
        assert_eq!(config.delay_for_attempt(20), Duration::from_millis(30_000));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let config = RetryConfig::default();
        for attempt in 0..12 {
            assert!(config.delay_for_attempt(attempt) <= Duration::from_millis(30_000));
        }
    }

    #[test]
    fn immediate_has_zero_delay() {
        assert_eq!(RetryConfig::immediate().delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn deserializes_partial_config() {
        let config: RetryConfig = serde_json::from_str(r#"{"max_generic_errors": 7}"#).unwrap();
        assert_eq!(config.max_generic_errors, 7);
        assert_eq!(config.max_rate_limit_retries, 5);
    }
}
