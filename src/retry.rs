//! Retry and backoff decisions.

use std::time::Duration;

use rand::Rng;

use crate::config::{PipelineConfig, RetryConfig};
use crate::error::FailureKind;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the given delay.
    Retry(Duration),
    /// Stop and surface the failure.
    GiveUp,
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry(_))
    }
}

/// Decides whether a failed attempt is retried and how long to wait.
///
/// Delays grow exponentially with the attempt number, get up to a quarter
/// of the base delay added as jitter, and never exceed `max_delay_ms`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, config: RetryConfig) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            config,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.max_attempts, config.retry.clone())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides what follows the failure of attempt number `attempt`
    /// (1-based).
    pub fn decide(&self, attempt: u32, kind: FailureKind) -> RetryDecision {
        if !kind.is_retryable() || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for(attempt))
    }

    /// Backoff before the attempt following `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.config.base_delay_ms as f64 * self.config.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.config.jitter {
            return base;
        }
        let spread = self.config.base_delay_ms / 4;
        let jitter = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=spread)
        };
        let max = Duration::from_millis(self.config.max_delay_ms);
        (base + Duration::from_millis(jitter)).min(max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}
