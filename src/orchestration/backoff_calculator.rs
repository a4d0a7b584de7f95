//! # Backoff Calculator
//!
//! Exponential backoff for retrying transient collaborator failures.
//!
//! delay(n) = min(base * multiplier^(n-1), max), optionally stretched by up to
//! `jitter_max_percentage` to spread out retries against the same dependency.

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Computes retry delays from [`BackoffConfig`]
#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    config: BackoffConfig,
}

impl BackoffCalculator {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Whether another attempt is allowed after `attempts_made`
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.config.max_attempts
    }

    /// Delay before retry number `retry` (1-based), without jitter
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let factor = self.config.backoff_multiplier.powi(exponent);
        let millis = (self.config.base_delay_ms as f64 * factor)
            .min(self.config.max_delay_ms as f64)
            .max(0.0);
        Duration::from_millis(millis as u64)
    }

    /// Delay before retry number `retry`, with jitter when enabled
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.base_delay_for(retry);
        if !self.config.jitter_enabled || self.config.jitter_max_percentage <= 0.0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=self.config.jitter_max_percentage);
        delay.mul_f64(1.0 + jitter).min(self.config.max_delay())
    }
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
