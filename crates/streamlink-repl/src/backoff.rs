//! Retry delay for failing feeds.
//!
//! The delay is a capped exponential of the consecutive failure count. It carries no
//! jitter so that it never shrinks while failures accumulate.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for feed retry backoff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the first failure in milliseconds (default: 250ms).
    pub initial_ms: u64,
    /// Upper bound in milliseconds (default: 30 seconds).
    pub max_ms: u64,
    /// Growth factor per additional failure (default: 2.0).
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 250,
            max_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Retry delay after `failures` consecutive failures. Zero failures means no wait.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_ms as f64;
        let max = self.max_ms.max(self.initial_ms) as f64;
        let exponent = (failures - 1).min(63) as i32;
        let computed = base * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(computed.min(max) as u64)
    }
}
