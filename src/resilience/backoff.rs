//! Reconnection delays for the dedicated listener connections.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay used as +/- random jitter (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Exponential backoff with jitter, reset after each successful connect.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    next_ms: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        let next_ms = config.initial_delay_ms as f64;
        Self {
            config,
            next_ms,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;

        let base = self.next_ms.min(self.config.max_delay_ms as f64);
        self.next_ms = (base * self.config.multiplier).min(self.config.max_delay_ms as f64);

        let spread = base * self.config.jitter_factor.clamp(0.0, 1.0);
        let delay = if spread > 0.0 {
            base + rand::rng().random_range(-spread..=spread)
        } else {
            base
        };

        Duration::from_millis(delay.max(1.0) as u64)
    }

    pub fn reset(&mut self) {
        self.next_ms = self.config.initial_delay_ms as f64;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
