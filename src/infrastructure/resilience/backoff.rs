//! Exponential backoff between failed transport reads

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound for any delay in milliseconds
    pub max_delay_ms: u64,
    /// Growth factor applied after every attempt
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
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

/// Exponential backoff calculator with jitter.
///
/// The first delay equals `initial_delay_ms`; every subsequent delay grows by
/// `multiplier` until capped at `max_delay_ms`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    next_base_ms: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        let initial = config.initial_delay_ms.max(1) as f64;
        Self {
            config,
            next_base_ms: initial,
            attempt: 0,
        }
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;

        let capped = self.next_base_ms.min(self.config.max_delay_ms as f64);
        self.next_base_ms = (capped * self.config.multiplier).min(self.config.max_delay_ms as f64);

        let delay = if self.config.jitter_factor > 0.0 {
            let range = capped * self.config.jitter_factor;
            let jitter = rand::rng().random_range(-range..=range);
            (capped + jitter).clamp(1.0, self.config.max_delay_ms.max(1) as f64)
        } else {
            capped.max(1.0)
        };

        Duration::from_millis(delay as u64)
    }

    /// Back to the initial delay after a successful attempt
    pub fn reset(&mut self) {
        self.next_base_ms = self.config.initial_delay_ms.max(1) as f64;
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
