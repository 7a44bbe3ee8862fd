//! Exponential backoff with full jitter for watch and lock retry loops.

use std::time::Duration;

use rand::Rng;

/// Configuration for backoff behavior.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay ceiling (default: 100ms).
    pub base: Duration,
    /// Growth factor per failure (default: 2.0).
    pub multiplier: f64,
    /// Ceiling on the delay (default: 20s).
    pub max: Duration,
    /// Draw the delay uniformly from `[0, ceiling)` (default: true).
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(20),
            jitter: true,
        }
    }
}

/// Stateful backoff: each `next_delay` grows the ceiling, `reset` starts over.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff with the given configuration.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Number of consecutive failures recorded.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Current ceiling without jitter.
    pub fn ceiling(&self) -> Duration {
        let base_ms = self.config.base.as_millis() as f64;
        let max_ms = self.config.max.as_millis() as f64;
        let computed = base_ms * self.config.multiplier.powi(self.attempt as i32);
        Duration::from_millis(computed.min(max_ms) as u64)
    }

    /// Delay to wait before the next attempt; grows the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        if !self.config.jitter {
            return ceiling;
        }
        let ceiling_ms = ceiling.as_millis() as u64;
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..ceiling_ms))
    }

    /// Forgets previous failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
