// 12.3: exponential backoff with a cap. base * 2^attempt, clamped.

use crate::config::SyncConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        )
    }

    /// Delay before the next attempt. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .base
            .checked_mul(2u32.saturating_pow(self.attempt))
            .unwrap_or(self.max)
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
