//! Reconnect backoff.

use crate::config::ReconnectConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a ceiling and random jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next retry, without jitter.
    pub fn base_delay(&self) -> Duration {
        let factor = self.config.multiplier.max(1.0).powi(self.attempt.min(64) as i32);
        let initial = self.config.initial_backoff.as_secs_f64();
        let ceiling = self.config.max_backoff.as_secs_f64();
        Duration::from_secs_f64((initial * factor).min(ceiling))
    }

    /// Delay before the next retry; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-jitter..=jitter);
        let jittered = base.as_secs_f64() * (1.0 + spread);
        Duration::from_secs_f64(jittered.min(self.config.max_backoff.as_secs_f64()).max(0.0))
    }

    /// Start over from the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
