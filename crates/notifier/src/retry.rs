//! Backoff and throttle delays.

use std::time::Duration;

use rand::Rng;

use herald_common::config::RetryConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// `true` once `attempts` transient failures use up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.config.max_attempts
    }

    /// `min(base * 2^attempts, cap)`, before jitter.
    pub fn base_delay(&self, attempts: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempts);
        let ms = self.config.base_ms.saturating_mul(factor).min(self.config.cap_ms);
        Duration::from_millis(ms)
    }

    /// Delay before the next attempt, with up to `jitter_ms` added.
    pub fn backoff(&self, attempts: u32) -> Duration {
        self.base_delay(attempts) + jitter(self.config.jitter_ms)
    }

    /// Delay before retrying a send the local rate limiter turned away.
    pub fn throttle_delay(&self) -> Duration {
        Duration::from_millis(self.config.throttle_delay_ms) + jitter(self.config.throttle_jitter_ms)
    }
}

fn jitter(window_ms: u64) -> Duration {
    if window_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=window_ms))
}
