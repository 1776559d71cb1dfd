//! Per-channel token-bucket admission control.
//!
//! One bucket per `channel_target`, created full on first use. Each send
//! attempt takes one token; tokens refill continuously at `refill_per_sec` up
//! to `capacity`. High and normal priority share the bucket, but a normal send
//! must leave at least `high_reserve` tokens behind, so a flood of normal
//! traffic cannot drain the quota high-priority sends need.
//!
//! The refill-then-take step runs atomically inside the `BucketStore`.

pub mod memory;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;

use herald_common::config::{BucketLimits, RateLimitConfig};
use herald_common::error::AppError;
use herald_common::types::Priority;

pub use self::memory::MemoryBucketStore;
pub use self::redis::RedisBucketStore;

/// Bucket state at `last_refill_ms`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucket {
    pub tokens: f64,
    pub last_refill_ms: i64,
}

impl TokenBucket {
    pub fn full(limits: BucketLimits, now_ms: i64) -> Self {
        Self {
            tokens: limits.capacity,
            last_refill_ms: now_ms,
        }
    }

    /// Add the tokens earned since the last refill. Clock steps backwards are
    /// ignored rather than draining the bucket.
    pub fn refill(&mut self, limits: BucketLimits, now_ms: i64) {
        let elapsed_ms = (now_ms - self.last_refill_ms).max(0);
        let earned = elapsed_ms as f64 / 1000.0 * limits.refill_per_sec;
        self.tokens = (self.tokens + earned).min(limits.capacity);
        self.last_refill_ms = self.last_refill_ms.max(now_ms);
    }

    /// Take one token if doing so leaves at least `floor` in the bucket.
    pub fn try_take(&mut self, floor: f64) -> bool {
        if self.tokens - 1.0 >= floor {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Storage for bucket state. `try_take` must refill and take as one atomic
/// step per channel.
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn try_take(
        &self,
        channel_target: &str,
        limits: BucketLimits,
        floor: f64,
        now_ms: i64,
    ) -> Result<bool, AppError>;
}

pub struct RateLimiter {
    store: Arc<dyn BucketStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn BucketStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// Try to take one send token for `channel_target`.
    pub async fn try_acquire(
        &self,
        channel_target: &str,
        priority: Priority,
    ) -> Result<bool, AppError> {
        let limits = self.config.limits_for(channel_target);
        let floor = self.floor_for(limits, priority);
        let now_ms = chrono::Utc::now().timestamp_millis();

        let granted = self
            .store
            .try_take(channel_target, limits, floor, now_ms)
            .await?;

        if !granted {
            tracing::debug!(channel = channel_target, %priority, "Rate limit token denied");
        }
        Ok(granted)
    }

    /// Tokens that must remain after a take. A reserve at or above capacity
    /// would shut normal traffic out for good, so it is capped one token
    /// below capacity.
    fn floor_for(&self, limits: BucketLimits, priority: Priority) -> f64 {
        match priority {
            Priority::High => 0.0,
            Priority::Normal => self
                .config
                .high_reserve
                .min(limits.capacity - 1.0)
                .max(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const LIMITS: BucketLimits = BucketLimits {
        capacity: 5.0,
        refill_per_sec: 2.0,
    };

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let mut bucket = TokenBucket {
            tokens: 0.0,
            last_refill_ms: 0,
        };
        bucket.refill(LIMITS, 1_000);
        assert_eq!(bucket.tokens, 2.0);

        bucket.refill(LIMITS, 60_000);
        assert_eq!(bucket.tokens, 5.0);
        assert_eq!(bucket.last_refill_ms, 60_000);
    }

    #[test]
    fn test_refill_ignores_clock_going_back() {
        let mut bucket = TokenBucket {
            tokens: 1.0,
            last_refill_ms: 10_000,
        };
        bucket.refill(LIMITS, 5_000);
        assert_eq!(bucket.tokens, 1.0);
        assert_eq!(bucket.last_refill_ms, 10_000);
    }

    #[test]
    fn test_take_respects_floor() {
        let mut bucket = TokenBucket::full(LIMITS, 0);
        let mut normal = 0;
        while bucket.try_take(2.0) {
            normal += 1;
        }
        assert_eq!(normal, 3);
        assert!(bucket.try_take(0.0));
        assert!(bucket.try_take(0.0));
        assert!(!bucket.try_take(0.0));
    }

    #[test]
    fn test_ceiling_over_one_second_window() {
        // Sends admitted in any 1s window never exceed capacity + refill rate.
        let mut bucket = TokenBucket::full(LIMITS, 0);
        let mut admitted_at = Vec::new();
        for now in (0..10_000).step_by(10) {
            bucket.refill(LIMITS, now);
            if bucket.try_take(0.0) {
                admitted_at.push(now);
            }
        }

        for (i, start) in admitted_at.iter().enumerate() {
            let in_window = admitted_at[i..]
                .iter()
                .take_while(|t| **t < start + 1_000)
                .count();
            assert!(in_window as f64 <= LIMITS.capacity + LIMITS.refill_per_sec);
        }
    }

    #[test]
    fn test_reserve_capped_below_capacity() {
        let limiter = RateLimiter::new(
            Arc::new(MemoryBucketStore::new()),
            RateLimitConfig {
                default_limits: BucketLimits {
                    capacity: 2.0,
                    refill_per_sec: 1.0,
                },
                high_reserve: 10.0,
                overrides: HashMap::new(),
            },
        );
        let limits = limiter.config.limits_for("ops");
        assert_eq!(limiter.floor_for(limits, Priority::Normal), 1.0);
        assert_eq!(limiter.floor_for(limits, Priority::High), 0.0);
    }

    #[tokio::test]
    async fn test_high_priority_keeps_reserve() {
        let limiter = RateLimiter::new(
            Arc::new(MemoryBucketStore::new()),
            RateLimitConfig {
                default_limits: BucketLimits {
                    capacity: 4.0,
                    refill_per_sec: 0.001,
                },
                high_reserve: 2.0,
                overrides: HashMap::new(),
            },
        );

        assert!(limiter.try_acquire("ops", Priority::Normal).await.unwrap());
        assert!(limiter.try_acquire("ops", Priority::Normal).await.unwrap());
        assert!(!limiter.try_acquire("ops", Priority::Normal).await.unwrap());
        assert!(limiter.try_acquire("ops", Priority::High).await.unwrap());
        assert!(limiter.try_acquire("ops", Priority::High).await.unwrap());
        assert!(!limiter.try_acquire("ops", Priority::High).await.unwrap());

        // Other channels have their own bucket.
        assert!(limiter.try_acquire("sales", Priority::Normal).await.unwrap());
    }

    #[tokio::test]
    async fn test_per_channel_override() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "vip".to_string(),
            BucketLimits {
                capacity: 1.0,
                refill_per_sec: 0.001,
            },
        );
        let limiter = RateLimiter::new(
            Arc::new(MemoryBucketStore::new()),
            RateLimitConfig {
                high_reserve: 0.0,
                overrides,
                ..RateLimitConfig::default()
            },
        );

        assert!(limiter.try_acquire("vip", Priority::High).await.unwrap());
        assert!(!limiter.try_acquire("vip", Priority::High).await.unwrap());
    }
}
