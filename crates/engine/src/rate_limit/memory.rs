use async_trait::async_trait;
use dashmap::DashMap;

use herald_common::config::BucketLimits;
use herald_common::error::AppError;

use super::{BucketStore, TokenBucket};

/// Buckets in process memory. The dashmap entry guard locks one channel's
/// shard for the refill-then-take, so channels never contend with each other
/// beyond shard collisions.
#[derive(Default)]
pub struct MemoryBucketStore {
    buckets: DashMap<String, TokenBucket>,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn try_take(
        &self,
        channel_target: &str,
        limits: BucketLimits,
        floor: f64,
        now_ms: i64,
    ) -> Result<bool, AppError> {
        let mut bucket = self
            .buckets
            .entry(channel_target.to_string())
            .or_insert_with(|| TokenBucket::full(limits, now_ms));
        bucket.refill(limits, now_ms);
        Ok(bucket.try_take(floor))
    }
}
