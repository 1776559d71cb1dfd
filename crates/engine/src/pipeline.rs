//! Shared backends wired from configuration.

use std::sync::Arc;

use herald_common::config::{AppConfig, StorageBackend};
use herald_common::connect;

use crate::ingress::IngressAdapter;
use crate::interaction::InteractionProcessor;
use crate::ledger::{DeliveryLedger, MemoryLedger, PgLedger};
use crate::queue::{MemoryQueue, RedisQueue, WorkQueue};
use crate::rate_limit::{MemoryBucketStore, RateLimiter, RedisBucketStore};
use crate::recovery::RecoverySweeper;
use crate::routing::ChannelRouter;

/// The ledger, queue and limiter every component of one deployment shares.
#[derive(Clone)]
pub struct Pipeline {
    pub ledger: Arc<dyn DeliveryLedger>,
    pub queue: Arc<dyn WorkQueue>,
    pub limiter: Arc<RateLimiter>,
}

impl Pipeline {
    /// Connect the backends selected by `config.storage`. Runs migrations for
    /// the postgres backend.
    pub async fn connect(config: &AppConfig) -> anyhow::Result<Self> {
        match config.storage {
            StorageBackend::Memory => Ok(Self::in_memory(config)),
            StorageBackend::Postgres => {
                let pool = connect::postgres(config).await?;
                let redis = connect::redis(&config.redis_url).await?;
                let prefix = &config.queue.key_prefix;

                Ok(Self {
                    ledger: Arc::new(PgLedger::new(pool)),
                    queue: Arc::new(RedisQueue::new(
                        redis.clone(),
                        prefix,
                        config.queue.high_weight,
                    )),
                    limiter: Arc::new(RateLimiter::new(
                        Arc::new(RedisBucketStore::new(redis, prefix)),
                        config.rate_limit.clone(),
                    )),
                })
            }
        }
    }

    pub fn in_memory(config: &AppConfig) -> Self {
        Self {
            ledger: Arc::new(MemoryLedger::new()),
            queue: Arc::new(MemoryQueue::new(config.queue.high_weight)),
            limiter: Arc::new(RateLimiter::new(
                Arc::new(MemoryBucketStore::new()),
                config.rate_limit.clone(),
            )),
        }
    }

    pub fn ingress(&self, config: &AppConfig) -> IngressAdapter {
        IngressAdapter::new(
            self.ledger.clone(),
            self.queue.clone(),
            ChannelRouter::new(config.routing.clone()),
        )
    }

    pub fn interactions(&self) -> InteractionProcessor {
        InteractionProcessor::new(self.ledger.clone())
    }

    pub fn sweeper(&self, config: &AppConfig) -> RecoverySweeper {
        RecoverySweeper::new(
            self.ledger.clone(),
            self.queue.clone(),
            config.recovery.clone(),
            config.retry.max_attempts,
        )
    }
}
