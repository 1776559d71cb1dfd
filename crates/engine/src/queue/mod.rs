//! Two-lane priority work queue.
//!
//! Each lane is FIFO. `dequeue` follows a weighted round-robin: up to
//! `high_weight` high-priority entries are handed out in a row, after which
//! one normal entry is taken if the normal lane has any. Retries and
//! throttled sends go through `enqueue_delayed` and rejoin the tail of their
//! lane once due.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use herald_common::error::AppError;
use herald_common::types::{Priority, QueueEntry};

pub use self::memory::MemoryQueue;
pub use self::redis::RedisQueue;

/// Lane sizes, for operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub high: u64,
    pub normal: u64,
    /// Entries waiting out a retry or throttle delay, both lanes.
    pub delayed: u64,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, entry: &QueueEntry) -> Result<(), AppError>;

    /// Make `entry` visible to `dequeue` only after `delay` has passed.
    async fn enqueue_delayed(&self, entry: &QueueEntry, delay: Duration) -> Result<(), AppError>;

    /// Pop one entry. Each entry is returned to exactly one caller.
    async fn dequeue(&self) -> Result<Option<QueueEntry>, AppError>;

    async fn depth(&self) -> Result<QueueDepth, AppError>;

    async fn ping(&self) -> Result<(), AppError>;
}

/// Lane selection state for the weighted round-robin.
///
/// `streak` counts high-priority entries handed out since the last normal one.
#[derive(Debug, Clone, Copy)]
pub struct WeightedRoundRobin {
    weight: u32,
    streak: u32,
}

impl WeightedRoundRobin {
    pub fn new(weight: u32) -> Self {
        Self {
            weight: weight.max(1),
            streak: 0,
        }
    }

    /// Pick the lane to pop from given which lanes hold work, and record the
    /// choice.
    pub fn pick(&mut self, high_ready: bool, normal_ready: bool) -> Option<Priority> {
        let lane = if normal_ready && self.streak >= self.weight {
            Priority::Normal
        } else if high_ready {
            Priority::High
        } else if normal_ready {
            Priority::Normal
        } else {
            return None;
        };

        match lane {
            Priority::High => self.streak += 1,
            Priority::Normal => self.streak = 0,
        }
        Some(lane)
    }
}
