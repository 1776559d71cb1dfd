//! Delivery ledger: the durable record of every notification's lifecycle.
//!
//! The ledger exclusively owns `Notification` rows. Callers never write a
//! whole row; every mutation is a conditional update keyed by the row's
//! current status (or field value), so concurrent workers, sweepers and
//! interaction handlers cannot clobber each other:
//!
//! - creation is idempotent on `(insight_id, channel_target)`
//! - status moves only along the state machine and never out of a terminal
//! - `acknowledged_by` is write-once, first writer wins
//! - `read_by` is an append-only set
//!
//! Methods returning `Option<Notification>` yield `None` when the condition
//! did not hold (or the row does not exist); callers decide what that means.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{DedupKey, NewNotification, Notification, NotificationStatus};

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

/// `last_error` recorded for administrative cancellation.
pub const CANCELLED_BY_OPERATOR: &str = "cancelled by operator";

/// How a delivery attempt ended, as recorded on the `sending` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Channel accepted the message. Clears `last_error`, stamps `sent_at`.
    Sent,
    /// Transient failure with attempts left: back to `queued`, due again
    /// after `delay`.
    Retry { error: String, delay: Duration },
    /// Permanent failure: `failed`.
    Failed { error: String },
    /// Transient failures exhausted the attempt budget: `dead_lettered`.
    DeadLettered { error: String },
}

impl AttemptOutcome {
    pub fn target_status(&self) -> NotificationStatus {
        match self {
            AttemptOutcome::Sent => NotificationStatus::Sent,
            AttemptOutcome::Retry { .. } => NotificationStatus::Queued,
            AttemptOutcome::Failed { .. } => NotificationStatus::Failed,
            AttemptOutcome::DeadLettered { .. } => NotificationStatus::DeadLettered,
        }
    }

    /// Due time of the next attempt, relative to when the outcome is recorded.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            AttemptOutcome::Retry { delay, .. } => Some(*delay),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            AttemptOutcome::Sent => None,
            AttemptOutcome::Retry { error, .. }
            | AttemptOutcome::Failed { error }
            | AttemptOutcome::DeadLettered { error } => Some(error),
        }
    }
}

#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    /// Insert a `pending` notification, or return the existing row for the
    /// same dedup key. The flag is `true` only for the caller that created it.
    async fn create_or_get(&self, new: NewNotification)
    -> Result<(Notification, bool), AppError>;

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, AppError>;

    async fn find_by_dedup_key(&self, key: &DedupKey) -> Result<Option<Notification>, AppError>;

    /// `expected → queued` for an immediate enqueue, optionally only if the
    /// row's `last_activity()` is before `changed_before`. Refreshes
    /// `updated_at` and clears `next_attempt_at`.
    async fn mark_queued(
        &self,
        id: Uuid,
        expected: NotificationStatus,
        changed_before: Option<DateTime<Utc>>,
    ) -> Result<Option<Notification>, AppError>;

    /// `pending | queued → queued` with `next_attempt_at = now + delay`, for
    /// an entry re-enqueued with a delay outside an attempt (throttling).
    async fn defer(&self, id: Uuid, delay: Duration) -> Result<Option<Notification>, AppError>;

    /// `pending | queued → sending`, incrementing `attempts`.
    async fn begin_attempt(&self, id: Uuid) -> Result<Option<Notification>, AppError>;

    /// `sending → outcome.target_status()`. A retry also stamps
    /// `next_attempt_at`.
    async fn complete_attempt(
        &self,
        id: Uuid,
        outcome: &AttemptOutcome,
    ) -> Result<Option<Notification>, AppError>;

    /// `sent → delivered`, stamping `delivered_at`.
    async fn mark_delivered(&self, id: Uuid) -> Result<Option<Notification>, AppError>;

    /// `queued | sending → failed` with `reason` as `last_error`.
    async fn cancel(&self, id: Uuid, reason: &str) -> Result<Option<Notification>, AppError>;

    /// Set `acknowledged_by` only if it is still unset.
    async fn acknowledge(&self, id: Uuid, actor: &str) -> Result<Option<Notification>, AppError>;

    /// Add `actor` to `read_by` if absent. Returns the row either way.
    async fn add_reader(&self, id: Uuid, actor: &str) -> Result<Option<Notification>, AppError>;

    /// Newest first.
    async fn list_by_status(
        &self,
        status: NotificationStatus,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError>;

    /// Rows in `status` whose `last_activity()` is before `changed_before`,
    /// oldest first.
    async fn find_stale(
        &self,
        status: NotificationStatus,
        changed_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError>;

    /// Cheap reachability check for health endpoints.
    async fn ping(&self) -> Result<(), AppError>;
}
