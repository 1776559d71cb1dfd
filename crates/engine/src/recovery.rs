//! Recovery sweep: finds notifications that stopped moving and puts them
//! back in the queue.
//!
//! - `sending` older than `stale_after`: the worker died mid-delivery. The
//!   row is requeued, or dead-lettered if it has no attempts left.
//! - `pending` older than `stale_after`: ingestion failed to enqueue.
//! - `queued` older than `stale_queued_after`: the queue entry was lost.
//!
//! Age is measured from `Notification::last_activity()`, so a row waiting on
//! a delayed retry or throttle entry only counts as stale once that entry's
//! due time is itself `stale_queued_after` in the past.
//!
//! Every requeue is a conditional update that re-checks the staleness
//! cutoff, so two sweepers racing over the same row cannot both enqueue it.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::watch;

use herald_common::config::RecoveryConfig;
use herald_common::error::AppError;
use herald_common::types::{Notification, NotificationStatus, QueueEntry};

use crate::ledger::{AttemptOutcome, DeliveryLedger};
use crate::queue::WorkQueue;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub requeued_in_flight: u32,
    pub dead_lettered: u32,
    pub requeued_pending: u32,
    pub requeued_queued: u32,
}

impl SweepReport {
    pub fn total(&self) -> u32 {
        self.requeued_in_flight + self.dead_lettered + self.requeued_pending + self.requeued_queued
    }
}

pub struct RecoverySweeper {
    ledger: Arc<dyn DeliveryLedger>,
    queue: Arc<dyn WorkQueue>,
    config: RecoveryConfig,
    max_attempts: u32,
}

impl RecoverySweeper {
    pub fn new(
        ledger: Arc<dyn DeliveryLedger>,
        queue: Arc<dyn WorkQueue>,
        config: RecoveryConfig,
        max_attempts: u32,
    ) -> Self {
        Self {
            ledger,
            queue,
            config,
            max_attempts,
        }
    }

    /// Sweep periodically until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.config.interval_secs,
            stale_after_secs = self.config.stale_after_secs,
            "Recovery sweeper started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if report.total() > 0 => {
                            tracing::warn!(?report, "Recovered stalled notifications");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Recovery sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Recovery sweeper stopped");
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, AppError> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep treating `now` as the current time.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, AppError> {
        let mut report = SweepReport::default();
        let stale_cutoff = now - secs(self.config.stale_after_secs);
        let queued_cutoff = now - secs(self.config.stale_queued_after_secs);

        for row in self.stale(NotificationStatus::Sending, stale_cutoff).await? {
            if row.attempts >= self.max_attempts as i32 {
                let outcome = AttemptOutcome::DeadLettered {
                    error: format!(
                        "delivery abandoned in flight after {} attempts",
                        row.attempts
                    ),
                };
                if self.ledger.complete_attempt(row.id, &outcome).await?.is_some() {
                    tracing::error!(
                        notification_id = %row.id,
                        channel = %row.channel_target,
                        attempts = row.attempts,
                        "Stale in-flight notification dead-lettered"
                    );
                    report.dead_lettered += 1;
                }
                continue;
            }

            if self.requeue(&row, NotificationStatus::Sending, stale_cutoff).await? {
                report.requeued_in_flight += 1;
            }
        }

        for row in self.stale(NotificationStatus::Pending, stale_cutoff).await? {
            if self.requeue(&row, NotificationStatus::Pending, stale_cutoff).await? {
                report.requeued_pending += 1;
            }
        }

        for row in self.stale(NotificationStatus::Queued, queued_cutoff).await? {
            if self.requeue(&row, NotificationStatus::Queued, queued_cutoff).await? {
                report.requeued_queued += 1;
            }
        }

        Ok(report)
    }

    async fn stale(
        &self,
        status: NotificationStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Notification>, AppError> {
        self.ledger
            .find_stale(status, cutoff, self.config.batch_size)
            .await
    }

    /// Claim the row back to `queued` and enqueue it. Returns `false` if
    /// another actor moved the row first.
    async fn requeue(
        &self,
        row: &Notification,
        expected: NotificationStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        if self
            .ledger
            .mark_queued(row.id, expected, Some(cutoff))
            .await?
            .is_none()
        {
            return Ok(false);
        }

        // The row is `queued` with a fresh timestamp now. If this enqueue
        // fails, the queued pass of a later sweep retries it.
        if let Err(e) = self
            .queue
            .enqueue(&QueueEntry::new(row.id, row.priority))
            .await
        {
            tracing::warn!(notification_id = %row.id, error = %e, "Requeue enqueue failed");
            return Ok(false);
        }

        tracing::warn!(
            notification_id = %row.id,
            from = %expected,
            attempts = row.attempts,
            "Stale notification requeued"
        );
        Ok(true)
    }
}

fn secs(value: u64) -> ChronoDuration {
    ChronoDuration::seconds(value as i64)
}

#[cfg(test)]
mod tests {
    use herald_common::types::{DedupKey, NewNotification, Priority};

    use crate::ledger::MemoryLedger;
    use crate::queue::MemoryQueue;

    use super::*;

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        queue: Arc<MemoryQueue>,
        sweeper: RecoverySweeper,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let ledger = Arc::new(MemoryLedger::new());
        let queue = Arc::new(MemoryQueue::new(4));
        let sweeper = RecoverySweeper::new(
            ledger.clone(),
            queue.clone(),
            RecoveryConfig {
                interval_secs: 1,
                stale_after_secs: 60,
                stale_queued_after_secs: 600,
                batch_size: 50,
            },
            max_attempts,
        );
        Fixture {
            ledger,
            queue,
            sweeper,
        }
    }

    async fn create(ledger: &MemoryLedger, insight_id: &str) -> Notification {
        let (row, _) = ledger
            .create_or_get(NewNotification {
                key: DedupKey {
                    insight_id: insight_id.into(),
                    channel_target: "ops".into(),
                },
                priority: Priority::Normal,
                insight_type: None,
                payload: serde_json::json!({"text": insight_id}),
            })
            .await
            .unwrap();
        row
    }

    fn later(secs: i64) -> DateTime<Utc> {
        Utc::now() + ChronoDuration::seconds(secs)
    }

    #[tokio::test]
    async fn test_fresh_rows_left_alone() {
        let f = fixture(5);
        let row = create(&f.ledger, "I1").await;
        f.ledger.begin_attempt(row.id).await.unwrap();

        let report = f.sweeper.sweep_once().await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(f.queue.depth().await.unwrap().normal, 0);
    }

    #[tokio::test]
    async fn test_stale_sending_requeued() {
        let f = fixture(5);
        let row = create(&f.ledger, "I1").await;
        f.ledger.begin_attempt(row.id).await.unwrap();

        let report = f.sweeper.sweep_at(later(61)).await.unwrap();
        assert_eq!(report.requeued_in_flight, 1);

        let row = f.ledger.get(row.id).await.unwrap().unwrap();
        assert_eq!(row.status, NotificationStatus::Queued);
        assert_eq!(row.attempts, 1);
        let entry = f.queue.dequeue().await.unwrap().unwrap();
        assert_eq!(entry.notification_id, row.id);
    }

    #[tokio::test]
    async fn test_stale_sending_with_exhausted_attempts_dead_lettered() {
        let f = fixture(1);
        let row = create(&f.ledger, "I1").await;
        f.ledger.begin_attempt(row.id).await.unwrap();

        let report = f.sweeper.sweep_at(later(61)).await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.requeued_in_flight, 0);

        let row = f.ledger.get(row.id).await.unwrap().unwrap();
        assert_eq!(row.status, NotificationStatus::DeadLettered);
        assert!(row.last_error.is_some());
    }

    #[tokio::test]
    async fn test_stale_pending_and_queued_requeued() {
        let f = fixture(5);
        let pending = create(&f.ledger, "I1").await;
        let queued = create(&f.ledger, "I2").await;
        f.ledger
            .mark_queued(queued.id, NotificationStatus::Pending, None)
            .await
            .unwrap();

        // Past the in-flight threshold only: the queued row is not yet stale.
        let report = f.sweeper.sweep_at(later(61)).await.unwrap();
        assert_eq!(report.requeued_pending, 1);
        assert_eq!(report.requeued_queued, 0);

        let report = f.sweeper.sweep_at(later(601)).await.unwrap();
        assert_eq!(report.requeued_queued, 2);

        let pending = f.ledger.get(pending.id).await.unwrap().unwrap();
        assert_eq!(pending.status, NotificationStatus::Queued);
        assert_eq!(f.queue.depth().await.unwrap().normal, 3);
    }

    #[tokio::test]
    async fn test_scheduled_retry_not_requeued_before_due() {
        let f = fixture(5);
        let row = create(&f.ledger, "I1").await;
        f.ledger.begin_attempt(row.id).await.unwrap();
        f.ledger
            .complete_attempt(
                row.id,
                &AttemptOutcome::Retry {
                    error: "rate limited by channel".into(),
                    delay: std::time::Duration::from_secs(3_600),
                },
            )
            .await
            .unwrap()
            .unwrap();
        f.queue
            .enqueue_delayed(
                &QueueEntry::new(row.id, row.priority),
                std::time::Duration::from_secs(3_600),
            )
            .await
            .unwrap();

        let report = f.sweeper.sweep_at(later(601)).await.unwrap();
        assert_eq!(report, SweepReport::default());
        let depth = f.queue.depth().await.unwrap();
        assert_eq!((depth.normal, depth.delayed), (0, 1));

        // Due plus the queued threshold: the entry is presumed lost.
        let report = f.sweeper.sweep_at(later(3_600 + 601)).await.unwrap();
        assert_eq!(report.requeued_queued, 1);
    }

    #[tokio::test]
    async fn test_throttled_row_not_requeued_before_due() {
        let f = fixture(5);
        let row = create(&f.ledger, "I1").await;
        f.ledger
            .mark_queued(row.id, NotificationStatus::Pending, None)
            .await
            .unwrap();
        // Throttled repeatedly: each deferral pushes the due time out.
        for _ in 0..3 {
            f.ledger
                .defer(row.id, std::time::Duration::from_secs(30))
                .await
                .unwrap()
                .unwrap();
        }

        let report = f.sweeper.sweep_at(later(601)).await.unwrap();
        assert_eq!(report.requeued_queued, 0);

        let report = f.sweeper.sweep_at(later(631)).await.unwrap();
        assert_eq!(report.requeued_queued, 1);
        let row = f.ledger.get(row.id).await.unwrap().unwrap();
        assert!(row.next_attempt_at.is_none());
    }

    #[tokio::test]
    async fn test_throttled_pending_row_left_to_its_entry() {
        let f = fixture(5);
        let row = create(&f.ledger, "I1").await;
        f.ledger
            .defer(row.id, std::time::Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let report = f.sweeper.sweep_at(later(61)).await.unwrap();
        assert_eq!(report.requeued_pending, 0);
        assert_eq!(report.requeued_queued, 0);
    }

    #[tokio::test]
    async fn test_terminal_rows_never_touched() {
        let f = fixture(5);
        let row = create(&f.ledger, "I1").await;
        f.ledger.begin_attempt(row.id).await.unwrap();
        f.ledger
            .complete_attempt(row.id, &AttemptOutcome::Sent)
            .await
            .unwrap();

        let report = f.sweeper.sweep_at(later(3_600)).await.unwrap();
        assert_eq!(report.total(), 0);
        let row = f.ledger.get(row.id).await.unwrap().unwrap();
        assert_eq!(row.status, NotificationStatus::Sent);
    }
}
