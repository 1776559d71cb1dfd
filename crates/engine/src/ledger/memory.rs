//! In-process ledger backed by `DashMap`.
//!
//! Each row lives behind its shard's lock, so conditional updates are atomic
//! per notification without a ledger-wide mutex. The dedup index is a second
//! map; creation always locks dedup before rows, never the reverse.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{DedupKey, NewNotification, Notification, NotificationStatus};

use super::{AttemptOutcome, DeliveryLedger};

#[derive(Default)]
pub struct MemoryLedger {
    rows: DashMap<Uuid, Notification>,
    dedup: DashMap<DedupKey, Uuid>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `update` to the row if it exists; return a snapshot when it
    /// reports a change.
    fn update_if<F>(&self, id: Uuid, update: F) -> Option<Notification>
    where
        F: FnOnce(&mut Notification) -> bool,
    {
        let mut row = self.rows.get_mut(&id)?;
        if update(row.value_mut()) {
            Some(row.value().clone())
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl DeliveryLedger for MemoryLedger {
    async fn create_or_get(
        &self,
        new: NewNotification,
    ) -> Result<(Notification, bool), AppError> {
        match self.dedup.entry(new.key.clone()) {
            Entry::Occupied(existing) => {
                let id = *existing.get();
                let row = self.rows.get(&id).map(|r| r.clone()).ok_or_else(|| {
                    AppError::Internal(format!("dedup index points at missing row {}", id))
                })?;
                Ok((row, false))
            }
            Entry::Vacant(slot) => {
                let now = Utc::now();
                let row = Notification {
                    id: Uuid::new_v4(),
                    insight_id: new.key.insight_id,
                    channel_target: new.key.channel_target,
                    priority: new.priority,
                    insight_type: new.insight_type,
                    status: NotificationStatus::Pending,
                    payload: new.payload,
                    attempts: 0,
                    last_error: None,
                    acknowledged_by: None,
                    acknowledged_at: None,
                    read_by: Vec::new(),
                    created_at: now,
                    updated_at: now,
                    next_attempt_at: None,
                    sent_at: None,
                    delivered_at: None,
                };
                self.rows.insert(row.id, row.clone());
                slot.insert(row.id);
                Ok((row, true))
            }
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        Ok(self.rows.get(&id).map(|r| r.clone()))
    }

    async fn find_by_dedup_key(&self, key: &DedupKey) -> Result<Option<Notification>, AppError> {
        let Some(id) = self.dedup.get(key).map(|id| *id) else {
            return Ok(None);
        };
        self.get(id).await
    }

    async fn mark_queued(
        &self,
        id: Uuid,
        expected: NotificationStatus,
        changed_before: Option<DateTime<Utc>>,
    ) -> Result<Option<Notification>, AppError> {
        Ok(self.update_if(id, |row| {
            if expected.is_terminal()
                || row.status != expected
                || changed_before.is_some_and(|c| row.last_activity() >= c)
            {
                return false;
            }
            row.status = NotificationStatus::Queued;
            row.updated_at = Utc::now();
            row.next_attempt_at = None;
            true
        }))
    }

    async fn defer(&self, id: Uuid, delay: Duration) -> Result<Option<Notification>, AppError> {
        Ok(self.update_if(id, |row| {
            if !row.status.is_dispatchable() {
                return false;
            }
            let now = Utc::now();
            row.status = NotificationStatus::Queued;
            row.updated_at = now;
            row.next_attempt_at = Some(due_after(now, delay));
            true
        }))
    }

    async fn begin_attempt(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        Ok(self.update_if(id, |row| {
            if !row.status.is_dispatchable() {
                return false;
            }
            row.status = NotificationStatus::Sending;
            row.attempts += 1;
            row.updated_at = Utc::now();
            row.next_attempt_at = None;
            true
        }))
    }

    async fn complete_attempt(
        &self,
        id: Uuid,
        outcome: &AttemptOutcome,
    ) -> Result<Option<Notification>, AppError> {
        Ok(self.update_if(id, |row| {
            if row.status != NotificationStatus::Sending {
                return false;
            }
            let now = Utc::now();
            row.status = outcome.target_status();
            row.updated_at = now;
            row.next_attempt_at = outcome.retry_delay().map(|delay| due_after(now, delay));
            match outcome {
                AttemptOutcome::Sent => {
                    row.sent_at = Some(now);
                    row.last_error = None;
                }
                _ => row.last_error = outcome.error().map(str::to_string),
            }
            true
        }))
    }

    async fn mark_delivered(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        Ok(self.update_if(id, |row| {
            if row.status != NotificationStatus::Sent {
                return false;
            }
            let now = Utc::now();
            row.status = NotificationStatus::Delivered;
            row.delivered_at = Some(now);
            row.updated_at = now;
            true
        }))
    }

    async fn cancel(&self, id: Uuid, reason: &str) -> Result<Option<Notification>, AppError> {
        Ok(self.update_if(id, |row| {
            if !matches!(
                row.status,
                NotificationStatus::Queued | NotificationStatus::Sending
            ) {
                return false;
            }
            row.status = NotificationStatus::Failed;
            row.last_error = Some(reason.to_string());
            row.updated_at = Utc::now();
            true
        }))
    }

    async fn acknowledge(&self, id: Uuid, actor: &str) -> Result<Option<Notification>, AppError> {
        Ok(self.update_if(id, |row| {
            if row.acknowledged_by.is_some() {
                return false;
            }
            row.acknowledged_by = Some(actor.to_string());
            row.acknowledged_at = Some(Utc::now());
            true
        }))
    }

    async fn add_reader(&self, id: Uuid, actor: &str) -> Result<Option<Notification>, AppError> {
        Ok(self.update_if(id, |row| {
            if !row.read_by.iter().any(|r| r == actor) {
                row.read_by.push(actor.to_string());
            }
            true
        }))
    }

    async fn list_by_status(
        &self,
        status: NotificationStatus,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        let mut rows: Vec<Notification> = self
            .rows
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.clone())
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn find_stale(
        &self,
        status: NotificationStatus,
        changed_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        let mut rows: Vec<Notification> = self
            .rows
            .iter()
            .filter(|r| r.status == status && r.last_activity() < changed_before)
            .map(|r| r.clone())
            .collect();
        rows.sort_by_key(|r| r.last_activity());
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn ping(&self) -> Result<(), AppError> {
        Ok(())
    }
}

fn due_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
