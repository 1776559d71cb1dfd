//! PostgreSQL ledger.
//!
//! Every transition is a single `UPDATE ... WHERE <condition> RETURNING *`;
//! Postgres' row lock makes the check and the write one atomic step, so no
//! read-then-write happens in application code.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{DedupKey, NewNotification, Notification, NotificationStatus};

use super::{AttemptOutcome, DeliveryLedger};

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryLedger for PgLedger {
    async fn create_or_get(
        &self,
        new: NewNotification,
    ) -> Result<(Notification, bool), AppError> {
        // ON CONFLICT DO NOTHING waits for a concurrent inserter of the same
        // key to commit, so the fallback SELECT always finds its row.
        let inserted: Option<Notification> = sqlx::query_as(
            r#"
            INSERT INTO notifications (id, insight_id, channel_target, priority, insight_type, status, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (insight_id, channel_target) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.key.insight_id)
        .bind(&new.key.channel_target)
        .bind(new.priority.to_string())
        .bind(new.insight_type.map(|t| t.to_string()))
        .bind(NotificationStatus::Pending.to_string())
        .bind(&new.payload)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((row, true));
        }

        let existing = self.find_by_dedup_key(&new.key).await?.ok_or_else(|| {
            AppError::Internal(format!(
                "notification {} conflicted but could not be read back",
                new.key
            ))
        })?;
        Ok((existing, false))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        let row = sqlx::query_as("SELECT * FROM notifications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn find_by_dedup_key(&self, key: &DedupKey) -> Result<Option<Notification>, AppError> {
        let row = sqlx::query_as(
            "SELECT * FROM notifications WHERE insight_id = $1 AND channel_target = $2",
        )
        .bind(&key.insight_id)
        .bind(&key.channel_target)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn mark_queued(
        &self,
        id: Uuid,
        expected: NotificationStatus,
        changed_before: Option<DateTime<Utc>>,
    ) -> Result<Option<Notification>, AppError> {
        if expected.is_terminal() {
            return Ok(None);
        }

        let row = sqlx::query_as(
            r#"
            UPDATE notifications
            SET status = 'queued', updated_at = NOW(), next_attempt_at = NULL
            WHERE id = $1
              AND status = $2
              AND ($3::timestamptz IS NULL OR GREATEST(updated_at, next_attempt_at) < $3)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(expected.to_string())
        .bind(changed_before)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn defer(&self, id: Uuid, delay: Duration) -> Result<Option<Notification>, AppError> {
        let row = sqlx::query_as(
            r#"
            UPDATE notifications
            SET status = 'queued',
                updated_at = NOW(),
                next_attempt_at = NOW() + $2 * INTERVAL '1 millisecond'
            WHERE id = $1 AND status IN ('pending', 'queued')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(millis(delay))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn begin_attempt(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        let row = sqlx::query_as(
            r#"
            UPDATE notifications
            SET status = 'sending', attempts = attempts + 1, updated_at = NOW(), next_attempt_at = NULL
            WHERE id = $1 AND status IN ('pending', 'queued')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn complete_attempt(
        &self,
        id: Uuid,
        outcome: &AttemptOutcome,
    ) -> Result<Option<Notification>, AppError> {
        let row = match outcome {
            AttemptOutcome::Sent => {
                sqlx::query_as(
                    r#"
                    UPDATE notifications
                    SET status = 'sent', sent_at = NOW(), last_error = NULL, updated_at = NOW(),
                        next_attempt_at = NULL
                    WHERE id = $1 AND status = 'sending'
                    RETURNING *
                    "#,
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
            _ => {
                sqlx::query_as(
                    r#"
                    UPDATE notifications
                    SET status = $2,
                        last_error = $3,
                        updated_at = NOW(),
                        next_attempt_at = NOW() + $4 * INTERVAL '1 millisecond'
                    WHERE id = $1 AND status = 'sending'
                    RETURNING *
                    "#,
                )
                .bind(id)
                .bind(outcome.target_status().to_string())
                .bind(outcome.error())
                .bind(outcome.retry_delay().map(millis))
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(row)
    }

    async fn mark_delivered(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        let row = sqlx::query_as(
            r#"
            UPDATE notifications
            SET status = 'delivered', delivered_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'sent'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn cancel(&self, id: Uuid, reason: &str) -> Result<Option<Notification>, AppError> {
        let row = sqlx::query_as(
            r#"
            UPDATE notifications
            SET status = 'failed', last_error = $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('queued', 'sending')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn acknowledge(&self, id: Uuid, actor: &str) -> Result<Option<Notification>, AppError> {
        let row = sqlx::query_as(
            r#"
            UPDATE notifications
            SET acknowledged_by = $2, acknowledged_at = NOW()
            WHERE id = $1 AND acknowledged_by IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(actor)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn add_reader(&self, id: Uuid, actor: &str) -> Result<Option<Notification>, AppError> {
        let row = sqlx::query_as(
            r#"
            UPDATE notifications
            SET read_by = CASE
                WHEN $2 = ANY(read_by) THEN read_by
                ELSE array_append(read_by, $2)
            END
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(actor)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_by_status(
        &self,
        status: NotificationStatus,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        let rows = sqlx::query_as(
            "SELECT * FROM notifications WHERE status = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(status.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_stale(
        &self,
        status: NotificationStatus,
        changed_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        let rows = sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE status = $1 AND GREATEST(updated_at, next_attempt_at) < $2
            ORDER BY GREATEST(updated_at, next_attempt_at) ASC
            LIMIT $3
            "#,
        )
        .bind(status.to_string())
        .bind(changed_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Upper bound on a scheduled delay, well inside Postgres' interval range.
const MAX_DELAY_MS: i64 = 365 * 24 * 60 * 60 * 1000;

/// Whole milliseconds for interval arithmetic in SQL.
fn millis(delay: Duration) -> i64 {
    i64::try_from(delay.as_millis()).map_or(MAX_DELAY_MS, |ms| ms.min(MAX_DELAY_MS))
}
