//! Ingress adapter: turns an `InsightEvent` into exactly one notification.
//!
//! Upstream delivery is at-least-once, so ingestion is idempotent on the
//! dedup key: a repeat event returns the existing notification and queues
//! nothing. A fresh notification is created `pending`, enqueued, then marked
//! `queued`. If the enqueue fails the row stays `pending` and the recovery
//! sweep picks it up.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    DedupKey, InsightEvent, NewNotification, NotificationStatus, QueueEntry,
};

use crate::ledger::DeliveryLedger;
use crate::queue::WorkQueue;
use crate::routing::ChannelRouter;

#[derive(Debug, Error)]
pub enum IngestError {
    /// The event cannot be turned into a notification. Not retried.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error(transparent)]
    Storage(#[from] AppError),
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::InvalidEvent(msg) => AppError::Validation(msg),
            IngestError::Storage(e) => e,
        }
    }
}

/// Result of an `ingest` call.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    pub notification_id: Uuid,
    pub status: NotificationStatus,
    /// `false` when the event was a duplicate of an existing notification.
    pub created: bool,
}

pub struct IngressAdapter {
    ledger: Arc<dyn DeliveryLedger>,
    queue: Arc<dyn WorkQueue>,
    router: ChannelRouter,
}

impl IngressAdapter {
    pub fn new(
        ledger: Arc<dyn DeliveryLedger>,
        queue: Arc<dyn WorkQueue>,
        router: ChannelRouter,
    ) -> Self {
        Self {
            ledger,
            queue,
            router,
        }
    }

    pub async fn ingest(&self, event: InsightEvent) -> Result<IngestReceipt, IngestError> {
        let new = self.validate(event)?;
        let priority = new.priority;
        let key = new.key.clone();

        let (row, created) = self.ledger.create_or_get(new).await?;
        if !created {
            tracing::debug!(
                notification_id = %row.id,
                dedup_key = %key,
                status = %row.status,
                "Duplicate insight ignored"
            );
            return Ok(IngestReceipt {
                notification_id: row.id,
                status: row.status,
                created: false,
            });
        }

        if let Err(e) = self.queue.enqueue(&QueueEntry::new(row.id, priority)).await {
            tracing::warn!(
                notification_id = %row.id,
                error = %e,
                "Enqueue failed; notification left pending for recovery"
            );
            return Ok(IngestReceipt {
                notification_id: row.id,
                status: NotificationStatus::Pending,
                created: true,
            });
        }

        // A fast worker may already have claimed the row straight from
        // `pending`; report whatever state it is in now.
        let status = match self
            .ledger
            .mark_queued(row.id, NotificationStatus::Pending, None)
            .await?
        {
            Some(queued) => queued.status,
            None => self
                .ledger
                .get(row.id)
                .await?
                .map(|current| current.status)
                .unwrap_or(NotificationStatus::Queued),
        };

        tracing::info!(
            notification_id = %row.id,
            dedup_key = %key,
            %priority,
            "Notification created"
        );

        Ok(IngestReceipt {
            notification_id: row.id,
            status,
            created: true,
        })
    }

    fn validate(&self, event: InsightEvent) -> Result<NewNotification, IngestError> {
        let insight_id = event.insight_id.trim();
        if insight_id.is_empty() {
            return Err(IngestError::InvalidEvent("insight_id is required".into()));
        }
        if event.rendered_payload.is_null() {
            return Err(IngestError::InvalidEvent(
                "rendered_payload is required".into(),
            ));
        }

        let priority = self.router.resolve_priority(&event);
        let channel_target = self.router.resolve_channel(&event, priority).ok_or_else(|| {
            IngestError::InvalidEvent("channel_target is required and no route matched".into())
        })?;

        Ok(NewNotification {
            key: DedupKey {
                insight_id: insight_id.to_string(),
                channel_target,
            },
            priority,
            insight_type: event.insight_type,
            payload: event.rendered_payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use herald_common::config::RoutingConfig;
    use herald_common::types::{InsightType, Priority};

    use crate::ledger::MemoryLedger;
    use crate::queue::{MemoryQueue, QueueDepth};

    use super::*;

    fn adapter() -> (IngressAdapter, Arc<MemoryLedger>, Arc<MemoryQueue>) {
        let ledger = Arc::new(MemoryLedger::new());
        let queue = Arc::new(MemoryQueue::new(4));
        let adapter = IngressAdapter::new(
            ledger.clone(),
            queue.clone(),
            ChannelRouter::new(RoutingConfig::default()),
        );
        (adapter, ledger, queue)
    }

    fn event(insight_id: &str, channel: &str) -> InsightEvent {
        InsightEvent {
            insight_id: insight_id.to_string(),
            priority: Some(Priority::High),
            insight_type: None,
            channel_target: Some(channel.to_string()),
            rendered_payload: serde_json::json!({"text": "FDA approval"}),
        }
    }

    #[tokio::test]
    async fn test_ingest_queues_new_notification() {
        let (adapter, ledger, queue) = adapter();

        let receipt = adapter.ingest(event("I1", "ops")).await.unwrap();
        assert!(receipt.created);
        assert_eq!(receipt.status, NotificationStatus::Queued);

        let row = ledger.get(receipt.notification_id).await.unwrap().unwrap();
        assert_eq!(row.status, NotificationStatus::Queued);
        assert_eq!(row.priority, Priority::High);

        let entry = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(entry.notification_id, receipt.notification_id);
        assert_eq!(entry.priority, Priority::High);
    }

    #[tokio::test]
    async fn test_duplicate_ingest_returns_same_id_without_new_work() {
        let (adapter, _ledger, queue) = adapter();

        let first = adapter.ingest(event("I1", "ops")).await.unwrap();
        let second = adapter.ingest(event("I1", "ops")).await.unwrap();

        assert_eq!(first.notification_id, second.notification_id);
        assert!(!second.created);
        assert_eq!(queue.depth().await.unwrap().high, 1);

        // Same insight on another channel is a separate obligation.
        let other = adapter.ingest(event("I1", "sales")).await.unwrap();
        assert_ne!(other.notification_id, first.notification_id);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_ingest() {
        let (adapter, _ledger, queue) = adapter();
        let adapter = Arc::new(adapter);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let adapter = adapter.clone();
            handles.push(tokio::spawn(async move {
                adapter.ingest(event("I7", "ops")).await.unwrap()
            }));
        }

        let mut ids = Vec::new();
        let mut created = 0;
        for h in handles {
            let receipt = h.await.unwrap();
            ids.push(receipt.notification_id);
            if receipt.created {
                created += 1;
            }
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(created, 1);
        assert_eq!(queue.depth().await.unwrap().high, 1);
    }

    #[tokio::test]
    async fn test_invalid_events_rejected() {
        let (adapter, _ledger, _queue) = adapter();

        let mut missing_id = event("", "ops");
        missing_id.insight_id = "   ".to_string();
        assert!(matches!(
            adapter.ingest(missing_id).await,
            Err(IngestError::InvalidEvent(_))
        ));

        let mut missing_payload = event("I2", "ops");
        missing_payload.rendered_payload = serde_json::Value::Null;
        assert!(matches!(
            adapter.ingest(missing_payload).await,
            Err(IngestError::InvalidEvent(_))
        ));
    }

    #[tokio::test]
    async fn test_routes_event_without_channel() {
        let (adapter, ledger, _queue) = adapter();
        let e = InsightEvent {
            insight_id: "I3".to_string(),
            priority: None,
            insight_type: Some(InsightType::RegulatoryApproval),
            channel_target: None,
            rendered_payload: serde_json::json!({"text": "approved"}),
        };

        let receipt = adapter.ingest(e).await.unwrap();
        let row = ledger.get(receipt.notification_id).await.unwrap().unwrap();
        assert_eq!(row.channel_target, "#regulatory-alerts");
        assert_eq!(row.priority, Priority::High);
    }

    struct BrokenQueue;

    #[async_trait]
    impl WorkQueue for BrokenQueue {
        async fn enqueue(&self, _entry: &QueueEntry) -> Result<(), AppError> {
            Err(AppError::Internal("queue down".into()))
        }
        async fn enqueue_delayed(
            &self,
            _entry: &QueueEntry,
            _delay: Duration,
        ) -> Result<(), AppError> {
            Err(AppError::Internal("queue down".into()))
        }
        async fn dequeue(&self) -> Result<Option<QueueEntry>, AppError> {
            Ok(None)
        }
        async fn depth(&self) -> Result<QueueDepth, AppError> {
            Ok(QueueDepth::default())
        }
        async fn ping(&self) -> Result<(), AppError> {
            Err(AppError::Internal("queue down".into()))
        }
    }

    #[tokio::test]
    async fn test_enqueue_failure_leaves_row_pending() {
        let ledger = Arc::new(MemoryLedger::new());
        let adapter = IngressAdapter::new(
            ledger.clone(),
            Arc::new(BrokenQueue),
            ChannelRouter::new(RoutingConfig::default()),
        );

        let receipt = adapter.ingest(event("I4", "ops")).await.unwrap();
        assert_eq!(receipt.status, NotificationStatus::Pending);
        let row = ledger.get(receipt.notification_id).await.unwrap().unwrap();
        assert_eq!(row.status, NotificationStatus::Pending);
    }
}
