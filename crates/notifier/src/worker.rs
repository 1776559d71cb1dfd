//! Delivery workers.
//!
//! Each worker loops: dequeue, check the row is still dispatchable, take a
//! rate-limit token, claim the row (`begin_attempt`), send, record the
//! outcome. Retries are re-enqueued with a delay rather than slept on, so a
//! worker is only ever blocked on the channel call itself.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use herald_common::config::AppConfig;
use herald_common::error::AppError;
use herald_common::types::QueueEntry;
use herald_engine::Pipeline;
use herald_engine::ledger::AttemptOutcome;

use crate::channel::{ChannelClient, DeliveryResult};
use crate::retry::RetryPolicy;

/// What a worker did with one queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Sent,
    RetryScheduled { delay_ms: u64 },
    Failed,
    DeadLettered,
    /// Local rate limiter said no; re-enqueued without using an attempt.
    Throttled,
    /// Row gone, cancelled, already terminal or claimed by another worker.
    Skipped,
}

pub struct DeliveryWorker {
    id: usize,
    pipeline: Pipeline,
    client: Arc<dyn ChannelClient>,
    policy: RetryPolicy,
    send_timeout: Duration,
    idle_poll: Duration,
}

impl DeliveryWorker {
    pub fn new(
        id: usize,
        pipeline: Pipeline,
        client: Arc<dyn ChannelClient>,
        config: &AppConfig,
    ) -> Self {
        Self {
            id,
            pipeline,
            client,
            policy: RetryPolicy::new(config.retry.clone()),
            send_timeout: config.worker.send_timeout(),
            idle_poll: config.worker.idle_poll(),
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = self.id, "Delivery worker started");

        while !*shutdown.borrow() {
            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    tracing::error!(worker = self.id, error = %e, "Delivery worker iteration failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.idle_poll) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!(worker = self.id, "Delivery worker stopped");
    }

    /// Process at most one entry. `None` when the queue had nothing ready.
    pub async fn run_once(&self) -> Result<Option<DispatchOutcome>, AppError> {
        let Some(entry) = self.pipeline.queue.dequeue().await? else {
            return Ok(None);
        };
        self.dispatch(entry).await.map(Some)
    }

    pub async fn dispatch(&self, entry: QueueEntry) -> Result<DispatchOutcome, AppError> {
        let id = entry.notification_id;
        let ledger = &self.pipeline.ledger;

        let Some(row) = ledger.get(id).await? else {
            tracing::warn!(notification_id = %id, "Queue entry for unknown notification dropped");
            return Ok(DispatchOutcome::Skipped);
        };
        if !row.status.is_dispatchable() {
            tracing::debug!(notification_id = %id, status = %row.status, "Skipping non-dispatchable entry");
            return Ok(DispatchOutcome::Skipped);
        }

        let granted = match self
            .pipeline
            .limiter
            .try_acquire(&row.channel_target, row.priority)
            .await
        {
            Ok(granted) => granted,
            Err(e) => {
                tracing::warn!(notification_id = %id, error = %e, "Rate limiter unavailable; deferring send");
                false
            }
        };
        if !granted {
            let delay = self.policy.throttle_delay();
            // Due time goes on the row before the delayed entry exists.
            if ledger.defer(id, delay).await?.is_none() {
                return Ok(DispatchOutcome::Skipped);
            }
            self.pipeline
                .queue
                .enqueue_delayed(&entry.requeued(), delay)
                .await?;
            tracing::debug!(
                notification_id = %id,
                channel = %row.channel_target,
                delay_ms = delay.as_millis() as u64,
                "Send throttled"
            );
            return Ok(DispatchOutcome::Throttled);
        }

        let Some(claimed) = ledger.begin_attempt(id).await? else {
            return Ok(DispatchOutcome::Skipped);
        };
        let attempt = claimed.attempts.max(0) as u32;

        let result = match tokio::time::timeout(
            self.send_timeout,
            self.client.send(&claimed.channel_target, &claimed.payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => DeliveryResult::TransientError(format!(
                "send timed out after {}ms",
                self.send_timeout.as_millis()
            )),
        };

        let outcome = match result {
            DeliveryResult::Success => AttemptOutcome::Sent,
            DeliveryResult::PermanentError(error) => AttemptOutcome::Failed { error },
            DeliveryResult::TransientError(error) => self.after_transient(attempt, error, None),
            DeliveryResult::RateLimited { retry_after } => {
                self.after_transient(attempt, "rate limited by channel".to_string(), retry_after)
            }
        };

        if ledger.complete_attempt(id, &outcome).await?.is_none() {
            // Cancelled or swept while the send was in flight.
            tracing::info!(notification_id = %id, attempt, "Attempt finished after row left sending");
            return Ok(DispatchOutcome::Skipped);
        }

        let dispatched = match &outcome {
            AttemptOutcome::Sent => {
                tracing::info!(
                    notification_id = %id,
                    channel = %claimed.channel_target,
                    attempt,
                    "Notification sent"
                );
                DispatchOutcome::Sent
            }
            AttemptOutcome::Retry { error, delay } => {
                let delay = *delay;
                self.pipeline
                    .queue
                    .enqueue_delayed(&entry.requeued(), delay)
                    .await?;
                tracing::warn!(
                    notification_id = %id,
                    channel = %claimed.channel_target,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Delivery failed; retry scheduled"
                );
                DispatchOutcome::RetryScheduled {
                    delay_ms: delay.as_millis() as u64,
                }
            }
            AttemptOutcome::Failed { error } => {
                tracing::error!(
                    notification_id = %id,
                    channel = %claimed.channel_target,
                    attempt,
                    error = %error,
                    "Delivery failed permanently"
                );
                DispatchOutcome::Failed
            }
            AttemptOutcome::DeadLettered { error } => {
                tracing::error!(
                    notification_id = %id,
                    channel = %claimed.channel_target,
                    attempt,
                    error = %error,
                    "Notification dead-lettered"
                );
                DispatchOutcome::DeadLettered
            }
        };

        Ok(dispatched)
    }

    fn after_transient(
        &self,
        attempt: u32,
        error: String,
        retry_after: Option<Duration>,
    ) -> AttemptOutcome {
        if self.policy.is_exhausted(attempt) {
            return AttemptOutcome::DeadLettered { error };
        }
        let mut delay = self.policy.backoff(attempt);
        if let Some(floor) = retry_after {
            delay = delay.max(floor);
        }
        AttemptOutcome::Retry { error, delay }
    }
}

/// A fixed set of workers sharing one shutdown signal.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        pipeline: &Pipeline,
        client: Arc<dyn ChannelClient>,
        config: &AppConfig,
        shutdown: &watch::Receiver<bool>,
    ) -> Self {
        let size = config.worker.pool_size.max(1);
        let handles = (0..size)
            .map(|id| {
                let worker = DeliveryWorker::new(id, pipeline.clone(), client.clone(), config);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(shutdown).await })
            })
            .collect();

        tracing::info!(workers = size, "Delivery worker pool started");
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit after shutdown was signalled.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Delivery worker panicked");
            }
        }
    }
}
