//! Inbound acknowledge/read callbacks on delivered messages.
//!
//! Both operations are single conditional writes in the ledger. Losing an
//! acknowledge race is not an error: the caller gets the winner back with
//! `AlreadyAcknowledged`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{InteractionAction, Notification};

use crate::ledger::DeliveryLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionOutcome {
    Acknowledged,
    AlreadyAcknowledged,
    Read,
}

/// Acknowledgement and read state after an interaction.
#[derive(Debug, Clone, Serialize)]
pub struct InteractionState {
    pub notification_id: Uuid,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub read_by: Vec<String>,
    pub outcome: InteractionOutcome,
}

impl InteractionState {
    fn from_row(row: Notification, outcome: InteractionOutcome) -> Self {
        Self {
            notification_id: row.id,
            acknowledged_by: row.acknowledged_by,
            acknowledged_at: row.acknowledged_at,
            read_by: row.read_by,
            outcome,
        }
    }
}

pub struct InteractionProcessor {
    ledger: Arc<dyn DeliveryLedger>,
}

impl InteractionProcessor {
    pub fn new(ledger: Arc<dyn DeliveryLedger>) -> Self {
        Self { ledger }
    }

    pub async fn handle(
        &self,
        notification_id: Uuid,
        actor: &str,
        action: InteractionAction,
    ) -> Result<InteractionState, AppError> {
        match action {
            InteractionAction::Acknowledge => self.acknowledge(notification_id, actor).await,
            InteractionAction::Read => self.mark_read(notification_id, actor).await,
        }
    }

    pub async fn acknowledge(
        &self,
        notification_id: Uuid,
        actor: &str,
    ) -> Result<InteractionState, AppError> {
        let actor = validate_actor(actor)?;

        if let Some(row) = self.ledger.acknowledge(notification_id, actor).await? {
            tracing::info!(notification_id = %notification_id, actor, "Notification acknowledged");
            return Ok(InteractionState::from_row(
                row,
                InteractionOutcome::Acknowledged,
            ));
        }

        let row = self
            .ledger
            .get(notification_id)
            .await?
            .ok_or_else(|| not_found(notification_id))?;
        tracing::debug!(
            notification_id = %notification_id,
            actor,
            acknowledged_by = row.acknowledged_by.as_deref().unwrap_or_default(),
            "Notification already acknowledged"
        );
        Ok(InteractionState::from_row(
            row,
            InteractionOutcome::AlreadyAcknowledged,
        ))
    }

    pub async fn mark_read(
        &self,
        notification_id: Uuid,
        actor: &str,
    ) -> Result<InteractionState, AppError> {
        let actor = validate_actor(actor)?;

        let row = self
            .ledger
            .add_reader(notification_id, actor)
            .await?
            .ok_or_else(|| not_found(notification_id))?;
        Ok(InteractionState::from_row(row, InteractionOutcome::Read))
    }
}

fn validate_actor(actor: &str) -> Result<&str, AppError> {
    let actor = actor.trim();
    if actor.is_empty() {
        return Err(AppError::Validation("actor is required".into()));
    }
    Ok(actor)
}

fn not_found(id: Uuid) -> AppError {
    AppError::NotFound(format!("notification {} not found", id))
}
