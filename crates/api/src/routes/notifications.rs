//! Operator routes: inspect, list, cancel and confirm notifications.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{DedupKey, Notification, NotificationStatus};
use herald_engine::ledger::CANCELLED_BY_OPERATOR;

use crate::state::AppState;

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", get(list_notifications))
        .route("/api/notifications/lookup", get(lookup_notification))
        .route("/api/notifications/{id}", get(get_notification))
        .route("/api/notifications/{id}/cancel", post(cancel_notification))
        .route("/api/notifications/{id}/delivered", post(confirm_delivery))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub status: NotificationStatus,
    pub limit: Option<i64>,
}

/// GET /api/notifications?status=&limit=: Newest notifications in a status.
async fn list_notifications(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Notification>>, AppError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let rows = state
        .pipeline
        .ledger
        .list_by_status(params.status, limit)
        .await?;
    Ok(Json(rows))
}

/// GET /api/notifications/lookup?insight_id=&channel_target=: By dedup key.
async fn lookup_notification(
    State(state): State<AppState>,
    Query(key): Query<DedupKey>,
) -> Result<Json<Notification>, AppError> {
    let row = state
        .pipeline
        .ledger
        .find_by_dedup_key(&key)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No notification for {}", key)))?;
    Ok(Json(row))
}

/// GET /api/notifications/:id: Full notification state.
async fn get_notification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Notification>, AppError> {
    Ok(Json(fetch(&state, id).await?))
}

/// POST /api/notifications/:id/cancel: Administrative cancel.
///
/// Only `queued` and `sending` notifications can be cancelled.
async fn cancel_notification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Notification>, AppError> {
    if let Some(row) = state
        .pipeline
        .ledger
        .cancel(id, CANCELLED_BY_OPERATOR)
        .await?
    {
        tracing::warn!(notification_id = %id, "Notification cancelled by operator");
        return Ok(Json(row));
    }

    let row = fetch(&state, id).await?;
    Err(AppError::Conflict(format!(
        "Notification {} is {} and cannot be cancelled",
        id, row.status
    )))
}

/// POST /api/notifications/:id/delivered: Channel delivery receipt.
async fn confirm_delivery(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Notification>, AppError> {
    if let Some(row) = state.pipeline.ledger.mark_delivered(id).await? {
        tracing::info!(notification_id = %id, "Delivery confirmed");
        return Ok(Json(row));
    }

    let row = fetch(&state, id).await?;
    Err(AppError::Conflict(format!(
        "Notification {} is {}; only sent notifications can be confirmed",
        id, row.status
    )))
}

async fn fetch(state: &AppState, id: Uuid) -> Result<Notification, AppError> {
    state
        .pipeline
        .ledger
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))
}
