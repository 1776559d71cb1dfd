//! Interaction callback (acknowledge / read).

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::InteractionAction;
use herald_engine::interaction::InteractionState;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/interactions", post(record_interaction))
}

#[derive(Debug, Deserialize)]
pub struct InteractionRequest {
    pub notification_id: Uuid,
    pub actor: String,
    pub action: InteractionAction,
}

/// POST /api/interactions: Record an acknowledge or read from a user.
async fn record_interaction(
    State(state): State<AppState>,
    Json(request): Json<InteractionRequest>,
) -> Result<Json<InteractionState>, AppError> {
    let updated = state
        .interactions
        .handle(request.notification_id, &request.actor, request.action)
        .await?;
    Ok(Json(updated))
}
