//! Queue depth for operators.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use herald_common::error::AppError;
use herald_engine::queue::QueueDepth;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/queue", get(queue_depth))
}

/// GET /api/queue: Entries waiting per lane.
async fn queue_depth(State(state): State<AppState>) -> Result<Json<QueueDepth>, AppError> {
    Ok(Json(state.pipeline.queue.depth().await?))
}
