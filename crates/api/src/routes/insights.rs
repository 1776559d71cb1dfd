//! Insight ingress.

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};

use herald_common::error::AppError;
use herald_common::types::InsightEvent;
use herald_engine::ingress::{IngestError, IngestReceipt};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/insights", post(ingest_insight))
}

/// POST /api/insights: Accept an insight for delivery.
///
/// 202 when new work was queued, 200 when the insight was already known.
/// A body that does not decode as an insight (unknown priority or type,
/// wrong field types, malformed JSON) is an invalid event like any other.
async fn ingest_insight(
    State(state): State<AppState>,
    payload: Result<Json<InsightEvent>, JsonRejection>,
) -> Result<(StatusCode, Json<IngestReceipt>), AppError> {
    let Json(event) =
        payload.map_err(|rejection| IngestError::InvalidEvent(rejection.body_text()))?;

    let receipt = state.ingress.ingest(event).await?;
    let status = if receipt.created {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(receipt)))
}
