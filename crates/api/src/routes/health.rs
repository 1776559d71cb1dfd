//! Health check endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use herald_common::error::AppError;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// Reports 503 when the ledger or the queue backend is unreachable.
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let ledger = state.pipeline.ledger.ping().await;
    let queue = state.pipeline.queue.ping().await;
    let healthy = ledger.is_ok() && queue.is_ok();

    let describe = |result: &Result<(), AppError>| match result {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {}", e),
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "service": "herald-api",
            "version": env!("CARGO_PKG_VERSION"),
            "ledger": describe(&ledger),
            "queue": describe(&queue),
        })),
    )
}
