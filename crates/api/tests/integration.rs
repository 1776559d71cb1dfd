//! Integration tests for API routes.
//!
//! Uses `tower::ServiceExt` to test Axum routes without a real HTTP server,
//! over the in-memory ledger and queue, so no external services are needed.
//!
//! ```bash
//! cargo test -p herald-api --test integration
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;
use uuid::Uuid;

use herald_api::routes::create_router;
use herald_api::state::AppState;
use herald_common::config::AppConfig;
use herald_engine::Pipeline;
use herald_notifier::{ChannelClient, DeliveryResult, DeliveryWorker, DispatchOutcome};

// ============================================================
// Helpers
// ============================================================

fn build_test_state() -> AppState {
    let config = AppConfig::default();
    AppState::new(Pipeline::in_memory(&config), config)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn insight(insight_id: &str) -> serde_json::Value {
    serde_json::json!({
        "insight_id": insight_id,
        "priority": "high",
        "channel_target": "ops",
        "rendered_payload": {"text": "Regulatory approval granted"}
    })
}

async fn ingest(app: &Router, insight_id: &str) -> Uuid {
    let (status, json) = send(app, post_json("/api/insights", insight(insight_id))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    json["notification_id"].as_str().unwrap().parse().unwrap()
}

struct AlwaysOk;

#[async_trait]
impl ChannelClient for AlwaysOk {
    async fn send(&self, _channel_target: &str, _payload: &serde_json::Value) -> DeliveryResult {
        DeliveryResult::Success
    }
}

// ============================================================
// Health and ingress
// ============================================================

#[tokio::test]
async fn test_health_endpoint() {
    let app = create_router(build_test_state());

    let (status, json) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "herald-api");
    assert_eq!(json["ledger"], "ok");
}

#[tokio::test]
async fn test_ingest_then_duplicate() {
    let app = create_router(build_test_state());

    let (status, first) = send(&app, post_json("/api/insights", insight("I1"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["status"], "queued");
    assert_eq!(first["created"], true);

    let (status, second) = send(&app, post_json("/api/insights", insight("I1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["created"], false);
    assert_eq!(second["notification_id"], first["notification_id"]);

    let (status, depth) = send(&app, get("/api/queue")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(depth["high"], 1);
    assert_eq!(depth["normal"], 0);
}

#[tokio::test]
async fn test_ingest_invalid_event() {
    let app = create_router(build_test_state());

    let (status, json) = send(
        &app,
        post_json(
            "/api/insights",
            serde_json::json!({"channel_target": "ops", "rendered_payload": {"text": "x"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("insight_id"));

    let (status, _) = send(
        &app,
        post_json("/api/insights", serde_json::json!({"insight_id": "I2"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_ingest_undecodable_fields_are_invalid_events() {
    let app = create_router(build_test_state());

    let bodies = [
        serde_json::json!({"insight_id": "I1", "priority": "urgent", "channel_target": "ops", "rendered_payload": {"text": "x"}}),
        serde_json::json!({"insight_id": "I1", "insight_type": "earnings", "rendered_payload": {"text": "x"}}),
        serde_json::json!({"insight_id": 42, "channel_target": "ops", "rendered_payload": {"text": "x"}}),
    ];
    for body in bodies {
        let (status, json) = send(&app, post_json("/api/insights", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].is_string());
    }

    let malformed = Request::builder()
        .method("POST")
        .uri("/api/insights")
        .header("content-type", "application/json")
        .body(Body::from("{\"insight_id\": "))
        .unwrap();
    let (status, json) = send(&app, malformed).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].is_string());

    // Nothing was created along the way.
    let (_, depth) = send(&app, get("/api/queue")).await;
    assert_eq!(depth["high"], 0);
    assert_eq!(depth["normal"], 0);
}

#[tokio::test]
async fn test_ingest_routes_by_insight_type() {
    let app = create_router(build_test_state());

    let (status, receipt) = send(
        &app,
        post_json(
            "/api/insights",
            serde_json::json!({
                "insight_id": "I3",
                "insight_type": "funding_round",
                "rendered_payload": {"text": "Series B"}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let id = receipt["notification_id"].as_str().unwrap();
    let (status, row) = send(&app, get(&format!("/api/notifications/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(row["channel_target"], "#funding-news");
    assert_eq!(row["priority"], "normal");
}

// ============================================================
// Interactions
// ============================================================

#[tokio::test]
async fn test_acknowledge_first_writer_wins_and_read_set() {
    let app = create_router(build_test_state());
    let id = ingest(&app, "I1").await;

    let (status, first) = send(
        &app,
        post_json(
            "/api/interactions",
            serde_json::json!({"notification_id": id, "actor": "alice", "action": "acknowledge"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["outcome"], "acknowledged");
    assert_eq!(first["acknowledged_by"], "alice");

    let (status, second) = send(
        &app,
        post_json(
            "/api/interactions",
            serde_json::json!({"notification_id": id, "actor": "bob", "action": "acknowledge"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["outcome"], "already_acknowledged");
    assert_eq!(second["acknowledged_by"], "alice");

    for actor in ["carol", "dave", "carol"] {
        let (status, _) = send(
            &app,
            post_json(
                "/api/interactions",
                serde_json::json!({"notification_id": id, "actor": actor, "action": "read"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (_, row) = send(&app, get(&format!("/api/notifications/{}", id))).await;
    assert_eq!(row["read_by"], serde_json::json!(["carol", "dave"]));
}

#[tokio::test]
async fn test_interaction_unknown_notification() {
    let app = create_router(build_test_state());

    let (status, _) = send(
        &app,
        post_json(
            "/api/interactions",
            serde_json::json!({"notification_id": Uuid::new_v4(), "actor": "alice", "action": "read"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================
// Operator routes
// ============================================================

#[tokio::test]
async fn test_lookup_by_dedup_key() {
    let app = create_router(build_test_state());
    let id = ingest(&app, "I1").await;

    let (status, row) = send(
        &app,
        get("/api/notifications/lookup?insight_id=I1&channel_target=ops"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(row["id"], id.to_string());
    assert_eq!(row["status"], "queued");
    assert_eq!(row["attempts"], 0);

    let (status, _) = send(
        &app,
        get("/api/notifications/lookup?insight_id=I1&channel_target=sales"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_then_conflict() {
    let app = create_router(build_test_state());
    let id = ingest(&app, "I1").await;

    let (status, row) = send(&app, post_empty(&format!("/api/notifications/{}/cancel", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(row["status"], "failed");
    assert_eq!(row["last_error"], "cancelled by operator");

    let (status, _) = send(&app, post_empty(&format!("/api/notifications/{}/cancel", id))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, listed) = send(&app, get("/api/notifications?status=failed&limit=10")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, _) = send(
        &app,
        post_empty(&format!("/api/notifications/{}/cancel", Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delivery_receipt_after_send() {
    let state = build_test_state();
    let app = create_router(state.clone());
    let id = ingest(&app, "I1").await;

    // Not sent yet.
    let (status, _) = send(&app, post_empty(&format!("/api/notifications/{}/delivered", id))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let worker = DeliveryWorker::new(0, state.pipeline.clone(), Arc::new(AlwaysOk), &state.config);
    assert_eq!(
        worker.run_once().await.unwrap(),
        Some(DispatchOutcome::Sent)
    );

    let (status, row) = send(&app, post_empty(&format!("/api/notifications/{}/delivered", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(row["status"], "delivered");
    assert_eq!(row["attempts"], 1);
    assert!(row["sent_at"].is_string());
    assert!(row["delivered_at"].is_string());
}

#[tokio::test]
async fn test_get_unknown_notification() {
    let app = create_router(build_test_state());
    let (status, json) = send(&app, get(&format!("/api/notifications/{}", Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].is_string());
}
