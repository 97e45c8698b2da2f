use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use crate::state::{AppState, StatusSnapshot};

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /api/status: sources, incidents in flight and running totals.
pub async fn get_status(State(app): State<AppState>) -> Json<StatusSnapshot> {
    Json(app.status.snapshot())
}

/// POST /api/stop: request a graceful shutdown. Source loops stop polling
/// and in-flight remediations finish their current step.
pub async fn stop(State(app): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    tracing::info!("shutdown requested over HTTP");
    app.request_shutdown();
    (StatusCode::ACCEPTED, Json(json!({ "stopping": true })))
}
