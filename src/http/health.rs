//! Liveness only: process is up and the database is reachable. No deep
//! dependency checks — this is a container orchestrator's restart signal,
//! not a dashboard.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::AppState;

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.repo.sample_count().await.is_ok();
    let status = if db_ok { "ok" } else { "degraded" };

    Json(json!({
        "status": status,
        "service": "gifsqueeze",
    }))
}
