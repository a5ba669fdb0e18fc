use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::error::Result;
use crate::worker::WorkerStatus;
use crate::AppState;

pub async fn get_config(State(state): State<AppState>) -> Result<Json<WorkerStatus>> {
    Ok(Json(state.workers.status().await))
}

#[derive(Deserialize)]
pub struct SetConcurrencyRequest {
    concurrency: usize,
}

pub async fn set_config(
    State(state): State<AppState>,
    Json(body): Json<SetConcurrencyRequest>,
) -> Result<Json<WorkerStatus>> {
    state.workers.set_concurrency(body.concurrency);
    Ok(Json(state.workers.status().await))
}
