pub mod download;
pub mod health;
pub mod jobs;
pub mod queue;
pub mod upload;
pub mod ws;

use axum::routing::{delete, get, post, put};
use axum::Router;

use crate::AppState;

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/upload", post(upload::upload))
        .route("/api/jobs", get(jobs::list))
        .route("/api/jobs/counts", get(jobs::counts))
        .route("/api/jobs/:id", get(jobs::get_one))
        .route("/api/jobs/:id", delete(jobs::delete_one))
        .route("/api/jobs/:id/retry", post(jobs::retry))
        .route("/api/download/zip/archive", get(download::download_zip))
        .route("/api/download/:id", get(download::download_compressed))
        .route("/api/download/:id/original", get(download::download_original))
        .route("/api/queue/config", get(queue::get_config))
        .route("/api/queue/config", put(queue::set_config))
        .route("/ws", get(ws::upgrade))
}
