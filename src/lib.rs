pub mod artifact;
pub mod config;
pub mod db;
pub mod error;
pub mod eventbus;
pub mod executor;
pub mod http;
pub mod middleware;
pub mod models;
pub mod predictor;
pub mod reaper;
pub mod session;
pub mod worker;

pub use config::Config;
pub use error::{AppError, Result};

use std::sync::Arc;

use artifact::ArtifactStore;
use db::JobRepository;
use eventbus::EventBus;
use executor::CompressionExecutor;
use predictor::Predictor;
use worker::WorkerPool;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repo: Arc<JobRepository>,
    pub artifacts: Arc<ArtifactStore>,
    pub executor: Arc<CompressionExecutor>,
    pub predictor: Arc<Predictor>,
    pub bus: Arc<EventBus>,
    pub workers: Arc<WorkerPool>,
}
