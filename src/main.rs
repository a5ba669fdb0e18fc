use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderValue, Method};
use gifsqueeze::artifact::ArtifactStore;
use gifsqueeze::db::JobRepository;
use gifsqueeze::eventbus::EventBus;
use gifsqueeze::executor::CompressionExecutor;
use gifsqueeze::http::create_router;
use gifsqueeze::middleware::{request_logging_middleware, security_headers_middleware};
use gifsqueeze::predictor::Predictor;
use gifsqueeze::reaper::Reaper;
use gifsqueeze::worker::WorkerPool;
use gifsqueeze::{AppState, Config};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    init_logging();

    info!("starting gifsqueeze");

    let config = Arc::new(Config::from_env().map_err(|e| format!("configuration error: {e}"))?);
    config.validate().map_err(|e| format!("configuration validation failed: {e}"))?;
    info!("configuration loaded and validated");

    let state = create_app_state(config.clone()).await?;
    info!("application state initialized");

    start_background_tasks(&state).await?;

    let middleware_stack = ServiceBuilder::new()
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(CompressionLayer::new())
        .layer(build_cors(&config))
        .layer(axum::middleware::from_fn(security_headers_middleware))
        .layer(axum::middleware::from_fn(request_logging_middleware));

    let app = create_router().layer(middleware_stack).with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, upload_dir = %config.upload_dir, output_dir = %config.output_dir, "listening");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("failed to bind {addr}: {e}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("server error: {e}"))?;

    info!("server stopped");
    Ok(())
}

fn init_logging() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "gifsqueeze=info,tower_http=info".to_string());

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| log_level.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

async fn create_app_state(config: Arc<Config>) -> std::result::Result<AppState, Box<dyn std::error::Error>> {
    let repo = Arc::new(
        JobRepository::connect(&config.database.path, config.database.max_connections, config.database.migrate_on_start)
            .await
            .map_err(|e| format!("database error: {e}"))?,
    );

    let artifacts = Arc::new(ArtifactStore::new(&config.upload_dir, &config.output_dir).await?);
    let executor = Arc::new(CompressionExecutor::new(config.worker.gifsicle_path.clone()));
    let predictor = Arc::new(Predictor::new(repo.clone()));
    let bus = Arc::new(EventBus::new());

    let workers = Arc::new(WorkerPool::new(
        repo.clone(),
        artifacts.clone(),
        executor.clone(),
        predictor.clone(),
        bus.clone(),
        config.worker.default_concurrency,
        config.worker.max_concurrency,
        config.retention(),
    ));

    Ok(AppState { config, repo, artifacts, executor, predictor, bus, workers })
}

async fn start_background_tasks(state: &AppState) -> std::result::Result<(), Box<dyn std::error::Error>> {
    info!("starting background tasks");

    let reaper = Arc::new(Reaper::new(
        state.repo.clone(),
        state.artifacts.clone(),
        state.bus.clone(),
        Duration::from_secs(state.config.reaper.interval_seconds),
    ));
    reaper.startup_sweep().await.map_err(|e| format!("reaper startup sweep failed: {e}"))?;
    reaper.spawn();

    info!("background tasks started");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

fn build_cors(config: &Config) -> CorsLayer {
    if config.allowed_origins.iter().any(|o| o == "*") {
        warn!("CORS configured to allow all origins");
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
            .allow_headers(Any)
    } else {
        let origins: std::result::Result<Vec<HeaderValue>, _> =
            config.allowed_origins.iter().map(|o| o.parse::<HeaderValue>()).collect();

        match origins {
            Ok(origins) => {
                let mut layer = CorsLayer::new()
                    .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
                    .allow_headers([header::CONTENT_TYPE]);
                for origin in origins {
                    layer = layer.allow_origin(AllowOrigin::exact(origin));
                }
                layer
            }
            Err(e) => {
                error!(error = %e, "invalid ALLOWED_ORIGINS entry, falling back to permissive CORS");
                CorsLayer::new().allow_origin(Any)
            }
        }
    }
}
