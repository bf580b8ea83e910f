//! HTTP server for the defectsim upload API.
//!
//! Features:
//! - Multipart upload endpoints for single and batch detection
//! - Per-IP rate limiting with LRU eviction past 10k tracked addresses
//! - JSONL access logging with size-based rotation (configurable via `max_access_log_bytes`)
//! - Graceful shutdown that abandons in-flight simulated delays
//! - Structured logging via [`tracing`]

pub mod handlers;
pub mod logging;
pub mod middleware;
pub mod types;

pub use logging::{RecordEvent, UsageMetrics, METRICS_PERSIST_INTERVAL_SECS};
pub use types::{
    BatchItem, BatchResponse, DetectResponse, DetectionData, HealthResponse, LabelsResponse,
    PreviewResponse, ServerConfig, StatsResponse, DEFAULT_UPLOAD_DIR,
};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use eyre::{Result, WrapErr};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::detect::Detector;
use crate::preview::PreviewStore;
use crate::random::{PolicySourceFactory, SourceFactory};

// ---------------------------------------------------------------------------
// Server state
// ---------------------------------------------------------------------------

pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub rate_limiters: middleware::RateLimiterCache,
    pub usage: UsageMetrics,
    /// Hands each request its own random source.
    pub sources: Arc<dyn SourceFactory>,
    pub detector: Detector,
    pub previews: PreviewStore,
    /// Flipped to `true` when the server starts shutting down.
    pub shutdown: watch::Sender<bool>,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        let factory = PolicySourceFactory::new(config.detector.seed_policy);
        Self::with_source_factory(config, Arc::new(factory))
    }

    /// Build state around a caller-supplied randomness factory.
    pub fn with_source_factory(config: ServerConfig, sources: Arc<dyn SourceFactory>) -> Self {
        let previews = PreviewStore::open(&config.upload_dir);
        let usage = UsageMetrics::new(
            &config.access_log_path,
            config.max_access_log_bytes,
            &config.upload_dir,
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            detector: Detector::new(config.detector.latency),
            config,
            start_time: Instant::now(),
            rate_limiters: middleware::new_rate_limiter_cache(),
            usage,
            sources,
            previews,
            shutdown,
        }
    }

    /// Signal in-flight detections to stop waiting.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

/// Assemble the router with every route and layer applied.
pub fn build_router(state: Arc<ServerState>) -> Router {
    // Allow any origin so the API can be called from browser tooling.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Multipart framing adds some overhead on top of the file itself.
    let body_limit = state.config.max_upload_bytes.saturating_add(64 * 1024);

    Router::new()
        .route("/", get(crate::ui::index_handler))
        .route("/api/health", get(handlers::health_handler))
        .route("/api/stats", get(handlers::stats_handler))
        .route("/api/labels", get(handlers::labels_handler))
        .route("/api/detect", post(handlers::detect_handler))
        .route("/api/batch/detect", post(handlers::batch_detect_handler))
        .route("/api/preview", post(handlers::preview_handler))
        .layer(cors)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "could not install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down gracefully"),
        _ = sigterm => info!("received SIGTERM, shutting down gracefully"),
    }
}

/// Run the HTTP server (blocking)
pub async fn run_server(config: ServerConfig) -> Result<()> {
    let rate_limit_rpm = config.rate_limit_rpm;
    let bind_addr = config.bind_addr;
    let access_log = config.access_log_path.clone();
    let state = Arc::new(ServerState::new(config));
    let app = build_router(state.clone());

    // Spawn background task to persist metrics to disk periodically
    let metrics_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            METRICS_PERSIST_INTERVAL_SECS,
        ));
        loop {
            interval.tick().await;
            metrics_state.usage.persist_to_disk();
        }
    });

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .wrap_err_with(|| format!("failed to bind {}", bind_addr))?;
    info!(bind = %bind_addr, "defectsim server listening");
    info!("Endpoints: GET / (UI), GET /api/health, GET /api/stats, GET /api/labels, POST /api/detect, POST /api/batch/detect, POST /api/preview");
    info!(
        min_latency = state.detector.latency().min_secs(),
        max_latency = state.detector.latency().max_secs(),
        seed_policy = %state.config.detector.seed_policy,
        "simulation mode: no image analysis is performed"
    );
    if rate_limit_rpm > 0 {
        info!(rate_limit_rpm, "rate limiting enabled");
    } else {
        info!("rate limiting disabled");
    }
    info!(access_log = %access_log);

    let shutdown_state = state;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        shutdown_state.begin_shutdown();
        // Persist metrics before exiting
        shutdown_state.usage.persist_to_disk();
    })
    .await?;
    Ok(())
}
