use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::HealthThresholds;
use crate::metrics::encode_metrics;
use crate::stats::{HealthStatus, PipelineStats, StatsSnapshot};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub reasons: Vec<String>,
}

/// Shared state for health endpoints
#[derive(Clone)]
pub struct ServerState {
    pub stats: Arc<PipelineStats>,
    pub thresholds: HealthThresholds,
}

impl ServerState {
    pub fn new(stats: Arc<PipelineStats>, thresholds: HealthThresholds) -> Self {
        Self { stats, thresholds }
    }
}

/// Liveness - always 200 while the process serves requests
async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    let report = state.stats.health(&state.thresholds);
    Json(HealthResponse {
        status: report.status,
        reasons: report.reasons,
    })
}

/// Readiness - 503 while the pipeline is unhealthy
async fn ready(State(state): State<ServerState>) -> (StatusCode, Json<HealthResponse>) {
    let report = state.stats.health(&state.thresholds);
    let status_code = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status_code,
        Json(HealthResponse {
            status: report.status,
            reasons: report.reasons,
        }),
    )
}

async fn stats(State(state): State<ServerState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot(&state.thresholds))
}

async fn metrics() -> impl IntoResponse {
    match encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            format!("failed to encode metrics: {}", e),
        ),
    }
}

pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve until the shutdown flag flips
pub async fn run_server(
    addr: SocketAddr,
    state: ServerState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = create_router(state);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Health server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}
