//! Metrics HTTP server for Smart Compressor
//!
//! Read-only JSON view of the job table and host load at `GET /metrics`.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;
use tracing::info;

use crate::metrics::{collect_system_metrics, MetricsSnapshot, SharedMetrics};

/// Errors that can occur when running the metrics server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /metrics endpoint
///
/// Job data comes from the shared snapshot; system load is sampled per request.
async fn get_metrics(State(metrics): State<SharedMetrics>) -> Json<MetricsSnapshot> {
    let mut snapshot = metrics.read().await.clone();
    if let Ok(system) = tokio::task::spawn_blocking(collect_system_metrics).await {
        snapshot.system = system;
    }
    Json(snapshot)
}

/// Creates the axum Router with metrics endpoint
pub fn create_metrics_router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .with_state(metrics)
}

/// Parse the configured bind address, e.g. `127.0.0.1:7878`.
pub fn parse_bind_address(bind: &str) -> Result<SocketAddr, ServerError> {
    bind.trim()
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))
}

/// Runs the metrics HTTP server until the process exits
///
/// # Arguments
/// * `metrics` - Shared metrics state to serve
/// * `bind` - Listen address from configuration
pub async fn run_metrics_server(metrics: SharedMetrics, bind: &str) -> Result<(), ServerError> {
    let addr = parse_bind_address(bind)?;
    let app = create_metrics_router(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "metrics endpoint listening");
    axum::serve(listener, app).await?;

    Ok(())
}
