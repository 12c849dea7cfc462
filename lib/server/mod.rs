pub mod monitoring;
use crate::state::AppState;
use prometheus_client::encoding::text::encode;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use monitoring::CRAWL_METRICS;
use std::net::SocketAddr;
use std::sync::Arc;

async fn health_handler() -> &'static str {
    "Healthy"
}

async fn expose_metrics(state: State<Arc<AppState>>) -> Result<String, StatusCode> {
    let mut buffer = String::new();
    let registry = state.registry.read().await;
    encode(&mut buffer, &registry).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(buffer)
}

/// Registers crawl metrics into the shared registry. Safe to call more than once.
pub async fn register_metrics(state: &AppState) {
    let mut registry = state.registry.write().await;
    if CRAWL_METRICS.initialized() {
        return;
    }
    CRAWL_METRICS
        .get_or_init(|| async { monitoring::CrawlMetrics::register(&mut registry, "atlas") })
        .await;
    monitoring::register_build_info_metric(&mut registry, "worker");
}

/// Starts the health/metrics HTTP server; it stops when the shutdown token fires.
pub async fn setup_server(
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Result<tokio::task::JoinHandle<()>, hyper::Error> {
    register_metrics(&state).await;

    let shutdown_token = state.shutdown_token.clone();
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(expose_metrics))
        .with_state(state);

    let server = axum::Server::try_bind(&addr)?;
    let server_handle = tokio::spawn(async move {
        let result = server
            .serve(app.into_make_service())
            .with_graceful_shutdown(async move {
                shutdown_token.cancelled().await;
            })
            .await;
        if let Err(err) = result {
            tracing::error!(event = "metrics_server_failed", error = %err, "metrics server exited");
        }
    });

    Ok(server_handle)
}
