// src/server/metrics_server.rs

//! The HTTP exporter for the registry metrics.

use crate::core::metrics::gather_metrics;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::{error, info};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", PROMETHEUS_CONTENT_TYPE)],
        gather_metrics(),
    )
}

/// Liveness probe; answers as long as the runtime is scheduling tasks.
async fn health_handler() -> &'static str {
    "OK"
}

fn router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(health_handler))
}

/// Serves `/metrics` and `/healthz` on `port` until the shutdown broadcast fires.
/// A bind failure is logged and ends the task without taking the server down.
pub async fn run_metrics_server(port: u16, mut shutdown_rx: broadcast::Receiver<()>) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind metrics server on {}: {}", addr, e);
            return;
        }
    };
    info!("Prometheus metrics available at http://{}/metrics", addr);

    let served = axum::serve(listener, router())
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Metrics server shutting down.");
        })
        .await;
    if let Err(e) = served {
        error!("Metrics server failed: {}", e);
    }
}
