// src/server/metrics_server.rs

//! The optional Prometheus exporter endpoint.

use crate::core::metrics::gather_metrics;
use crate::core::state::ServerState;
use axum::Router;
use axum::routing::get;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub async fn run(state: Arc<ServerState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let addr = format!("{}:{}", state.config.host, state.config.metrics.port);
    let app = Router::new().route("/metrics", get(|| async { gather_metrics() }));
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("Metrics server failed to bind {}: {}", addr, e);
            return;
        }
    };
    info!("Metrics server listening on {}", addr);
    let shutdown = async move {
        let _ = shutdown_rx.recv().await;
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        warn!("Metrics server terminated: {}", e);
    }
}
