// src/server/metrics_server.rs

use crate::core::metrics::gather_metrics;
use crate::core::state::SharedState;
use crate::core::types::job::JobState;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Handles HTTP requests to the /metrics endpoint.
///
/// Dynamic gauges are refreshed from the tables before gathering, so the
/// scrape always reflects the current cluster state.
async fn metrics_handler(state: Arc<SharedState>) -> impl IntoResponse {
    {
        let jobs = state.jobs.read();
        let pending = jobs
            .iter_matching(|j| j.state == JobState::Pending)
            .count();
        let running = jobs
            .iter_matching(|j| j.state == JobState::Running)
            .count();
        crate::core::metrics::JOBS_PENDING.set(pending as f64);
        crate::core::metrics::JOBS_RUNNING.set(running as f64);
    }
    {
        let nodes = state.nodes.read();
        for base in ["IDLE", "ALLOC", "MIX", "DOWN", "FUTURE", "UNKNOWN"] {
            let count = nodes
                .iter()
                .filter(|n| n.state.base.to_string() == base)
                .count();
            crate::core::metrics::NODES_BY_STATE
                .with_label_values(&[base])
                .set(count as f64);
        }
        crate::core::metrics::NODES_POWERED_DOWN
            .set(nodes.bitmaps.power_down.count() as f64);
    }
    {
        let ledger = state.licenses.lock();
        for entry in ledger.iter() {
            crate::core::metrics::LICENSES_USED
                .with_label_values(&[&entry.name])
                .set(entry.used as f64);
        }
    }

    let body = gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

/// Runs a simple HTTP server to expose Prometheus metrics on /metrics.
pub async fn run_metrics_server(state: Arc<SharedState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let port = {
        let config = state.config.lock().await;
        config.metrics.port
    };

    let app = Router::new().route("/metrics", get(move || metrics_handler(state.clone())));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(
        "Prometheus metrics server listening on http://{}/metrics",
        addr
    );

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server on port {}: {}", port, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("Metrics server shutting down.");
        })
        .await
    {
        error!("Metrics server error: {}", e);
    }
}
