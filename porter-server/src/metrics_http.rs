//! Prometheus text endpoint and health probe.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use porter_core::config::ServerConfig;
use porter_core::service::GatewayState;

#[derive(Clone)]
struct MetricsState {
    gateway: Arc<GatewayState>,
}

pub fn spawn_metrics_server(config: &ServerConfig, gateway: Arc<GatewayState>) -> Result<()> {
    if !config.metrics.enabled {
        return Ok(());
    }
    let addr: SocketAddr = config
        .metrics_addr()
        .with_context(|| "invalid metrics bind address")?;

    let app = Router::new()
        .route("/metrics", get(metrics_text))
        .route("/health", get(health))
        .with_state(MetricsState { gateway });

    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(err) = axum::serve(listener, app).await {
                    tracing::error!(%err, "metrics server failed");
                }
            }
            Err(err) => {
                tracing::error!(%err, "metrics server bind failed");
            }
        }
    });

    tracing::info!(%addr, "metrics server listening");
    Ok(())
}

async fn metrics_text(State(state): State<MetricsState>) -> String {
    state
        .gateway
        .metrics
        .record_cache_stats(state.gateway.cache.stats());
    state
        .gateway
        .metrics
        .render(Some(state.gateway.pool.stats()))
}

/// 200 while the pool has seen a healthy backend recently.
async fn health(State(state): State<MetricsState>) -> StatusCode {
    if state.gateway.pool.healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
