//! Axum HTTP server for the REST API

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::controller::StopSignal;
use crate::{Error, Result};

use super::handlers;

pub struct ApiState {
    pub stop: StopSignal,
}

pub fn router(state: Arc<ApiState>) -> Router {
    let router = Router::new().route("/healthz", get(handlers::health));
    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(handlers::metrics));
    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serve until the stop signal fires
pub async fn run_server(addr: SocketAddr, state: Arc<ApiState>) -> Result<()> {
    let stop = state.stop.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("REST API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { stop.wait().await })
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;
    Ok(())
}
