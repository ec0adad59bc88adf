//! Liveness endpoint.
//!
//! Consul polls this route through the health check the runner registers. As
//! long as the process is up the check passes and the session stays alive.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tracing::info;

/// Path of the liveness route.
pub const HEALTH_PATH: &str = "/health";

/// Create the liveness router.
pub fn routes() -> Router {
    Router::new().route(HEALTH_PATH, get(health))
}

/// Always healthy while the process runs.
async fn health() -> &'static str {
    "OK"
}

/// Serve the liveness route on `addr` until the listener fails.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Could not bind liveness endpoint to {addr}"))?;
    info!(addr = %addr, path = HEALTH_PATH, "Liveness endpoint listening");

    axum::serve(listener, routes())
        .await
        .context("Liveness endpoint failed")
}
