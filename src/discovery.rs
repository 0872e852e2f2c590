//! HTTP discovery endpoint listing registered tunnels

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use rqtunnel_server::{TunnelListing, TunnelRegistry};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const DEFAULT_PATH: &str = "/listItem";

/// Router answering `GET <path>` with the registry snapshot
pub fn router(registry: TunnelRegistry, path: &str) -> Router {
    Router::new()
        .route(path, get(list_tunnels))
        .with_state(registry)
}

async fn list_tunnels(State(registry): State<TunnelRegistry>) -> Json<TunnelListing> {
    Json(registry.listing())
}

/// Bind `addr` and serve discovery until `shutdown` fires.
pub async fn spawn(
    addr: &str,
    path: &str,
    registry: TunnelRegistry,
    shutdown: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind discovery endpoint on {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!("Discovery endpoint listening on http://{}{}", local_addr, path);

    let app = router(registry, path);
    let handle = tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = served {
            error!("Discovery endpoint failed: {}", e);
        }
    });

    Ok((local_addr, handle))
}
