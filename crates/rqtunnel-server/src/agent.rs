//! Agent mode: keep links dialed to the server, each paired with the
//! private service.
//!
//! Every worker loops on its own: dial the server, dial the local service,
//! run the session to completion, dial again. Failed dials back off
//! exponentially and never stop the loop.

use crate::config::dial_address;
use crate::liveness;
use crate::service::{BoundAddrs, ServiceError, ServiceInner, DIAL_TIMEOUT};
use rqtunnel_connection::{ReconnectManager, Session};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Why a worker could not set up a link
#[derive(Debug, Error)]
pub enum DialError {
    #[error("Failed to connect to tunnel server {address}: {source}")]
    Server { address: String, source: io::Error },

    #[error("Failed to connect to local service {address}: {source}")]
    Local { address: String, source: io::Error },
}

/// Resolve both targets and spawn the link workers.
pub(crate) async fn start(inner: &Arc<ServiceInner>) -> Result<(), ServiceError> {
    let config = &inner.config;
    let server = dial_address(&config.tunnel_addr);
    let local = dial_address(&config.service_addr);

    let server_addr = resolve(&server).await?;
    let local_addr = resolve(&local).await?;
    inner.set_bound(BoundAddrs {
        tunnel: Some(server_addr),
        service: Some(local_addr),
        control: None,
    });

    info!(
        server = %server,
        local = %local,
        links = config.links,
        "Forwarding tunnel links to local service"
    );

    for worker in 0..config.links {
        inner.spawn_loop(
            format!("agent-link-{}", worker),
            link_worker(inner.clone(), worker, server.clone(), local.clone()),
        );
    }

    if let Some(control) = &config.control_addr {
        inner.spawn_loop(
            "agent-control",
            liveness::heartbeat_loop(inner.clone(), dial_address(control)),
        );
    }

    Ok(())
}

async fn resolve(address: &str) -> Result<SocketAddr, ServiceError> {
    let mut addrs = lookup_host(address)
        .await
        .map_err(|e| ServiceError::ResolveError {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

    addrs.next().ok_or_else(|| ServiceError::ResolveError {
        address: address.to_string(),
        reason: "no addresses found".to_string(),
    })
}

async fn link_worker(inner: Arc<ServiceInner>, worker: usize, server: String, local: String) {
    let mut backoff = ReconnectManager::new(inner.config.reconnect.clone());

    loop {
        let pair = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            pair = dial_pair(&server, &local) => pair,
        };

        match pair {
            Ok((tunnel, service)) => {
                backoff.reset();
                let session = Session::new(service, tunnel, &inner.cipher, &inner.sessions);
                debug!(worker, session_id = %session.id(), "Link established, waiting for a user");

                // The session keeps running on its own if we are asked to stop.
                let mut running = inner.spawn_session(session);
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = &mut running => {}
                }
            }
            Err(e) => {
                warn!(
                    worker,
                    error = %e,
                    retry_in_ms = backoff.current_backoff().as_millis() as u64,
                    "Link setup failed"
                );
                if backoff.wait(&inner.shutdown).await.is_err() {
                    break;
                }
            }
        }
    }

    debug!(worker, "Link worker stopped");
}

/// Dial the server, then the local service. A failed local dial drops the
/// server connection again.
async fn dial_pair(server: &str, local: &str) -> Result<(TcpStream, TcpStream), DialError> {
    let tunnel = connect(server)
        .await
        .map_err(|source| DialError::Server {
            address: server.to_string(),
            source,
        })?;

    let service = connect(local).await.map_err(|source| DialError::Local {
        address: local.to_string(),
        source,
    })?;

    Ok((tunnel, service))
}

pub(crate) async fn connect(address: &str) -> io::Result<TcpStream> {
    let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(address))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}
