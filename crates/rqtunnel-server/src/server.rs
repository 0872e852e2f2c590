//! Server mode: agent-link intake, user intake and pairing

use crate::liveness;
use crate::pending::PendingLink;
use crate::service::{bind, BoundAddrs, ServiceError, ServiceInner, ACCEPT_RETRY_DELAY};
use rqtunnel_connection::Session;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Bind every listener, register the configured name and spawn the loops.
pub(crate) async fn start(inner: &Arc<ServiceInner>) -> Result<(), ServiceError> {
    let config = &inner.config;

    let tunnel = bind(&config.tunnel_addr).await?;
    let users = bind(&config.service_addr).await?;
    let control = match &config.control_addr {
        Some(addr) => Some(bind(addr).await?),
        None => None,
    };

    let tunnel_addr = tunnel.local_addr()?;
    let user_addr = users.local_addr()?;
    let control_addr = control.as_ref().map(TcpListener::local_addr).transpose()?;
    inner.set_bound(BoundAddrs {
        tunnel: Some(tunnel_addr),
        service: Some(user_addr),
        control: control_addr,
    });

    info!("Accepting agent links on {}", tunnel_addr);
    info!("Accepting users on {}", user_addr);
    if let Some(addr) = control_addr {
        info!("Accepting agent control channels on {}", addr);
    }

    if let Some(name) = &config.tunnel_name {
        inner.registry.register_tunnel(name.clone(), user_addr.port());
    }

    inner.spawn_loop("agent-intake", agent_intake_loop(inner.clone(), tunnel));
    inner.spawn_loop("user-intake", user_intake_loop(inner.clone(), users));
    if let Some(listener) = control {
        inner.spawn_loop(
            "control-intake",
            liveness::control_intake_loop(inner.clone(), listener),
        );
    }

    Ok(())
}

/// Accept agent links and queue them. Blocks in `enqueue` while the queue
/// is full, which leaves further agent connections in the listen backlog.
async fn agent_intake_loop(inner: Arc<ServiceInner>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                debug!(%peer, "Agent link connected");

                let link = PendingLink::new(stream, peer);
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    queued = inner.pending.enqueue(link) => {
                        if queued.is_err() {
                            break;
                        }
                    }
                }
                debug!(%peer, pending = inner.pending.len(), "Agent link queued");
            }
            Err(e) => {
                error!("Failed to accept agent link: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }

    debug!("Agent link intake stopped");
}

/// Accept users and pair each with the oldest pending agent link.
///
/// While no link is pending this loop waits in `dequeue` and accepts no
/// further users; agent intake keeps running independently.
async fn user_intake_loop(inner: Arc<ServiceInner>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (user, user_peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept user connection: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };
        let _ = user.set_nodelay(true);

        if inner.pending.is_empty() {
            debug!(user = %user_peer, "No agent link pending, waiting");
        }
        let link = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            link = inner.pending.dequeue() => link,
        };
        let Some(link) = link else {
            break;
        };

        let agent_peer = link.peer();
        let waited = link.waited();
        let session = Session::new(
            user,
            link.into_stream(),
            &inner.cipher,
            &inner.sessions,
        );
        info!(
            session_id = %session.id(),
            user = %user_peer,
            agent = %agent_peer,
            link_age_ms = waited.as_millis() as u64,
            active = inner.sessions.active(),
            "Paired user with agent link"
        );

        inner.spawn_session(session);
    }

    debug!("User intake stopped");
}
