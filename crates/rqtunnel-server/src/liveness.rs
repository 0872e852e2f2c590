//! Agent liveness over the control channel
//!
//! The agent keeps one control connection to the server, separate from the
//! data links. It announces its tunnel name with a `Data` message, then
//! sends `HeartBeat` every interval and `Quit` when it stops. When the
//! server sees `Quit`, EOF, a malformed line or silence longer than the
//! heartbeat timeout, it unregisters the name and closes every pending link,
//! since links from a dead agent would only pair users with nothing.
//!
//! A channel only cleans up after itself: if a newer channel has registered
//! the same name since, the old one ends without touching the registry or
//! the pending links, which by then belong to the reconnected agent.

use crate::agent::connect;
use crate::service::{ServiceInner, ACCEPT_RETRY_DELAY};
use futures::{SinkExt, StreamExt};
use rqtunnel_connection::ReconnectManager;
use rqtunnel_control::{ControlCodec, ControlError, ControlMessage, TunnelEntry};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

/// How a server-side control channel ended
enum ChannelEnd {
    Quit,
    Disconnected,
    TimedOut,
    Failed(ControlError),
    Shutdown,
}

impl fmt::Display for ChannelEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelEnd::Quit => write!(f, "agent quit"),
            ChannelEnd::Disconnected => write!(f, "agent disconnected"),
            ChannelEnd::TimedOut => write!(f, "heartbeat timed out"),
            ChannelEnd::Failed(e) => write!(f, "{}", e),
            ChannelEnd::Shutdown => write!(f, "service stopping"),
        }
    }
}

/// Server side: accept control connections from agents.
pub(crate) async fn control_intake_loop(inner: Arc<ServiceInner>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                info!(%peer, "Agent control channel connected");
                tokio::spawn(supervise_agent(inner.clone(), stream, peer));
            }
            Err(e) => {
                error!("Failed to accept control connection: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }

    debug!("Control intake stopped");
}

async fn supervise_agent(inner: Arc<ServiceInner>, stream: TcpStream, peer: SocketAddr) {
    let mut messages = FramedRead::new(stream, ControlCodec::new());
    let mut name: Option<String> = None;
    let mut registration: Option<TunnelEntry> = None;

    let end = loop {
        let next = tokio::select! {
            _ = inner.shutdown.cancelled() => break ChannelEnd::Shutdown,
            next = timeout(inner.config.heartbeat_timeout, messages.next()) => next,
        };

        let message = match next {
            Err(_) => break ChannelEnd::TimedOut,
            Ok(None) => break ChannelEnd::Disconnected,
            Ok(Some(Err(e))) => break ChannelEnd::Failed(e),
            Ok(Some(Ok(message))) => message,
        };

        match message {
            ControlMessage::Data(announced) if name.is_none() => {
                match inner.bound().service {
                    Some(users) => {
                        let (entry, _) =
                            inner.registry.claim_tunnel(announced.clone(), users.port());
                        registration = Some(entry);
                    }
                    None => warn!(%peer, "No user listener to register the tunnel against"),
                }
                name = Some(announced);
            }
            ControlMessage::Data(payload) => {
                debug!(%peer, len = payload.len(), "Control data");
            }
            ControlMessage::HeartBeat => debug!(%peer, "Heartbeat"),
            ControlMessage::Quit => break ChannelEnd::Quit,
        }
    };

    if matches!(end, ChannelEnd::Shutdown) {
        debug!(%peer, "Control channel closed by shutdown");
        return;
    }

    if let Some(entry) = &registration {
        let still_ours = inner
            .registry
            .unregister_if(&entry.name, entry.generation)
            .is_some();
        if !still_ours {
            info!(
                %peer,
                tunnel = %entry.name,
                reason = %end,
                "Superseded control channel ended, keeping the newer registration"
            );
            return;
        }
    }
    let closed = inner.pending.drain();

    match end {
        ChannelEnd::Quit => info!(%peer, tunnel = ?name, closed, "Agent left, pending links closed"),
        other => warn!(
            %peer,
            tunnel = ?name,
            closed,
            reason = %other,
            "Agent liveness lost, pending links closed"
        ),
    }
}

/// Agent side: keep a control connection to the server, reconnecting with
/// backoff, until the service stops.
pub(crate) async fn heartbeat_loop(inner: Arc<ServiceInner>, server: String) {
    let mut backoff = ReconnectManager::new(inner.config.reconnect.clone());

    loop {
        let connected = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            connected = connect(&server) => connected,
        };

        match connected {
            Ok(stream) => {
                backoff.reset();
                info!(%server, "Control channel connected");
                match send_heartbeats(&inner, stream).await {
                    Ok(()) => break,
                    Err(e) => warn!(%server, error = %e, "Control channel lost"),
                }
            }
            Err(e) => warn!(%server, error = %e, "Failed to connect control channel"),
        }

        if backoff.wait(&inner.shutdown).await.is_err() {
            break;
        }
    }

    debug!("Heartbeat loop stopped");
}

/// Announce, then heartbeat until shutdown (`Ok`) or a channel failure.
async fn send_heartbeats(inner: &ServiceInner, stream: TcpStream) -> Result<(), ControlError> {
    let (mut reader, writer) = stream.into_split();
    let mut sink = FramedWrite::new(writer, ControlCodec::new());

    if let Some(name) = &inner.config.tunnel_name {
        sink.send(ControlMessage::Data(name.clone())).await?;
    }

    let mut ticker = interval(inner.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    // The server never writes; a readable socket means it went away.
    let mut probe = [0u8; 1];
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                sink.send(ControlMessage::Quit).await?;
                debug!("Sent quit on control channel");
                return Ok(());
            }
            _ = ticker.tick() => {
                sink.send(ControlMessage::HeartBeat).await?;
            }
            read = reader.read(&mut probe) => {
                match read {
                    Ok(0) => {
                        return Err(ControlError::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "control channel closed by server",
                        )));
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}
