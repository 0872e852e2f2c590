//! Paired relay sessions and the active-session counter

use crate::connection::{ManagedConnection, Transform};
use crate::recycler::BufferRecycler;
use crate::relay::relay;
use rqtunnel_cipher::CipherSpec;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Process-wide session accounting owned by one tunnel service
#[derive(Debug, Default)]
pub struct SessionCounter {
    active: AtomicUsize,
    total: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    idle: Notify,
}

impl SessionCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count a new active session until the returned guard drops.
    pub fn enter(self: &Arc<Self>) -> ActiveSessionGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        self.total.fetch_add(1, Ordering::Relaxed);
        ActiveSessionGuard {
            counter: self.clone(),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    fn record(&self, report: &SessionReport) {
        self.bytes_in.fetch_add(report.bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(report.bytes_out, Ordering::Relaxed);
    }

    /// Wait until no session is active.
    pub async fn wait_idle(&self) {
        loop {
            // Register before checking so a concurrent drop to zero is not missed
            let notified = self.idle.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Keeps a session counted as active while alive
#[derive(Debug)]
pub struct ActiveSessionGuard {
    counter: Arc<SessionCounter>,
}

impl Drop for ActiveSessionGuard {
    fn drop(&mut self) {
        if self.counter.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.counter.idle.notify_waiters();
        }
    }
}

/// Outcome of a finished session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub id: Uuid,
    /// Bytes read from the local leg and sent into the tunnel
    pub bytes_in: u64,
    /// Bytes read from the tunnel and delivered to the local leg
    pub bytes_out: u64,
    pub duration: Duration,
    /// Ended by the caller's stop token rather than by its peers
    pub interrupted: bool,
}

/// One paired relay between a local leg and the protected tunnel leg
///
/// On the server the local leg is the user connection and the tunnel leg is
/// an agent-provided link. On the agent the local leg is the private service
/// and the tunnel leg is the link to the server. Only the tunnel leg is ever
/// ciphered.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    local: ManagedConnection,
    tunnel: ManagedConnection,
    guard: ActiveSessionGuard,
}

impl Session {
    pub fn new(
        local: TcpStream,
        tunnel: TcpStream,
        cipher: &CipherSpec,
        counter: &Arc<SessionCounter>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            local: ManagedConnection::plain(local),
            tunnel: ManagedConnection::new(tunnel, Transform::protected(cipher)),
            guard: counter.enter(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Relay until both directions end or `stop` fires, then release both
    /// sockets. Bytes moved before a stop are still counted.
    pub async fn run(self, recycler: &BufferRecycler, stop: &CancellationToken) -> SessionReport {
        let Session {
            id,
            local,
            tunnel,
            guard,
        } = self;
        let local_peer = local.peer_addr();
        let tunnel_peer = tunnel.peer_addr();
        let started = Instant::now();

        let stats = relay(local, tunnel, recycler, stop).await;

        let report = SessionReport {
            id,
            bytes_in: stats.a_to_b,
            bytes_out: stats.b_to_a,
            duration: started.elapsed(),
            interrupted: stop.is_cancelled(),
        };
        guard.counter.record(&report);
        drop(guard);

        if report.interrupted {
            warn!(
                session_id = %id,
                bytes_in = report.bytes_in,
                bytes_out = report.bytes_out,
                "Session closed at shutdown"
            );
        } else {
            info!(
                session_id = %id,
                local = ?local_peer,
                tunnel = ?tunnel_peer,
                bytes_in = report.bytes_in,
                bytes_out = report.bytes_out,
                duration_ms = report.duration.as_millis() as u64,
                "Session closed"
            );
        }

        report
    }
}
