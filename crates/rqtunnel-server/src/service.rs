//! Tunnel service lifecycle
//!
//! A [`TunnelService`] owns everything shared by its loops: the buffer
//! recycler, the pending link queue, the session counter and the tunnel
//! registry. Its state is published on a `watch` channel:
//!
//! ```text
//! Idle --start()--> Running --stop()--> Stopping --(loops exited, sessions drained)--> Stopped
//!   \--stop()-------------------------------------------------------------------------^
//! ```
//!
//! Every blocking point of every loop also waits on one
//! [`CancellationToken`], so `stop()` unblocks accept, enqueue, dequeue,
//! dial and backoff sleeps alike.

use crate::config::{listen_address, ConfigError, TunnelConfig, TunnelMode};
use crate::pending::PendingLinkQueue;
use crate::task_tracker::TaskTracker;
use crate::{agent, server};
use rqtunnel_cipher::CipherSpec;
use rqtunnel_connection::{BufferRecycler, Session, SessionCounter};
use rqtunnel_control::TunnelRegistry;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept before trying again
pub(crate) const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Upper bound on a single outbound connect
pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of a [`TunnelService`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Idle => "idle",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Tunnel service errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to resolve {address}: {reason}")]
    ResolveError { address: String, reason: String },

    #[error("Cannot {action} a service that is {state}")]
    InvalidState {
        action: &'static str,
        state: ServiceState,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Addresses the service actually uses
///
/// In server mode these are the bound listeners (useful with port 0). In
/// agent mode `tunnel` and `service` are the resolved dial targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundAddrs {
    pub tunnel: Option<SocketAddr>,
    pub service: Option<SocketAddr>,
    pub control: Option<SocketAddr>,
}

/// Point-in-time counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStats {
    pub state: ServiceState,
    pub active_sessions: usize,
    pub total_sessions: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub pending_links: usize,
    pub buffers_in_use: usize,
}

pub(crate) struct ServiceInner {
    pub(crate) config: TunnelConfig,
    pub(crate) cipher: CipherSpec,
    pub(crate) recycler: BufferRecycler,
    pub(crate) pending: PendingLinkQueue,
    pub(crate) sessions: Arc<SessionCounter>,
    pub(crate) registry: TunnelRegistry,
    pub(crate) shutdown: CancellationToken,
    /// Cancelled once the grace period is over to end straggling sessions
    pub(crate) force_close: CancellationToken,
    pub(crate) tasks: TaskTracker,
    state: watch::Sender<ServiceState>,
    starting: AtomicBool,
    bound: Mutex<BoundAddrs>,
}

impl ServiceInner {
    pub(crate) fn bound(&self) -> BoundAddrs {
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_bound(&self, addrs: BoundAddrs) {
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner) = addrs;
    }

    /// Spawn a long-running loop that shutdown waits for
    pub(crate) fn spawn_loop<F>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.register(name, tokio::spawn(task));
    }

    /// Run a session on its own task until it ends or the grace period expires
    pub(crate) fn spawn_session(self: &Arc<Self>, session: Session) -> JoinHandle<()> {
        let inner = self.clone();
        tokio::spawn(async move {
            session.run(&inner.recycler, &inner.force_close).await;
        })
    }

    async fn supervise_shutdown(self: Arc<Self>) {
        let deadline = Instant::now() + self.config.shutdown_grace;

        if timeout_at(deadline, self.tasks.join_all()).await.is_err() {
            warn!("Service loops did not exit in time, aborting them");
            self.tasks.abort_all();
        }

        let active = self.sessions.active();
        if active > 0 {
            info!(
                active,
                grace_ms = self.config.shutdown_grace.as_millis() as u64,
                "Waiting for active sessions to finish"
            );
        }
        if timeout_at(deadline, self.sessions.wait_idle()).await.is_err() {
            warn!(
                active = self.sessions.active(),
                "Grace period elapsed, closing remaining sessions"
            );
            self.force_close.cancel();
            self.sessions.wait_idle().await;
        }

        self.recycler.close();
        self.state.send_replace(ServiceState::Stopped);
        info!(
            total_sessions = self.sessions.total(),
            bytes_in = self.sessions.bytes_in(),
            bytes_out = self.sessions.bytes_out(),
            "Tunnel service stopped"
        );
    }
}

/// Bind a listener, treating an empty host as all interfaces
pub(crate) async fn bind(addr: &str) -> Result<TcpListener, ServiceError> {
    let addr = listen_address(addr);
    TcpListener::bind(&addr).await.map_err(|e| {
        let port = addr
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(0);
        ServiceError::BindError {
            address: addr.clone(),
            port,
            reason: e.to_string(),
        }
    })
}

/// One side of a reverse tunnel
#[derive(Clone)]
pub struct TunnelService {
    inner: Arc<ServiceInner>,
}

impl TunnelService {
    /// Validate `config` and build an idle service
    pub fn new(config: TunnelConfig) -> Result<Self, ServiceError> {
        let cipher = config.validate()?;
        let (state, _) = watch::channel(ServiceState::Idle);

        let inner = ServiceInner {
            recycler: BufferRecycler::new(config.capacity, config.buffer_size),
            pending: PendingLinkQueue::new(config.capacity),
            sessions: SessionCounter::new(),
            registry: TunnelRegistry::new(),
            shutdown: CancellationToken::new(),
            force_close: CancellationToken::new(),
            tasks: TaskTracker::new(),
            state,
            starting: AtomicBool::new(false),
            bound: Mutex::new(BoundAddrs::default()),
            cipher,
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Bind (server) or resolve (agent) and start every loop.
    ///
    /// Valid only from `Idle`. A failure is fatal: the service moves
    /// straight to `Stopped`.
    pub async fn start(&self) -> Result<(), ServiceError> {
        let state = self.state();
        if state != ServiceState::Idle || self.inner.starting.swap(true, Ordering::AcqRel) {
            return Err(ServiceError::InvalidState {
                action: "start",
                state,
            });
        }

        let started = match self.inner.config.mode {
            TunnelMode::Server => server::start(&self.inner).await,
            TunnelMode::Agent => agent::start(&self.inner).await,
        };

        if let Err(e) = started {
            error!(error = %e, "Tunnel service failed to start");
            self.inner.shutdown.cancel();
            self.inner.tasks.abort_all();
            self.inner.pending.close();
            self.inner.recycler.close();
            self.inner.state.send_replace(ServiceState::Stopped);
            return Err(e);
        }

        let running = self.inner.state.send_if_modified(|state| {
            if *state == ServiceState::Idle {
                *state = ServiceState::Running;
                true
            } else {
                false
            }
        });
        if !running {
            // stop() won the race; the loops have already seen the cancellation
            return Err(ServiceError::InvalidState {
                action: "start",
                state: self.state(),
            });
        }

        info!(
            mode = %self.inner.config.mode,
            cipher = %self.inner.cipher.method(),
            capacity = self.inner.config.capacity,
            "Tunnel service running"
        );
        Ok(())
    }

    /// Begin shutdown. Returns immediately; use [`wait_stopped`](Self::wait_stopped)
    /// to wait for `Stopped`.
    pub fn stop(&self) {
        let mut previous = ServiceState::Idle;
        let changed = self.inner.state.send_if_modified(|state| {
            previous = *state;
            match *state {
                ServiceState::Idle => {
                    *state = ServiceState::Stopped;
                    true
                }
                ServiceState::Running => {
                    *state = ServiceState::Stopping;
                    true
                }
                ServiceState::Stopping | ServiceState::Stopped => false,
            }
        });
        if !changed {
            debug!(state = %previous, "Stop requested again, ignoring");
            return;
        }

        self.inner.shutdown.cancel();
        let closed = self.inner.pending.close();

        if previous == ServiceState::Idle {
            self.inner.recycler.close();
            info!("Tunnel service stopped before it started");
            return;
        }

        info!(mode = %self.inner.config.mode, "Stopping tunnel service");
        if closed > 0 {
            info!(closed, "Closed pending agent links");
        }

        let inner = self.inner.clone();
        tokio::spawn(inner.supervise_shutdown());
    }

    /// Wait until the service reaches `Stopped`
    pub async fn wait_stopped(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ServiceState::Stopped).await;
    }

    /// `stop()` followed by `wait_stopped()`
    pub async fn shutdown(&self) {
        self.stop();
        self.wait_stopped().await;
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.inner.state.subscribe()
    }

    pub fn stats(&self) -> ServiceStats {
        let sessions = &self.inner.sessions;
        ServiceStats {
            state: self.state(),
            active_sessions: sessions.active(),
            total_sessions: sessions.total(),
            bytes_in: sessions.bytes_in(),
            bytes_out: sessions.bytes_out(),
            pending_links: self.inner.pending.len(),
            buffers_in_use: self.inner.recycler.in_use(),
        }
    }

    /// Shared handle to the named tunnels this service knows about
    pub fn registry(&self) -> TunnelRegistry {
        self.inner.registry.clone()
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.inner.config
    }

    pub fn bound_addrs(&self) -> BoundAddrs {
        self.inner.bound()
    }
}

impl fmt::Debug for TunnelService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelService")
            .field("mode", &self.inner.config.mode)
            .field("state", &self.state())
            .field("bound", &self.inner.bound())
            .finish_non_exhaustive()
    }
}
