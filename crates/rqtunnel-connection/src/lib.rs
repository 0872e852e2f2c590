//! Connection management for tunnel sessions
//!
//! Provides the per-socket wrapper with optional stream encryption and
//! independent half-close, the bounded buffer pool that throttles copying,
//! the bidirectional pipe engine and reconnection backoff.

pub mod connection;
pub mod reconnect;
pub mod recycler;
pub mod relay;
pub mod session;

pub use connection::{ConnReader, ConnWriter, ManagedConnection, Transform};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use recycler::{BufferRecycler, RecycledBuffer, RecyclerClosed, DEFAULT_BUFFER_SIZE};
pub use relay::{relay, RelayStats};
pub use session::{ActiveSessionGuard, Session, SessionCounter, SessionReport};
