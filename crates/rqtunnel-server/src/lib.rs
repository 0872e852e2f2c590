//! Tunnel service orchestration
//!
//! [`TunnelService`] runs either side of the reverse tunnel:
//!
//! - **server mode** accepts agent links into a [`PendingLinkQueue`] and
//!   pairs each user connection with the oldest pending link;
//! - **agent mode** keeps links dialed to the server, each paired with a
//!   fresh connection to the private service.
//!
//! Both modes share one lifecycle (`Idle -> Running -> Stopping -> Stopped`)
//! driven by [`TunnelService::start`] and [`TunnelService::stop`].

pub mod agent;
pub mod config;
pub mod liveness;
pub mod pending;
pub mod server;
pub mod service;
pub mod task_tracker;

pub use config::{ConfigError, TunnelConfig, TunnelMode};
pub use pending::{PendingLink, PendingLinkQueue, QueueClosed};
pub use service::{BoundAddrs, ServiceError, ServiceState, ServiceStats, TunnelService};
pub use task_tracker::TaskTracker;

pub use rqtunnel_cipher::{CipherMethod, CipherSpec};
pub use rqtunnel_connection::ReconnectConfig;
pub use rqtunnel_control::{TunnelListing, TunnelRegistry};
