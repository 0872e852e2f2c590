//! Control plane for tunnel liveness and discovery
//!
//! The control channel is a dedicated connection between agent and server
//! carrying newline-delimited control messages; it never shares a socket
//! with relayed data. The tunnel registry records which named tunnels are
//! reachable on which public port.

pub mod message;
pub mod registry;

pub use message::{ControlCodec, ControlError, ControlMessage, MAX_LINE_LENGTH};
pub use registry::{TunnelEntry, TunnelListing, TunnelRegistry, TunnelSummary};
