//! Tunnel service configuration

use rqtunnel_cipher::{CipherError, CipherSpec};
use rqtunnel_connection::{ReconnectConfig, DEFAULT_BUFFER_SIZE};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CIPHER: &str = "rc4";
pub const DEFAULT_CAPACITY: usize = 4096;
/// Links an agent keeps open unless configured otherwise
pub const DEFAULT_AGENT_LINKS: usize = 1;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
/// Longest heartbeat interval, heartbeat timeout or shutdown grace accepted
pub const MAX_TIMER: Duration = Duration::from_secs(24 * 60 * 60);

/// Which side of the tunnel a service runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    /// Public side: accepts agent links and user connections
    Server,
    /// Private side: dials the server and the local service
    Agent,
}

impl fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelMode::Server => write!(f, "server"),
            TunnelMode::Agent => write!(f, "agent"),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid {kind} address '{address}': {reason}")]
    InvalidAddress {
        kind: &'static str,
        address: String,
        reason: String,
    },

    #[error("Capacity must be at least 1")]
    InvalidCapacity,

    #[error("Agent links ({links}) must be between 1 and the capacity ({capacity})")]
    InvalidLinks { links: usize, capacity: usize },

    #[error("Buffer size must be at least 1 byte")]
    InvalidBufferSize,

    #[error("Invalid heartbeat settings: {0}")]
    InvalidHeartbeat(String),

    #[error("Shutdown grace {grace:?} exceeds the maximum of {max:?}")]
    InvalidShutdownGrace { grace: Duration, max: Duration },

    #[error("Tunnel name cannot be empty")]
    EmptyTunnelName,

    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// Everything a [`TunnelService`](crate::TunnelService) needs to run.
///
/// In server mode `tunnel_addr` and `service_addr` are listen addresses for
/// agent links and users. In agent mode they are dial targets: the tunnel
/// server and the private local service. An empty host (`":8080"`) means
/// all interfaces when listening and loopback when dialing.
#[derive(Clone)]
pub struct TunnelConfig {
    pub mode: TunnelMode,
    pub tunnel_addr: String,
    pub service_addr: String,
    pub cipher_method: String,
    pub secret: String,
    /// Maximum pending links and concurrent relays (one buffer per relay)
    pub capacity: usize,
    pub buffer_size: usize,
    /// Links the agent keeps dialed toward the server
    pub links: usize,
    /// Name registered for discovery
    pub tunnel_name: Option<String>,
    /// Server: control listen address. Agent: control dial target.
    pub control_addr: Option<String>,
    pub heartbeat_interval: Duration,
    /// Silence after which the server drops an agent's pending links
    pub heartbeat_timeout: Duration,
    pub reconnect: ReconnectConfig,
    pub shutdown_grace: Duration,
}

impl TunnelConfig {
    fn base(mode: TunnelMode, tunnel_addr: String, service_addr: String) -> Self {
        Self {
            mode,
            tunnel_addr,
            service_addr,
            cipher_method: DEFAULT_CIPHER.to_string(),
            secret: String::new(),
            capacity: DEFAULT_CAPACITY,
            buffer_size: DEFAULT_BUFFER_SIZE,
            links: DEFAULT_AGENT_LINKS,
            tunnel_name: None,
            control_addr: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_INTERVAL * 3,
            reconnect: ReconnectConfig::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Server listening for agents on `tunnel_listen` and users on `user_listen`
    pub fn server(tunnel_listen: impl Into<String>, user_listen: impl Into<String>) -> Self {
        Self::base(TunnelMode::Server, tunnel_listen.into(), user_listen.into())
    }

    /// Agent dialing `server_addr` and forwarding to `local_service`
    pub fn agent(server_addr: impl Into<String>, local_service: impl Into<String>) -> Self {
        Self::base(TunnelMode::Agent, server_addr.into(), local_service.into())
    }

    pub fn with_cipher(mut self, method: impl Into<String>, secret: impl Into<String>) -> Self {
        self.cipher_method = method.into();
        self.secret = secret.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_links(mut self, links: usize) -> Self {
        self.links = links;
        self
    }

    pub fn with_tunnel_name(mut self, name: impl Into<String>) -> Self {
        self.tunnel_name = Some(name.into());
        self
    }

    pub fn with_control_addr(mut self, addr: impl Into<String>) -> Self {
        self.control_addr = Some(addr.into());
        self
    }

    /// Set the heartbeat interval; the timeout follows at three intervals.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        // Saturates so validate() reports an oversized interval instead
        self.heartbeat_timeout = interval.checked_mul(3).unwrap_or(Duration::MAX);
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Check the configuration and build the tunnel cipher from it.
    pub fn validate(&self) -> Result<CipherSpec, ConfigError> {
        let (tunnel_kind, service_kind) = match self.mode {
            TunnelMode::Server => ("tunnel listen", "user listen"),
            TunnelMode::Agent => ("tunnel server", "local service"),
        };
        validate_address(&self.tunnel_addr, tunnel_kind)?;
        validate_address(&self.service_addr, service_kind)?;
        if let Some(control) = &self.control_addr {
            validate_address(control, "control")?;
        }

        if self.capacity == 0 {
            return Err(ConfigError::InvalidCapacity);
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize);
        }
        if self.mode == TunnelMode::Agent && (self.links == 0 || self.links > self.capacity) {
            return Err(ConfigError::InvalidLinks {
                links: self.links,
                capacity: self.capacity,
            });
        }

        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidHeartbeat(
                "interval must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_interval > MAX_TIMER {
            return Err(ConfigError::InvalidHeartbeat(format!(
                "interval ({:?}) exceeds the maximum of {:?}",
                self.heartbeat_interval, MAX_TIMER
            )));
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::InvalidHeartbeat(format!(
                "timeout ({:?}) must exceed the interval ({:?})",
                self.heartbeat_timeout, self.heartbeat_interval
            )));
        }
        if self.heartbeat_timeout > MAX_TIMER {
            return Err(ConfigError::InvalidHeartbeat(format!(
                "timeout ({:?}) exceeds the maximum of {:?}",
                self.heartbeat_timeout, MAX_TIMER
            )));
        }

        if self.shutdown_grace > MAX_TIMER {
            return Err(ConfigError::InvalidShutdownGrace {
                grace: self.shutdown_grace,
                max: MAX_TIMER,
            });
        }

        if matches!(&self.tunnel_name, Some(name) if name.trim().is_empty()) {
            return Err(ConfigError::EmptyTunnelName);
        }

        Ok(CipherSpec::new(&self.cipher_method, self.secret.as_bytes())?)
    }
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("mode", &self.mode)
            .field("tunnel_addr", &self.tunnel_addr)
            .field("service_addr", &self.service_addr)
            .field("cipher_method", &self.cipher_method)
            .field("secret", &"<redacted>")
            .field("capacity", &self.capacity)
            .field("buffer_size", &self.buffer_size)
            .field("links", &self.links)
            .field("tunnel_name", &self.tunnel_name)
            .field("control_addr", &self.control_addr)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("reconnect", &self.reconnect)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

/// Validate a `host:port` address. The host may be empty and port 0 asks
/// the OS for an ephemeral port when listening.
pub fn validate_address(addr: &str, kind: &'static str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidAddress {
        kind,
        address: addr.to_string(),
        reason: reason.to_string(),
    };

    let Some((_host, port)) = addr.rsplit_once(':') else {
        return Err(invalid("expected format host:port"));
    };

    port.parse::<u16>()
        .map(|_| ())
        .map_err(|_| invalid("port must be a number between 0 and 65535"))
}

/// Address to bind for `addr`; an empty host listens on all interfaces.
pub fn listen_address(addr: &str) -> String {
    with_default_host(addr, "0.0.0.0")
}

/// Address to dial for `addr`; an empty host means loopback.
pub fn dial_address(addr: &str) -> String {
    with_default_host(addr, "127.0.0.1")
}

fn with_default_host(addr: &str, host: &str) -> String {
    if addr.starts_with(':') {
        format!("{host}{addr}")
    } else {
        addr.to_string()
    }
}
