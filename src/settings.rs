//! Command-line arguments, the optional YAML file, and how they combine
//! into a [`TunnelConfig`]. Flags always win over the file.

use crate::discovery;
use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use rqtunnel_server::{ReconnectConfig, TunnelConfig, TunnelMode};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Public side: accepts agent links and users
    Server,
    /// Private side: dials the server and the local service
    Agent,
}

impl From<Mode> for TunnelMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Server => TunnelMode::Server,
            Mode::Agent => TunnelMode::Agent,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogTarget {
    Stdout,
    #[default]
    Stderr,
}

/// rqtunnel - expose a private TCP service through a public relay
#[derive(Parser, Debug)]
#[command(name = "rqtunnel")]
#[command(about = "Expose a private TCP service through a public relay")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(long_about = r#"
rqtunnel runs on both sides of a reverse tunnel. The agent, next to a
private service, dials out to the server; the server hands every user
connection it accepts to one of those agent links.

EXAMPLES:
  # Public host: agents connect on :8000, users on :9000
  rqtunnel --mode server --tunnel-addr :8000 --service-addr :9000 --secret s3cret

  # Private host: forward tunnel links to the local SSH daemon
  rqtunnel --mode agent --tunnel-addr relay.example.com:8000 \
    --service-addr 127.0.0.1:22 --secret s3cret

  # Server with a discovery endpoint and agent liveness checks
  rqtunnel --mode server --tunnel-addr :8000 --service-addr :9000 \
    --control-addr :8001 --discovery-addr 0.0.0.0:8080 --secret s3cret

  # Load settings from a file
  rqtunnel --config tunnel.yaml

ENVIRONMENT VARIABLES:
  RQTUNNEL_MODE          server or agent
  RQTUNNEL_TUNNEL_ADDR   Agent-link listen address / server address
  RQTUNNEL_SERVICE_ADDR  User listen address / local service address
  RQTUNNEL_CIPHER        Tunnel cipher (rc4, none)
  RQTUNNEL_SECRET        Shared secret
"#)]
pub struct Args {
    /// Which side of the tunnel to run
    #[arg(long, value_enum, env = "RQTUNNEL_MODE")]
    pub mode: Option<Mode>,

    /// Server: where agents connect. Agent: the server to dial.
    #[arg(long, env = "RQTUNNEL_TUNNEL_ADDR")]
    pub tunnel_addr: Option<String>,

    /// Server: where users connect. Agent: the private service to dial.
    #[arg(long, env = "RQTUNNEL_SERVICE_ADDR")]
    pub service_addr: Option<String>,

    /// Cipher applied to tunnel links (rc4, none) [default: rc4]
    #[arg(long, env = "RQTUNNEL_CIPHER")]
    pub cipher: Option<String>,

    /// Shared secret both sides derive the cipher key from
    #[arg(long, env = "RQTUNNEL_SECRET", hide_env_values = true)]
    pub secret: Option<String>,

    /// Maximum pending links and concurrent relays [default: 4096]
    #[arg(long, env = "RQTUNNEL_CAPACITY")]
    pub capacity: Option<usize>,

    /// Size of each relay buffer in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Agent: links kept dialed toward the server [default: 1]
    #[arg(long, env = "RQTUNNEL_LINKS")]
    pub links: Option<usize>,

    /// Tunnel name registered for discovery
    #[arg(long, env = "RQTUNNEL_NAME")]
    pub name: Option<String>,

    /// Server: control channel listen address. Agent: control address to dial.
    #[arg(long, env = "RQTUNNEL_CONTROL_ADDR")]
    pub control_addr: Option<String>,

    /// Seconds between agent heartbeats [default: 5]
    #[arg(long)]
    pub heartbeat_secs: Option<u64>,

    /// Agent: first reconnect delay in milliseconds [default: 1000]
    #[arg(long)]
    pub reconnect_initial_ms: Option<u64>,

    /// Agent: longest reconnect delay in seconds [default: 60]
    #[arg(long)]
    pub reconnect_max_secs: Option<u64>,

    /// Seconds to let active sessions finish on shutdown [default: 10]
    #[arg(long)]
    pub shutdown_grace: Option<u64>,

    /// Server: serve the tunnel list over HTTP on this address
    #[arg(long, env = "RQTUNNEL_DISCOVERY_ADDR")]
    pub discovery_addr: Option<String>,

    /// Path of the discovery endpoint [default: /listItem]
    #[arg(long)]
    pub discovery_path: Option<String>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Where log lines go
    #[arg(long, value_enum, default_value_t = LogTarget::Stderr)]
    pub log_to: LogTarget,
}

/// Configuration file format
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub mode: Option<Mode>,
    pub tunnel_addr: Option<String>,
    pub service_addr: Option<String>,
    pub cipher: Option<String>,
    pub secret: Option<String>,
    /// Name of an environment variable holding the secret
    pub secret_env: Option<String>,
    pub capacity: Option<usize>,
    pub buffer_size: Option<usize>,
    pub links: Option<usize>,
    pub name: Option<String>,
    pub control_addr: Option<String>,
    pub heartbeat_secs: Option<u64>,
    pub shutdown_grace: Option<u64>,
    pub reconnect: ReconnectFile,
    pub discovery: DiscoveryFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReconnectFile {
    pub initial_ms: Option<u64>,
    pub max_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DiscoveryFile {
    pub addr: Option<String>,
    pub path: Option<String>,
}

/// Where and how to serve discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverySettings {
    pub addr: String,
    pub path: String,
}

/// Everything the binary needs after merging flags and file
#[derive(Debug)]
pub struct Settings {
    pub tunnel: TunnelConfig,
    pub discovery: Option<DiscoverySettings>,
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

impl Settings {
    /// Merge CLI args with config file, giving precedence to CLI args
    pub fn merge(args: &Args, file: ConfigFile) -> Result<Self> {
        let mode = args
            .mode
            .or(file.mode)
            .context("No mode given (use --mode server|agent)")?;
        let tunnel_addr = args
            .tunnel_addr
            .clone()
            .or(file.tunnel_addr)
            .context("No tunnel address given (use --tunnel-addr)")?;
        let service_addr = args
            .service_addr
            .clone()
            .or(file.service_addr)
            .context("No service address given (use --service-addr)")?;

        let mut tunnel = match mode {
            Mode::Server => TunnelConfig::server(tunnel_addr, service_addr),
            Mode::Agent => TunnelConfig::agent(tunnel_addr, service_addr),
        };

        let secret = match (&args.secret, file.secret, &file.secret_env) {
            (Some(secret), _, _) => secret.clone(),
            (None, Some(secret), _) => secret,
            (None, None, Some(var)) => std::env::var(var)
                .with_context(|| format!("Secret variable {} is not set", var))?,
            (None, None, None) => String::new(),
        };
        let cipher = args
            .cipher
            .clone()
            .or(file.cipher)
            .unwrap_or_else(|| tunnel.cipher_method.clone());
        tunnel = tunnel.with_cipher(cipher, secret);

        if let Some(capacity) = args.capacity.or(file.capacity) {
            tunnel = tunnel.with_capacity(capacity);
        }
        if let Some(size) = args.buffer_size.or(file.buffer_size) {
            tunnel = tunnel.with_buffer_size(size);
        }
        if let Some(links) = args.links.or(file.links) {
            tunnel = tunnel.with_links(links);
        }
        if let Some(name) = args.name.clone().or(file.name) {
            tunnel = tunnel.with_tunnel_name(name);
        }
        if let Some(addr) = args.control_addr.clone().or(file.control_addr) {
            tunnel = tunnel.with_control_addr(addr);
        }
        if let Some(secs) = args.heartbeat_secs.or(file.heartbeat_secs) {
            tunnel = tunnel.with_heartbeat(Duration::from_secs(secs));
        }
        if let Some(secs) = args.shutdown_grace.or(file.shutdown_grace) {
            tunnel = tunnel.with_shutdown_grace(Duration::from_secs(secs));
        }

        let defaults = ReconnectConfig::default();
        let initial = args
            .reconnect_initial_ms
            .or(file.reconnect.initial_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.initial_backoff);
        let max = args
            .reconnect_max_secs
            .or(file.reconnect.max_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.max_backoff);
        if max < initial {
            bail!(
                "Reconnect delay cap ({:?}) is below the initial delay ({:?})",
                max,
                initial
            );
        }
        tunnel = tunnel.with_backoff(ReconnectConfig {
            initial_backoff: initial,
            max_backoff: max,
            multiplier: defaults.multiplier,
        });

        let discovery = args
            .discovery_addr
            .clone()
            .or(file.discovery.addr)
            .map(|addr| {
                let path = args
                    .discovery_path
                    .clone()
                    .or(file.discovery.path)
                    .unwrap_or_else(|| discovery::DEFAULT_PATH.to_string());
                DiscoverySettings {
                    addr,
                    path: normalize_path(&path),
                }
            });

        Ok(Self { tunnel, discovery })
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("rqtunnel").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_server_from_flags() {
        let args = parse(&[
            "--mode",
            "server",
            "--tunnel-addr",
            ":8000",
            "--service-addr",
            ":9000",
            "--secret",
            "s3cret",
        ]);
        let settings = Settings::merge(&args, ConfigFile::default()).unwrap();

        let tunnel = &settings.tunnel;
        assert_eq!(tunnel.mode, TunnelMode::Server);
        assert_eq!(tunnel.tunnel_addr, ":8000");
        assert_eq!(tunnel.service_addr, ":9000");
        assert_eq!(tunnel.cipher_method, "rc4");
        assert_eq!(tunnel.secret, "s3cret");
        assert_eq!(tunnel.capacity, 4096);
        assert!(settings.discovery.is_none());
        assert!(tunnel.validate().is_ok());
    }

    #[test]
    fn test_missing_mode_is_an_error() {
        let args = parse(&["--tunnel-addr", ":8000", "--service-addr", ":9000"]);
        let err = Settings::merge(&args, ConfigFile::default()).unwrap_err();
        assert!(err.to_string().contains("--mode"));
    }

    #[test]
    fn test_file_values_are_used() {
        let yaml = r#"
mode: agent
tunnel_addr: relay.example.com:8000
service_addr: 127.0.0.1:22
cipher: none
links: 4
name: ssh
reconnect:
  initial_ms: 250
  max_secs: 5
"#;
        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        let settings = Settings::merge(&parse(&[]), file).unwrap();

        let tunnel = &settings.tunnel;
        assert_eq!(tunnel.mode, TunnelMode::Agent);
        assert_eq!(tunnel.cipher_method, "none");
        assert_eq!(tunnel.links, 4);
        assert_eq!(tunnel.tunnel_name.as_deref(), Some("ssh"));
        assert_eq!(tunnel.reconnect.initial_backoff, Duration::from_millis(250));
        assert_eq!(tunnel.reconnect.max_backoff, Duration::from_secs(5));
    }

    #[test]
    fn test_flags_override_file() {
        let yaml = r#"
mode: agent
tunnel_addr: relay.example.com:8000
service_addr: 127.0.0.1:22
secret: from-file
capacity: 10
"#;
        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        let args = parse(&[
            "--service-addr",
            "127.0.0.1:2222",
            "--secret",
            "from-flag",
            "--capacity",
            "20",
        ]);
        let settings = Settings::merge(&args, file).unwrap();

        assert_eq!(settings.tunnel.service_addr, "127.0.0.1:2222");
        assert_eq!(settings.tunnel.secret, "from-flag");
        assert_eq!(settings.tunnel.capacity, 20);
    }

    #[test]
    fn test_discovery_settings() {
        let args = parse(&[
            "--mode",
            "server",
            "--tunnel-addr",
            ":8000",
            "--service-addr",
            ":9000",
            "--discovery-addr",
            "127.0.0.1:8080",
        ]);
        let settings = Settings::merge(&args, ConfigFile::default()).unwrap();
        assert_eq!(
            settings.discovery,
            Some(DiscoverySettings {
                addr: "127.0.0.1:8080".to_string(),
                path: "/listItem".to_string(),
            })
        );

        let file: ConfigFile = serde_yaml::from_str("discovery:\n  path: tunnels\n").unwrap();
        let settings = Settings::merge(&args, file).unwrap();
        assert_eq!(settings.discovery.unwrap().path, "/tunnels");
    }

    #[test]
    fn test_reconnect_cap_below_initial() {
        let args = parse(&[
            "--mode",
            "agent",
            "--tunnel-addr",
            "relay:8000",
            "--service-addr",
            ":22",
            "--reconnect-initial-ms",
            "5000",
            "--reconnect-max-secs",
            "1",
        ]);
        assert!(Settings::merge(&args, ConfigFile::default()).is_err());
    }

    #[test]
    fn test_oversized_heartbeat_is_reported_not_panicked() {
        let max = u64::MAX.to_string();
        let max = max.as_str();
        let args = parse(&[
            "--mode",
            "server",
            "--tunnel-addr",
            ":8000",
            "--service-addr",
            ":9000",
            "--cipher",
            "none",
            "--heartbeat-secs",
            max,
            "--shutdown-grace",
            max,
        ]);
        let settings = Settings::merge(&args, ConfigFile::default()).unwrap();
        assert!(settings.tunnel.validate().is_err());
    }

    #[test]
    fn test_unknown_mode_is_rejected_by_clap() {
        let result = Args::try_parse_from(["rqtunnel", "--mode", "relay"]);
        assert!(result.is_err());
    }
}
