//! rqtunnel - reverse TCP tunnel
//!
//! Runs either the public server or the private-side agent, depending on
//! `--mode`, until Ctrl-C or SIGTERM.

mod discovery;
mod settings;

use anyhow::{Context, Result};
use clap::Parser;
use rqtunnel_server::{TunnelMode, TunnelService};
use settings::{load_config_file, Args, ConfigFile, LogTarget, Settings};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const CRATES: [&str; 5] = [
    "rqtunnel",
    "rqtunnel_server",
    "rqtunnel_connection",
    "rqtunnel_control",
    "rqtunnel_cipher",
];

/// Setup logging. `RUST_LOG` overrides the level chosen by `--verbose`.
fn setup_logging(verbose: bool, target: LogTarget) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let default_filter = CRATES
        .iter()
        .map(|krate| format!("{}={}", krate, level))
        .collect::<Vec<_>>()
        .join(",");

    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) => EnvFilter::try_new(&directives)
            .with_context(|| format!("Invalid RUST_LOG: {}", directives))?,
        Err(_) => EnvFilter::new(default_filter),
    };

    let writer = match target {
        LogTarget::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogTarget::Stderr => BoxMakeWriter::new(std::io::stderr),
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_writer(writer),
        )
        .with(filter)
        .init();

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose, args.log_to)?;

    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };
    let Settings { tunnel, discovery } = Settings::merge(&args, file)?;

    info!(
        version = env!("GIT_TAG"),
        commit = env!("GIT_HASH"),
        "Starting rqtunnel {}",
        tunnel.mode
    );

    let mode = tunnel.mode;
    let service = TunnelService::new(tunnel).context("Invalid tunnel configuration")?;
    service
        .start()
        .await
        .context("Failed to start tunnel service")?;

    let discovery_shutdown = CancellationToken::new();
    let discovery_task = match discovery {
        Some(settings) if mode == TunnelMode::Server => {
            let (_, handle) = discovery::spawn(
                &settings.addr,
                &settings.path,
                service.registry(),
                discovery_shutdown.clone(),
            )
            .await?;
            Some(handle)
        }
        Some(_) => {
            warn!("Discovery endpoint is only served in server mode, ignoring");
            None
        }
        None => None,
    };

    shutdown_signal().await;

    service.stop();
    service.wait_stopped().await;

    discovery_shutdown.cancel();
    if let Some(handle) = discovery_task {
        if let Err(e) = handle.await {
            warn!("Discovery endpoint task failed: {}", e);
        }
    }

    let stats = service.stats();
    info!(
        total_sessions = stats.total_sessions,
        bytes_in = stats.bytes_in,
        bytes_out = stats.bytes_out,
        "Shutdown complete"
    );
    Ok(())
}
