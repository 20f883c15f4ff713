//! MediaBus Server - standalone headless host.
//!
//! Shares a local folder to LAN browsers over HTTPS without a GUI. Pairing
//! requests surface in the log with their six-digit code; embedded
//! deployments approve them through the host state stream instead.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mediabus_core::bootstrap_services;
use tokio::signal;

/// MediaBus Server - private LAN file sharing over HTTPS.
#[derive(Parser, Debug)]
#[command(name = "mediabus-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory for persistent state (paired devices, TLS identity).
    #[arg(short = 'd', long, env = "MEDIABUS_DATA_DIR")]
    data_dir: PathBuf,

    /// Folder to share with paired browsers.
    #[arg(short = 's', long, env = "MEDIABUS_SHARED_FOLDER")]
    shared_folder: Option<PathBuf>,

    /// Show hidden (dot-prefixed) entries to browsers.
    #[arg(long, env = "MEDIABUS_SHOW_HIDDEN")]
    show_hidden: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "MEDIABUS_LOG_LEVEL")]
    log_level: log::LevelFilter,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("MediaBus Server v{}", env!("CARGO_PKG_VERSION"));

    let services =
        bootstrap_services(&args.data_dir).context("Failed to bootstrap core services")?;

    if let Some(folder) = args.shared_folder {
        let folder = folder
            .canonicalize()
            .with_context(|| format!("Shared folder {:?} is not accessible", folder))?;
        log::info!("Sharing folder {}", folder.display());
        services
            .store
            .update_settings(|s| {
                s.shared_folder_path = Some(folder.clone());
                s.show_hidden_files = args.show_hidden;
            })
            .context("Failed to persist shared folder setting")?;
    } else {
        log::warn!("No shared folder configured - file operations will fail until one is set");
    }

    services.supervisor.start().await;

    let state = services.supervisor.watch_state().borrow().clone();
    if let Some(error) = state.error {
        anyhow::bail!("Failed to start: {}", error);
    }
    log::info!("{}", state.status_text);

    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");
    services.shutdown().await;
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
