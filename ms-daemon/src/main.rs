//! Medisense bridge daemon (medisensed)
//!
//! Aggregates the kiosk's serial sensors (scale, thermometer, height gauge,
//! card reader) and serves the latest values over a line-based TCP protocol.
//!
//! # Lifecycle
//! - **Start-up**: parse arguments, load and validate configuration, open
//!   the serial channels (or fall back to simulation), bind the server
//! - **Running**: acquisition, sessions and the liveness monitor run until a
//!   termination signal arrives
//! - **Shutdown**: SIGINT/SIGTERM cancel every task; transports and sessions
//!   are closed before the process exits

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use medisense_daemon::{Bridge, SerialConnector};
use ms_core::constants::paths;
use ms_core::{load_config, resolve_config_path, ConfigSource};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// CLI
// ============================================================================

#[derive(Debug, Default)]
struct CliOptions {
    config: Option<PathBuf>,
    simulate: bool,
    bind: Option<String>,
}

fn print_help() {
    eprintln!("medisensed {} - Medisense sensor aggregation bridge", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    medisensed [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config PATH   Configuration file (default {})", paths::CONFIG_FILE);
    eprintln!("    -s, --simulate      Ignore serial ports and simulate the sensors");
    eprintln!("    -b, --bind ADDR     Listen address (default 127.0.0.1:8765)");
    eprintln!("    -v, --version       Print version");
    eprintln!("    -h, --help          Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    {}    Configuration file path", paths::CONFIG_ENV);
    eprintln!("    {}       Log filter (trace, debug, info, warn, error)", paths::LOG_ENV);
}

fn print_version() {
    println!("medisensed {}", VERSION);
}

/// Parse arguments. `None` means the process should exit successfully.
fn parse_args(args: &[String]) -> anyhow::Result<Option<CliOptions>> {
    let mut options = CliOptions::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            "-v" | "--version" => {
                print_version();
                return Ok(None);
            }
            "-s" | "--simulate" => options.simulate = true,
            "-c" | "--config" => {
                i += 1;
                let path = args.get(i).context("--config requires a path argument")?;
                options.config = Some(PathBuf::from(path));
            }
            "-b" | "--bind" => {
                i += 1;
                let addr = args.get(i).context("--bind requires an address argument")?;
                options.bind = Some(addr.clone());
            }
            arg => {
                print_help();
                anyhow::bail!("unknown argument: {}", arg);
            }
        }
        i += 1;
    }

    Ok(Some(options))
}

// ============================================================================
// Logging
// ============================================================================

/// Log to the systemd journal when available, stdout otherwise.
/// Returns true when the journal is used.
fn init_logging() -> bool {
    let filter = std::env::var(paths::LOG_ENV).unwrap_or_else(|_| "info".to_string());

    if Path::new("/run/systemd/journal/socket").exists() {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(&filter))
                    .init();
                return true;
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stdout", e);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(tracing_subscriber::EnvFilter::new(&filter))
        .init();
    false
}

// ============================================================================
// Signals
// ============================================================================

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // PHASE 1: Arguments
    let args: Vec<String> = std::env::args().collect();
    let Some(options) = parse_args(&args)? else {
        return Ok(());
    };

    // PHASE 2: Logging
    let journald = init_logging();
    info!("STARTUP: medisensed {} starting", VERSION);
    info!("STARTUP: logging to {}", if journald { "systemd journal" } else { "stdout" });

    // PHASE 3: Configuration (the only fatal errors)
    let source = resolve_config_path(options.config.as_deref());
    if let ConfigSource::Explicit(path) | ConfigSource::Default(path) = &source {
        info!("STARTUP: configuration {}", path.display());
    }
    let mut config = load_config(&source).context("failed to load configuration")?;
    if options.simulate {
        config.acquisition.force_simulation = true;
    }
    if let Some(bind) = options.bind {
        config.server.bind = bind;
    }
    let catalog = config.validate().context("invalid configuration")?;

    // PHASE 4: Start tasks
    let cancel = CancellationToken::new();
    let bridge = Bridge::launch(&config, catalog, Arc::new(SerialConnector), cancel.clone())
        .await
        .context("failed to start bridge")?;
    info!("STARTUP: ready on {}", bridge.local_addr());

    // PHASE 5: Run until signalled
    if let Err(e) = wait_for_shutdown_signal().await {
        error!("Failed to listen for shutdown signals: {}", e);
        warn!("SHUTDOWN: stopping because signal handling is unavailable");
    } else {
        info!("SIGNAL: termination requested - initiating shutdown");
    }

    // PHASE 6: Shutdown
    cancel.cancel();
    bridge.wait().await;
    info!("SHUTDOWN: medisensed terminated gracefully");

    Ok(())
}
