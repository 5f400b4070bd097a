//! Mediaproxy Dispatcher
//!
//! Dispatching tier for a media-relay cluster: routes SIP proxy control
//! requests to a pool of mutually-authenticated RTP relay nodes.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mediaproxy_dispatcher::{
    config::{ConfigManager, ConfigWatcher},
    Dispatcher,
};

/// CLI arguments for the dispatcher.
#[derive(Parser, Debug)]
#[command(name = "mediaproxy-dispatcher")]
#[command(about = "Dispatcher tier for a media-relay cluster")]
#[command(version)]
#[command(long_about = "
Mediaproxy Dispatcher

Multiplexes SIP proxy control requests over a pool of mutually-
authenticated RTP relay nodes, maintaining call-id affinity and fanning
session-termination statistics out to accounting backends.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  DISPATCHER_LISTEN_ADDR     - Relay TLS listen address
  DISPATCHER_CONTROL_SOCKET  - Control UNIX socket path
  DISPATCHER_RELAY_TIMEOUT   - Per-command reply deadline (e.g., 5s)
  DISPATCHER_CLEANUP_TIMEOUT - Session cleanup grace period (e.g., 1h)
  DISPATCHER_LOG_LEVEL       - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", help = "Path to configuration file")]
    pub config: PathBuf,

    /// Relay TLS listen address (overrides config file)
    #[arg(long, help = "Relay TLS listen address, e.g. 0.0.0.0:25060")]
    pub listen_addr: Option<String>,

    /// Control UNIX socket path (overrides config file)
    #[arg(long, help = "Control socket path")]
    pub control_socket: Option<String>,

    /// Per-command relay reply deadline in seconds (overrides config file)
    #[arg(long, help = "Relay command timeout in seconds")]
    pub relay_timeout: Option<u64>,

    /// Session cleanup grace period in seconds (overrides config file)
    #[arg(long, help = "Session cleanup timeout in seconds")]
    pub cleanup_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", help = "Log level")]
    pub log_level: String,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args)?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting mediaproxy-dispatcher");

    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        info!("config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(
        args.listen_addr.as_deref(),
        args.control_socket.as_deref(),
        args.relay_timeout,
        args.cleanup_timeout,
        Some(&args.log_level),
    );

    if let Err(e) = config.validate().context("final configuration validation failed") {
        error!(error = %e, "configuration is invalid");
        return Err(e);
    }

    if args.validate_config {
        info!("configuration is valid");
        info!(listen_addr = %config.server.listen_addr, "relay listener");
        info!(control_socket = %config.server.control_socket_path.display(), "control socket");
        info!(backends = ?config.accounting.backends, "accounting");
        info!(relay_timeout = ?config.server.relay_timeout, cleanup_timeout = ?config.server.cleanup_timeout, "timeouts");
        return Ok(());
    }

    info!(listen_addr = %config.server.listen_addr, control_socket = %config.server.control_socket_path.display(), "configuration loaded");

    let mut dispatcher = Dispatcher::new(config.clone())?;

    if config.monitoring.config_reload {
        match ConfigWatcher::new(args.config.clone()) {
            Ok(watcher) => {
                dispatcher = dispatcher.with_config_watcher(watcher);
            }
            Err(e) => {
                error!(error = %e, "failed to start config watcher, continuing without hot-reload");
            }
        }
    }

    dispatcher.run().await?;

    info!("dispatcher shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs) -> Result<()> {
    let log_level = if args.verbose { "debug" } else { &args.log_level };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
