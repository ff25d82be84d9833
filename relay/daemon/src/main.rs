//! Relay Daemon - API Gateway Server
//!
//! Entry point for the relay gateway. Loads configuration, wires the relay
//! orchestrator and serves the general proxy route over HTTP.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (~/.config/relay-gateway/gateway.toml)
//! relay-daemon
//!
//! # Explicit config file and listen address
//! relay-daemon --config /etc/relay/gateway.toml --listen 0.0.0.0:3000
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown (in-flight requests finish)

mod server;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use relay_core::config::{default_config_path, load_config_from_path, ConfigOverrides};

use server::AppState;

/// Relay Daemon - Multi-channel API gateway
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address (host:port)
    #[arg(short = 'L', long, value_name = "ADDR")]
    listen: Option<String>,

    /// Retries after the first attempt
    #[arg(long, value_name = "N")]
    max_retries: Option<u32>,

    /// Channel cooldown window in seconds (0 disables)
    #[arg(long, value_name = "SECS")]
    cooldown_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Resolves when SIGINT or SIGTERM arrives
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, initiating shutdown"),
        () = terminate => info!("Received SIGTERM, initiating shutdown"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level);
    server::install_panic_hook();

    info!("Relay daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(listen) = args.listen {
        overrides = overrides.with_listen(listen);
    }
    if let Some(retries) = args.max_retries {
        overrides = overrides.with_max_retries(retries);
    }
    if let Some(secs) = args.cooldown_secs {
        overrides = overrides.with_cooldown_secs(secs);
    }
    overrides.apply(&mut config);

    info!(
        source = %config.source(),
        config_path = ?config.config_file_path,
        channels = config.channels.len(),
        callers = config.callers.len(),
        max_retries = config.relay.max_retries,
        cooldown_secs = config.health.cooldown.as_secs(),
        "Configuration loaded"
    );

    let state = AppState::from_config(&config)?;
    let relay = std::sync::Arc::clone(state.relay());
    let app = server::router(state);

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen))?;
    info!(listen = %config.listen, prefix = %relay.forwarder().route_prefix(), "Listening for requests");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Shutting down...");
    let snapshot = relay.metrics().snapshot();
    let ledger = relay.ledger().stats();
    info!(
        requests = snapshot.requests_total,
        succeeded = snapshot.requests_succeeded,
        exhausted = snapshot.requests_exhausted,
        quota_rejections = snapshot.quota_rejections,
        attempts = snapshot.attempts_total,
        retries = snapshot.retries_total,
        channels_disabled = snapshot.channels_disabled,
        success_rate = snapshot.success_rate(),
        attempt_p50_ms = snapshot.attempt_latency.p50(),
        attempt_p99_ms = snapshot.attempt_latency.p99(),
        reservations_outstanding = ledger.outstanding(),
        "Final relay metrics"
    );

    match result {
        Ok(()) => {
            info!("Relay daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e.into())
        }
    }
}
