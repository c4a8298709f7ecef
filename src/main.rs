use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::clock::{Clock, SystemClock};
use gatekeeper::config::GatekeeperConfig;
use gatekeeper::http::{AppState, HttpServer, StaticCredentials};
use gatekeeper::throttle::{
    normalize_identifier, LimiterRules, LoginThrottle, Sweeper, WindowCounterStore,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Adaptive request throttling service.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// YAML configuration file; `GATEKEEPER__*` variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address, overrides the configured one
    #[arg(long)]
    addr: Option<SocketAddr>,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Account accepted by the login endpoint, as `identifier:password`
    #[arg(long = "user", value_parser = parse_user)]
    users: Vec<(String, String)>,
}

fn parse_user(value: &str) -> Result<(String, String), String> {
    match value.split_once(':') {
        Some((identifier, password)) if !normalize_identifier(identifier).is_empty() => {
            Ok((identifier.to_string(), password.to_string()))
        }
        _ => Err(format!("expected identifier:password, got '{}'", value)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting Gatekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = GatekeeperConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.http_addr = addr;
    }
    info!(http_addr = %config.server.http_addr, "Configuration loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let store = Arc::new(WindowCounterStore::new(clock.clone()));
    let rules = Arc::new(LimiterRules::from_config(&config.rate_limiting, store)?);
    let login_throttle = Arc::new(LoginThrottle::new(config.login_throttle.clone(), clock)?);

    let sweeper = {
        let rules = rules.clone();
        let login_throttle = login_throttle.clone();
        Sweeper::builder()
            .target("rate_limit", move || rules.sweep())
            .target("login_throttle", move || login_throttle.sweep())
            .spawn(Duration::from_millis(config.rate_limiting.sweep_interval_ms))
    };

    let verifier = args
        .users
        .iter()
        .try_fold(StaticCredentials::new(), |credentials, (identifier, password)| {
            credentials.with_user(identifier, password.clone())
        })?;
    if verifier.is_empty() {
        warn!("No accounts configured; every login attempt will fail");
    }

    let state = AppState::new(rules, login_throttle, Arc::new(verifier))
        .with_trusted_proxy_headers(config.server.trust_proxy_headers);
    let server = HttpServer::new(config.server.http_addr, state);

    info!("Starting HTTP server on {}", config.server.http_addr);

    // Run the server with graceful shutdown on Ctrl+C
    let served = server.serve_with_shutdown(shutdown_signal()).await;
    sweeper.shutdown().await;
    served?;

    info!("Gatekeeper stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
