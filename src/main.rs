#![forbid(unsafe_code)]

//! `companion-bridge`: streaming bridge server binary.
//!
//! Bootstraps configuration and credentials, probes the assistant backend,
//! starts the idle eviction and health tasks, and serves HTTP plus the
//! `/ws` channel until ctrl-c / SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use companion_bridge::backend::process::ProcessBackend;
use companion_bridge::backend::Backend;
use companion_bridge::config::BridgeConfig;
use companion_bridge::server::{self, AppState};
use companion_bridge::session::eviction;
use companion_bridge::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "companion-bridge", about = "Streaming bridge to a code-assistant backend", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured HTTP port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("companion-bridge server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = BridgeConfig::load_from_path(&args.config)?;
    if let Some(port) = args.port {
        config.http_port = port;
    }
    config.load_credentials().await?;
    let config = Arc::new(config);
    info!(
        bind = %config.bind_address,
        port = config.http_port,
        host_cli = %config.backend.host_cli,
        "configuration loaded"
    );

    // ── Build shared application state ──────────────────
    let backend: Arc<dyn Backend> = Arc::new(ProcessBackend::new(config.backend.clone()));
    let state = Arc::new(AppState::new(Arc::clone(&config), backend));

    let report = state.health.check().await;
    if report.backend_available {
        info!(version = ?report.backend_version, "backend available");
    } else {
        warn!("backend unavailable at startup; /health will report degraded");
    }

    // ── Start background tasks ──────────────────────────
    let ct = CancellationToken::new();
    let mut tasks = Vec::new();
    if let Some(idle) = config.idle_timeout() {
        tasks.push(eviction::spawn_eviction_task(
            Arc::clone(state.manager.registry()),
            idle,
            Duration::from_secs(config.sessions.eviction_interval_seconds),
            ct.clone(),
        ));
        info!(idle_seconds = idle.as_secs(), "idle eviction started");
    }
    if config.backend.probe_interval_seconds > 0 {
        tasks.push(state.health.spawn_periodic(
            Duration::from_secs(config.backend.probe_interval_seconds),
            ct.clone(),
        ));
    }

    // ── Start HTTP server ───────────────────────────────
    let server_ct = ct.clone();
    let server_state = Arc::clone(&state);
    let server_handle = tokio::spawn(async move {
        if let Err(err) = server::serve(server_state, server_ct).await {
            error!(%err, "http server failed");
        }
    });

    info!("companion-bridge ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");

    ct.cancel();

    let _ = server_handle.await;
    for task in tasks {
        let _ = task.await;
    }
    info!("companion-bridge shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
