#![forbid(unsafe_code)]

//! `live-harness` — remote test host for a running application.
//!
//! Bootstraps configuration, builds the simulated target and the execution
//! engine, starts the frame loop, and accepts operator connections until a
//! shutdown signal or a fatal host error.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use live_harness::config::GlobalConfig;
use live_harness::engine::{driver, Engine};
use live_harness::host::Host;
use live_harness::target::{SimulatedTarget, TargetApp};
use live_harness::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "live-harness", about = "Remote test host for a live application", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the listening port from the configuration.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("live-harness bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    config.load_credentials().await?;
    let config = Arc::new(config);
    info!("configuration loaded");

    // ── Target and engine ───────────────────────────────
    let target: Arc<dyn TargetApp> = Arc::new(SimulatedTarget::from_config(&config.target));
    let engine = Arc::new(Engine::new(target, config.engine.pause_grace()));

    let frames_ct = CancellationToken::new();
    let frame_loop = driver::spawn_frame_loop(
        Arc::clone(&engine),
        config.engine.frame_period(),
        frames_ct.clone(),
    );
    info!(frame_rate = config.engine.frame_rate, "frame loop started");

    // ── Host ────────────────────────────────────────────
    let supervisor = CancellationToken::new();
    let host = Host::bind(Arc::clone(&config), Arc::clone(&engine), supervisor.clone()).await?;
    host.spawn()?;
    info!(addr = %host.local_addr(), "live-harness ready");

    // ── Wait for shutdown signal or host abort ──────────
    tokio::select! {
        () = shutdown_signal() => info!("shutdown signal received"),
        () = supervisor.cancelled() => {
            error!(reason = ?host.abort_reason(), "host aborted");
        }
    }

    host.stop().await;
    frames_ct.cancel();
    if let Err(err) = frame_loop.await {
        error!(%err, "frame loop task failed");
    }
    info!("live-harness shut down");

    match host.abort_reason() {
        Some(reason) => Err(AppError::Host(reason)),
        None => Ok(()),
    }
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
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
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
