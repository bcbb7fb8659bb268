//! GUI server gateway (guisrv-gateway) - Main entry point
//!
//! Proxies console WebSocket sessions to the control-plane API and runs
//! bundle deployments in isolated `guisrv-deployer` worker processes.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use guisrv_common::config::{resolve_config_path, TomlConfig};
use guisrv_gateway::{build_router, AppState, GatewayConfig};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for guisrv-gateway
#[derive(Parser, Debug)]
#[command(name = "guisrv-gateway")]
#[command(about = "WebSocket gateway and deployment scheduler for the GUI console")]
#[command(version)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, env = "GUISRV_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (host:port)
    #[arg(short, long, env = "GUISRV_LISTEN")]
    listen: Option<String>,

    /// Control-plane API WebSocket URL
    #[arg(long, env = "GUISRV_API_URL")]
    api_url: Option<String>,

    /// Maximum number of jobs running at once
    #[arg(long, env = "GUISRV_MAX_CONCURRENT_JOBS")]
    max_concurrent_jobs: Option<usize>,

    /// Seconds before a running job is killed
    #[arg(long, env = "GUISRV_JOB_TIMEOUT_SECS")]
    job_timeout_secs: Option<u64>,

    /// Worker executable
    #[arg(long, env = "GUISRV_WORKER_COMMAND")]
    worker_command: Option<PathBuf>,

    /// Log every relayed frame
    #[arg(long, env = "GUISRV_TRACE_FRAMES")]
    trace_frames: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "GUISRV_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Args {
    /// Apply CLI/ENV values on top of the file configuration
    fn apply(&self, config: &mut TomlConfig) {
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(api_url) = &self.api_url {
            config.backend.api_url = api_url.clone();
        }
        if let Some(max) = self.max_concurrent_jobs {
            config.scheduler.max_concurrent_jobs = max;
        }
        if let Some(secs) = self.job_timeout_secs {
            config.scheduler.job_timeout_secs = secs;
        }
        if let Some(command) = &self.worker_command {
            config.worker.command = Some(command.clone());
        }
        if self.trace_frames {
            config.trace_frames = true;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

fn log_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("guisrv_gateway={level},guisrv_common={level},tower_http=info").into()
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing; the level is refined once the config file is read
    let (filter, filter_handle) =
        reload::Layer::new(log_filter(args.log_level.as_deref().unwrap_or("info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting guisrv-gateway v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let config_path = resolve_config_path(args.config.as_deref());
    let mut toml_config =
        TomlConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut toml_config);

    filter_handle
        .reload(log_filter(&toml_config.logging.level))
        .context("Failed to apply log level")?;

    let config = GatewayConfig::from_toml(&toml_config).context("Invalid configuration")?;
    info!(
        api_url = %config.api_url,
        max_concurrent_jobs = config.max_concurrent_jobs,
        job_timeout_secs = config.job_timeout.as_secs(),
        worker = %config.worker_command.display(),
        trace_frames = config.trace_frames,
        "Configuration loaded"
    );

    let listen = config.listen.clone();
    let state = AppState::new(config);
    let shutdown = state.shutdown.clone();
    let driver = state.scheduler.start(shutdown.clone());

    let app = build_router(state);

    info!("Starting HTTP server on {}", listen);
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind to {}", listen))?;

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Open sessions and SSE streams hold the server open until cancelled
            signal_token.cancel();
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Err(e) = driver.await {
        error!("Scheduler task failed: {}", e);
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
