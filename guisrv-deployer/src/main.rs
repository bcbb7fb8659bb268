//! Deployment worker (guisrv-deployer) - Main entry point
//!
//! Not meant to be run by hand: guisrv-gateway spawns one worker per job
//! attempt and talks to it over stdin/stdout. Logs are written to stderr.

use std::io;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use guisrv_deployer::{run_job, ApiEngine, DeploymentEngine, DryRunEngine};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Engine {
    /// Deploy through the control-plane API
    Api,
    /// Report the plan only
    DryRun,
}

/// Command-line arguments for guisrv-deployer
#[derive(Parser, Debug)]
#[command(name = "guisrv-deployer")]
#[command(about = "Bundle deployment worker for guisrv-gateway")]
#[command(version)]
struct Args {
    /// Deployment engine
    #[arg(long, value_enum, default_value = "api", env = "GUISRV_DEPLOYER_ENGINE")]
    engine: Engine,

    /// Pause between dry-run steps (milliseconds)
    #[arg(long, default_value = "0", env = "GUISRV_DEPLOYER_STEP_DELAY_MS")]
    step_delay_ms: u64,
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "guisrv_deployer=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = Args::parse();
    info!(engine = ?args.engine, "guisrv-deployer v{} starting", env!("CARGO_PKG_VERSION"));

    let mut engine: Box<dyn DeploymentEngine> = match args.engine {
        Engine::Api => Box::new(ApiEngine::new()),
        Engine::DryRun => Box::new(DryRunEngine::new(Duration::from_millis(args.step_delay_ms))),
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let succeeded = run_job(stdin.lock(), &mut stdout, engine.as_mut())
        .context("Failed to report job outcome")?;

    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
