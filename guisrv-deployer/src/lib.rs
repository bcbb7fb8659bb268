//! guisrv-deployer: isolated deployment worker
//!
//! Spawned once per job attempt by guisrv-gateway. Reads one
//! `WorkerRequest` line on stdin, drives a [`DeploymentEngine`] and
//! reports NDJSON `WorkerMessage`s on stdout. Logs go to stderr.

pub mod api;
pub mod dry_run;
pub mod engine;
pub mod runner;

pub use api::ApiEngine;
pub use dry_run::DryRunEngine;
pub use engine::{DeploymentEngine, EngineError};
pub use runner::run_job;
