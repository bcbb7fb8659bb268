//! Deployment scheduler
//!
//! Accepts import requests, queues them as jobs and starts them in FIFO
//! order with at most `max_concurrent_jobs` running at once. Each running
//! job holds one semaphore permit until it reaches a terminal state.

use guisrv_common::protocol::Credentials;
use guisrv_common::{Bundle, BundleError};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::GatewayConfig;
use crate::jobs::{JobId, NewJob, SessionId, StatusRegistry};
use crate::supervisor::WorkerSupervisor;

/// Bundle name used when the request does not provide one
pub const DEFAULT_BUNDLE_NAME: &str = "bundle";

/// How the bundle contents were provided
#[derive(Debug, Clone, PartialEq)]
pub enum BundleSource {
    /// Already-structured payload (JSON object)
    Structured(Value),
    /// YAML text, optionally with the bundle format version
    Yaml {
        contents: String,
        version: Option<u64>,
    },
}

/// A deployment request from a console session or the HTTP API
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRequest {
    pub name: Option<String>,
    pub bundle_id: Option<String>,
    pub source: BundleSource,
}

impl ImportRequest {
    pub fn structured(bundle: Value) -> Self {
        Self {
            name: None,
            bundle_id: None,
            source: BundleSource::Structured(bundle),
        }
    }

    /// Check well-formedness and resolve the bundle name
    pub fn into_bundle(self) -> Result<(String, Option<String>, Bundle), BundleError> {
        match self.source {
            BundleSource::Structured(value) => {
                let bundle = Bundle::from_value(value)?;
                let name = self
                    .name
                    .or_else(|| self.bundle_id.clone())
                    .unwrap_or_else(|| DEFAULT_BUNDLE_NAME.to_string());
                Ok((name, self.bundle_id, bundle))
            }
            BundleSource::Yaml { contents, version } => {
                let (name, bundle) =
                    Bundle::from_yaml(&contents, version, self.name.as_deref())?;
                Ok((name, self.bundle_id, bundle))
            }
        }
    }
}

#[derive(Clone)]
pub struct Scheduler {
    registry: Arc<StatusRegistry>,
    supervisor: Arc<WorkerSupervisor>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Scheduler {
    pub fn new(config: Arc<GatewayConfig>, registry: Arc<StatusRegistry>) -> Self {
        let max_concurrent = config.max_concurrent_jobs.max(1);
        Self {
            supervisor: Arc::new(WorkerSupervisor::new(config, registry.clone())),
            registry,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Validate and queue a deployment; returns without waiting for it
    pub fn submit(
        &self,
        session: Option<SessionId>,
        credentials: Option<Credentials>,
        request: ImportRequest,
    ) -> Result<JobId, BundleError> {
        let (name, bundle_id, bundle) = request.into_bundle()?;
        Ok(self.registry.submit(NewJob {
            session,
            name,
            bundle_id,
            bundle,
            credentials,
        }))
    }

    /// Cancel a queued job; false when it already started or is unknown
    pub fn cancel(&self, id: JobId) -> bool {
        self.registry.cancel(id)
    }

    pub fn registry(&self) -> &Arc<StatusRegistry> {
        &self.registry
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Number of jobs currently holding a permit
    pub fn running(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    /// Spawn the driver loop; it stops when `shutdown` is cancelled
    pub fn start(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.drive(shutdown).await })
    }

    async fn drive(self, shutdown: CancellationToken) {
        info!(max_concurrent = self.max_concurrent, "Scheduler started");
        let mut workers = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(res) = workers.join_next(), if !workers.is_empty() => {
                    log_worker_exit(res);
                    continue;
                }
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = loop {
                if let Some(job) = self.registry.claim_next() {
                    break Some(job);
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break None,
                    _ = self.registry.job_queued() => {}
                    Some(res) = workers.join_next(), if !workers.is_empty() => {
                        log_worker_exit(res);
                    }
                }
            };
            let Some(job) = job else { break };

            let supervisor = self.supervisor.clone();
            workers.spawn(async move {
                let _permit = permit;
                supervisor.run(job).await;
            });
        }

        // Dropping the tasks drops their Child handles, which kills the workers
        workers.abort_all();
        while workers.join_next().await.is_some() {}
        info!("Scheduler stopped");
    }
}

fn log_worker_exit(res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        if !e.is_cancelled() {
            error!("Worker task failed: {}", e);
        }
    }
}
