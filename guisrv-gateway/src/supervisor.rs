//! Worker supervisor
//!
//! Runs each claimed job in its own `guisrv-deployer` child process:
//! one [`WorkerRequest`] line goes to the child's stdin, NDJSON
//! [`WorkerMessage`]s come back on stdout. The supervisor turns the worker's
//! report (or its absence) into exactly one terminal registry transition.
//!
//! Every spawned child is reaped: after a terminal message it gets a short
//! grace period to exit on its own and is killed otherwise.

use guisrv_common::protocol::{decode_line, encode_line, WorkerMessage, WorkerRequest};
use serde_json::Value;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::jobs::{ClaimedJob, ErrorKind, JobError, StatusRegistry};

/// How one worker attempt ended
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Completed(Value),
    Failed(JobError),
}

pub struct WorkerSupervisor {
    config: Arc<GatewayConfig>,
    registry: Arc<StatusRegistry>,
}

impl WorkerSupervisor {
    pub fn new(config: Arc<GatewayConfig>, registry: Arc<StatusRegistry>) -> Self {
        Self { config, registry }
    }

    /// Drive a Started job to its terminal state
    pub async fn run(&self, mut job: ClaimedJob) {
        loop {
            match self.run_attempt(&job).await {
                AttemptOutcome::Completed(payload) => {
                    if let Err(e) = self.registry.complete(job.id, payload) {
                        error!(job_id = job.id, "Failed to record completion: {}", e);
                    }
                }
                AttemptOutcome::Failed(err)
                    if err.kind == ErrorKind::WorkerLost
                        && self.config.retry_worker_lost
                        && job.attempt < 2 =>
                {
                    match self.registry.retry(job.id, &err.detail) {
                        Ok(attempt) => {
                            job.attempt = attempt;
                            continue;
                        }
                        Err(e) => {
                            error!(job_id = job.id, "Failed to record retry: {}", e);
                            if let Err(e) = self.registry.fail(job.id, err) {
                                error!(job_id = job.id, "Failed to record error: {}", e);
                            }
                        }
                    }
                }
                AttemptOutcome::Failed(err) => {
                    if let Err(e) = self.registry.fail(job.id, err) {
                        error!(job_id = job.id, "Failed to record error: {}", e);
                    }
                }
            }
            break;
        }
    }

    /// Spawn one worker for the job and wait for its report
    pub async fn run_attempt(&self, job: &ClaimedJob) -> AttemptOutcome {
        let request = WorkerRequest {
            job_id: job.id,
            name: job.name.clone(),
            api_url: self.config.api_url.clone(),
            credentials: job.credentials.clone(),
            bundle: job.bundle.clone(),
        };
        let line = match encode_line(&request) {
            Ok(line) => line,
            Err(e) => return lost(format!("cannot encode worker request: {}", e)),
        };

        let command = &self.config.worker_command;
        let mut child = match Command::new(command)
            .args(&self.config.worker_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return lost(format!(
                    "cannot spawn worker {}: {}",
                    command.display(),
                    e
                ))
            }
        };
        info!(
            job_id = job.id,
            attempt = job.attempt,
            pid = ?child.id(),
            "Worker spawned"
        );

        let deadline = tokio::time::Instant::now() + self.config.job_timeout;

        // Written alongside the read loop: a worker that never drains stdin
        // must still hit the deadline
        let writer = child.stdin.take().map(|mut stdin| {
            let job_id = job.id;
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    // The read loop reports the lost worker
                    warn!(job_id, "Failed to send job to worker: {}", e);
                }
            })
        });

        if let Some(stderr) = child.stderr.take() {
            let job_id = job.id;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(job_id, "worker: {}", line);
                }
            });
        }

        let outcome = match child.stdout.take() {
            Some(stdout) => self.read_report(job, &mut child, stdout, deadline).await,
            None => lost("worker stdout unavailable".to_string()),
        };
        self.reap(&mut child, job).await;
        if let Some(writer) = writer {
            writer.abort();
        }
        outcome
    }

    async fn read_report(
        &self,
        job: &ClaimedJob,
        child: &mut Child,
        stdout: tokio::process::ChildStdout,
        deadline: tokio::time::Instant,
    ) -> AttemptOutcome {
        let mut lines = BufReader::new(stdout).lines();

        loop {
            match tokio::time::timeout_at(deadline, lines.next_line()).await {
                Err(_) => {
                    warn!(job_id = job.id, "Worker timed out, killing it");
                    if let Err(e) = child.kill().await {
                        warn!(job_id = job.id, "Failed to kill worker: {}", e);
                    }
                    return AttemptOutcome::Failed(JobError::new(
                        ErrorKind::Timeout,
                        format!(
                            "no result within {} seconds",
                            self.config.job_timeout.as_secs()
                        ),
                    ));
                }
                Ok(Ok(Some(line))) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match decode_line::<WorkerMessage>(&line) {
                        Ok(WorkerMessage::Progress { message }) => {
                            if let Err(e) = self.registry.record_progress(job.id, &message) {
                                warn!(job_id = job.id, "Dropping progress note: {}", e);
                            }
                        }
                        Ok(WorkerMessage::Result { payload }) => {
                            return AttemptOutcome::Completed(payload);
                        }
                        Ok(WorkerMessage::Failure { detail }) => {
                            return AttemptOutcome::Failed(JobError::new(
                                ErrorKind::EngineFailure,
                                detail,
                            ));
                        }
                        Err(e) => {
                            warn!(job_id = job.id, "Ignoring unparseable worker output: {}", e);
                        }
                    }
                }
                Ok(Ok(None)) => {
                    let status = self.wait_briefly(child).await;
                    return lost(format!(
                        "worker exited without reporting a result ({})",
                        describe(status)
                    ));
                }
                Ok(Err(e)) => {
                    if let Err(e) = child.kill().await {
                        warn!(job_id = job.id, "Failed to kill worker: {}", e);
                    }
                    return lost(format!("cannot read worker output: {}", e));
                }
            }
        }
    }

    async fn wait_briefly(&self, child: &mut Child) -> Option<ExitStatus> {
        tokio::time::timeout(self.config.worker_exit_grace, child.wait())
            .await
            .ok()
            .and_then(Result::ok)
    }

    /// Wait for the worker to exit, killing it after the grace period
    async fn reap(&self, child: &mut Child, job: &ClaimedJob) {
        match self.wait_briefly(child).await {
            Some(status) => debug!(job_id = job.id, "Worker exited: {}", status),
            None => {
                debug!(job_id = job.id, "Worker still running, killing it");
                if let Err(e) = child.kill().await {
                    warn!(job_id = job.id, "Failed to kill worker: {}", e);
                }
            }
        }
    }
}

fn lost(detail: String) -> AttemptOutcome {
    AttemptOutcome::Failed(JobError::new(ErrorKind::WorkerLost, detail))
}

fn describe(status: Option<ExitStatus>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "still running".to_string(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::jobs::{JobState, NewJob};
    use guisrv_common::events::EventBus;
    use guisrv_common::Bundle;
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::Duration;

    fn setup(script: &str) -> (WorkerSupervisor, Arc<StatusRegistry>, ClaimedJob) {
        let config = GatewayConfig {
            worker_command: PathBuf::from("/bin/sh"),
            worker_args: vec!["-c".to_string(), script.to_string()],
            job_timeout: Duration::from_secs(2),
            worker_exit_grace: Duration::from_millis(200),
            ..GatewayConfig::default()
        };
        let registry = Arc::new(StatusRegistry::new(EventBus::new(64)));
        registry.submit(NewJob {
            session: None,
            name: "demo".to_string(),
            bundle_id: None,
            bundle: Bundle::from_value(json!({"services": {"a": {"charm": "cs:a"}}})).unwrap(),
            credentials: None,
        });
        let job = registry.claim_next().unwrap();
        (
            WorkerSupervisor::new(Arc::new(config), registry.clone()),
            registry,
            job,
        )
    }

    #[tokio::test]
    async fn test_result_completes_job() {
        let (sup, registry, job) = setup(
            r#"read line; echo '{"type":"progress","message":"step 1"}'; echo '{"type":"result","payload":{"units":1}}'"#,
        );
        sup.run(job).await;

        let detail = registry.get(0).unwrap();
        assert_eq!(detail.summary.state, JobState::Completed);
        assert_eq!(detail.result, Some(json!({"units": 1})));
        assert_eq!(detail.progress[0].message, "step 1");
    }

    #[tokio::test]
    async fn test_failure_is_engine_failure() {
        let (sup, registry, job) =
            setup(r#"read line; echo '{"type":"failure","detail":"charm not found"}'"#);
        sup.run(job).await;

        let detail = registry.get(0).unwrap();
        assert_eq!(detail.summary.state, JobState::Errored);
        assert_eq!(
            detail.error_detail.unwrap(),
            JobError::new(ErrorKind::EngineFailure, "charm not found")
        );
    }

    #[tokio::test]
    async fn test_silent_exit_is_worker_lost() {
        let (sup, registry, job) = setup("read line; echo 'garbage'; exit 3");
        sup.run(job).await;

        let err = registry.get(0).unwrap().error_detail.unwrap();
        assert_eq!(err.kind, ErrorKind::WorkerLost);
        assert!(err.detail.contains("3"), "detail: {}", err.detail);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_worker_lost() {
        let (mut sup, registry, job) = setup("exit 0");
        sup.config = Arc::new(GatewayConfig {
            worker_command: PathBuf::from("/nonexistent/guisrv-deployer"),
            ..GatewayConfig::default()
        });
        sup.run(job).await;

        let err = registry.get(0).unwrap().error_detail.unwrap();
        assert_eq!(err.kind, ErrorKind::WorkerLost);
        assert!(err.detail.contains("cannot spawn"));
    }

    #[tokio::test]
    async fn test_hung_worker_times_out() {
        let (sup, registry, job) = setup("read line; exec sleep 30");
        let started = std::time::Instant::now();
        sup.run(job).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        let err = registry.get(0).unwrap().error_detail.unwrap();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_worker_ignoring_large_request_times_out() {
        let (mut sup, registry, _) = setup("exec sleep 30");
        let mut config = (*sup.config).clone();
        config.job_timeout = Duration::from_secs(1);
        sup.config = Arc::new(config);

        registry.submit(NewJob {
            session: None,
            name: "large".to_string(),
            bundle_id: None,
            bundle: Bundle::from_value(json!({
                "services": {"a": {"charm": "cs:a", "options": {"blob": "x".repeat(256 * 1024)}}}
            }))
            .unwrap(),
            credentials: None,
        });
        let job = registry.claim_next().unwrap();
        assert_eq!(job.id, 1);

        let finished = tokio::time::timeout(Duration::from_secs(8), sup.run(job)).await;
        assert!(finished.is_ok(), "supervisor blocked on worker stdin");
        let err = registry.get(1).unwrap().error_detail.unwrap();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_lingering_worker_is_killed_after_result() {
        let (sup, registry, job) =
            setup(r#"read line; echo '{"type":"result"}'; exec sleep 30"#);
        let started = std::time::Instant::now();
        sup.run(job).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(registry.state(0), Some(JobState::Completed));
    }

    #[tokio::test]
    async fn test_worker_lost_retried_once_when_enabled() {
        let (mut sup, registry, job) = setup("read line; exit 1");
        let mut config = (*sup.config).clone();
        config.retry_worker_lost = true;
        sup.config = Arc::new(config);
        sup.run(job).await;

        let detail = registry.get(0).unwrap();
        assert_eq!(detail.summary.state, JobState::Errored);
        assert_eq!(detail.attempts, 2);
    }
}
