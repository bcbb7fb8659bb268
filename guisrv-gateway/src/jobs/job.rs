//! Job record and its lifecycle

use chrono::{DateTime, Utc};
use guisrv_common::protocol::Credentials;
use guisrv_common::Bundle;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Deployment job identifier, assigned from 0 and never reused
pub type JobId = u64;

/// Proxied client session identifier
pub type SessionId = Uuid;

/// Maximum length of the error text shown in job summaries
pub const SUMMARY_ERROR_LEN: usize = 200;

/// Job lifecycle state
///
/// ```text
/// Queued ──► Started ──► Completed
///   │           └──────► Errored
///   └──────────────────► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Started,
    Completed,
    Errored,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }

    /// Whether `self -> next` is an allowed transition
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Started)
                | (Self::Queued, Self::Cancelled)
                | (Self::Started, Self::Completed)
                | (Self::Started, Self::Errored)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Why a started job ended in error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Worker process died or could not be spawned
    WorkerLost,
    /// Worker exceeded the job timeout and was killed
    Timeout,
    /// Deployment engine reported a failure
    EngineFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::WorkerLost => "WorkerLost",
            Self::Timeout => "Timeout",
            Self::EngineFailure => "EngineFailure",
        };
        write!(f, "{}", s)
    }
}

/// Error attached to an Errored job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// `"<Kind>: <detail>"` truncated to [`SUMMARY_ERROR_LEN`] characters
    pub fn summary(&self) -> String {
        let full = format!("{}: {}", self.kind, self.detail);
        match full.char_indices().nth(SUMMARY_ERROR_LEN) {
            Some((idx, _)) => full[..idx].to_string(),
            None => full,
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

/// Rejected state change
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job {id}: cannot move from {from} to {to}")]
    Invalid {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("job {id} is {state} and can no longer change")]
    Terminal { id: JobId, state: JobState },
}

/// Watcher-facing status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Scheduled,
    Started,
    Completed,
    Errored,
    Cancelled,
}

impl ChangeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }
}

/// One notification delivered to deployment watchers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobChange {
    pub deployment_id: JobId,
    pub status: ChangeStatus,
    /// 0-based queue position, only while the job is queued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix timestamp (seconds)
    pub time: i64,
}

impl JobChange {
    pub fn new(deployment_id: JobId, status: ChangeStatus) -> Self {
        Self {
            deployment_id,
            status,
            queue: None,
            error: None,
            time: Utc::now().timestamp(),
        }
    }

    pub fn queued(deployment_id: JobId, position: usize) -> Self {
        Self {
            queue: Some(position),
            ..Self::new(deployment_id, ChangeStatus::Scheduled)
        }
    }

    pub fn errored(deployment_id: JobId, error: &JobError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(deployment_id, ChangeStatus::Errored)
        }
    }
}

/// Progress note reported by the worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Progress notes kept per job; older notes are dropped first
pub const MAX_PROGRESS_ENTRIES: usize = 200;

/// Everything needed to queue a job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub session: Option<SessionId>,
    pub name: String,
    pub bundle_id: Option<String>,
    pub bundle: Bundle,
    /// Forwarded to the worker, never exposed through the API
    pub credentials: Option<Credentials>,
}

/// A submitted deployment
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    /// Originating session (reference only), `None` for HTTP submissions
    pub session: Option<SessionId>,
    pub name: String,
    pub bundle_id: Option<String>,
    pub bundle: Bundle,
    pub credentials: Option<Credentials>,
    state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    result: Option<Value>,
    error: Option<JobError>,
    progress: Vec<ProgressEntry>,
    changes: Vec<JobChange>,
    pub attempts: u32,
}

impl Job {
    pub fn new(id: JobId, request: NewJob) -> Self {
        Self {
            id,
            session: request.session,
            name: request.name,
            bundle_id: request.bundle_id,
            bundle: request.bundle,
            credentials: request.credentials,
            state: JobState::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            progress: Vec::new(),
            changes: Vec::new(),
            attempts: 0,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&JobError> {
        self.error.as_ref()
    }

    pub fn progress(&self) -> &[ProgressEntry] {
        &self.progress
    }

    pub fn changes(&self) -> &[JobChange] {
        &self.changes
    }

    pub fn last_change(&self) -> Option<&JobChange> {
        self.changes.last()
    }

    pub(crate) fn push_change(&mut self, change: JobChange) {
        self.changes.push(change);
    }

    fn transition(&mut self, next: JobState) -> Result<(), TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::Terminal {
                id: self.id,
                state: self.state,
            });
        }
        if !self.state.can_transition_to(next) {
            return Err(TransitionError::Invalid {
                id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next == JobState::Started {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(JobState::Started)?;
        self.attempts += 1;
        Ok(())
    }

    pub fn complete(&mut self, payload: Value) -> Result<(), TransitionError> {
        self.transition(JobState::Completed)?;
        self.result = Some(payload);
        Ok(())
    }

    pub fn fail(&mut self, error: JobError) -> Result<(), TransitionError> {
        self.transition(JobState::Errored)?;
        self.error = Some(error);
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.transition(JobState::Cancelled)
    }

    /// Record a new worker attempt for a job that stays Started
    pub(crate) fn restart(&mut self) -> Result<(), TransitionError> {
        if self.state != JobState::Started {
            return Err(TransitionError::Invalid {
                id: self.id,
                from: self.state,
                to: JobState::Started,
            });
        }
        self.attempts += 1;
        Ok(())
    }

    /// Append a progress note; rejected once the job is terminal
    pub fn log_progress(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::Terminal {
                id: self.id,
                state: self.state,
            });
        }
        if self.progress.len() >= MAX_PROGRESS_ENTRIES {
            self.progress.remove(0);
        }
        self.progress.push(ProgressEntry {
            timestamp: Utc::now(),
            message: message.into(),
        });
        Ok(())
    }

    pub fn summary(&self, queue_position: Option<usize>) -> JobSummary {
        JobSummary {
            id: self.id,
            state: self.state,
            name: self.name.clone(),
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error: self.error.as_ref().map(JobError::summary),
            queue_position,
        }
    }

    pub fn detail(&self, queue_position: Option<usize>) -> JobDetail {
        JobDetail {
            summary: self.summary(queue_position),
            session_id: self.session,
            bundle_id: self.bundle_id.clone(),
            bundle: self.bundle.raw().clone(),
            result: self.result.clone(),
            error_detail: self.error.clone(),
            progress: self.progress.clone(),
            attempts: self.attempts,
        }
    }
}

/// Introspection view of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: JobId,
    pub state: JobState,
    pub name: String,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
}

/// Full job record served by `GET /jobs/:id`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetail {
    #[serde(flatten)]
    pub summary: JobSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    pub bundle: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<JobError>,
    pub progress: Vec<ProgressEntry>,
    pub attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job() -> Job {
        let bundle = Bundle::from_value(json!({"services": {"a": {"charm": "cs:a"}}})).unwrap();
        Job::new(
            0,
            NewJob {
                session: None,
                name: "demo".to_string(),
                bundle_id: None,
                bundle,
                credentials: None,
            },
        )
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = job();
        assert_eq!(job.state(), JobState::Queued);
        job.start().unwrap();
        assert!(job.started_at.is_some());
        assert_eq!(job.attempts, 1);
        job.log_progress("deploying").unwrap();
        job.complete(json!({"ok": true})).unwrap();
        assert_eq!(job.state(), JobState::Completed);
        assert!(job.finished_at.is_some());
        assert_eq!(job.result(), Some(&json!({"ok": true})));
    }

    #[test]
    fn test_terminal_job_is_immutable() {
        let mut job = job();
        job.cancel().unwrap();
        assert!(matches!(job.start(), Err(TransitionError::Terminal { .. })));
        assert!(job.log_progress("late").is_err());
        assert!(job.progress().is_empty());
    }

    #[test]
    fn test_progress_trail_is_capped() {
        let mut job = job();
        job.start().unwrap();
        for i in 0..MAX_PROGRESS_ENTRIES + 5 {
            job.log_progress(format!("note {}", i)).unwrap();
        }
        assert_eq!(job.progress().len(), MAX_PROGRESS_ENTRIES);
        assert_eq!(job.progress()[0].message, "note 5");
        assert_eq!(
            job.progress().last().unwrap().message,
            format!("note {}", MAX_PROGRESS_ENTRIES + 4)
        );
    }

    #[test]
    fn test_queued_job_cannot_complete() {
        let mut job = job();
        let err = job.complete(Value::Null).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Invalid {
                id: 0,
                from: JobState::Queued,
                to: JobState::Completed
            }
        );
    }

    #[test]
    fn test_started_job_cannot_be_cancelled() {
        let mut job = job();
        job.start().unwrap();
        assert!(job.cancel().is_err());
        assert_eq!(job.state(), JobState::Started);
    }

    #[test]
    fn test_error_summary_truncated() {
        let err = JobError::new(ErrorKind::EngineFailure, "x".repeat(500));
        let summary = err.summary();
        assert_eq!(summary.chars().count(), SUMMARY_ERROR_LEN);
        assert!(summary.starts_with("EngineFailure: xxx"));

        let short = JobError::new(ErrorKind::Timeout, "too slow");
        assert_eq!(short.summary(), "Timeout: too slow");
    }

    #[test]
    fn test_change_wire_format() {
        let change = JobChange::queued(4, 1);
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["DeploymentId"], 4);
        assert_eq!(json["Status"], "scheduled");
        assert_eq!(json["Queue"], 1);
        assert!(json.get("Error").is_none());
        assert!(json["Time"].is_i64());
    }

    #[test]
    fn test_summary_omits_absent_fields() {
        let job = job();
        let json = serde_json::to_value(job.summary(Some(0))).unwrap();
        assert_eq!(json["state"], "queued");
        assert_eq!(json["queuePosition"], 0);
        assert!(json.get("startedAt").is_none());
        assert!(json.get("error").is_none());
    }
}
