//! Status registry: the authoritative table of jobs, the queue and watchers
//!
//! All bookkeeping lives behind one `std::sync::Mutex` that is only held for
//! short, non-async critical sections. Events are published on the
//! [`EventBus`] after the lock has been released.

use chrono::Utc;
use guisrv_common::events::{EventBus, GatewayEvent};
use guisrv_common::protocol::Credentials;
use guisrv_common::Bundle;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::change_sets::ChangeSetStore;
use super::job::{
    ChangeStatus, Job, JobChange, JobDetail, JobError, JobId, JobState, JobSummary, NewJob,
    SessionId, TransitionError,
};

/// Deployment watcher identifier
pub type WatcherId = u64;

/// A job handed from the queue to the scheduler, already in state Started
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: JobId,
    pub name: String,
    pub session: Option<SessionId>,
    pub bundle: Bundle,
    pub credentials: Option<Credentials>,
    pub attempt: u32,
}

#[derive(Debug)]
struct Watcher {
    job_id: JobId,
    /// Session that registered the watcher, if any
    owner: Option<SessionId>,
    cursor: usize,
}

#[derive(Debug, Default)]
struct Inner {
    next_job_id: JobId,
    next_watcher_id: WatcherId,
    jobs: BTreeMap<JobId, Job>,
    queue: VecDeque<JobId>,
    watchers: HashMap<WatcherId, Watcher>,
}

impl Inner {
    fn queue_position(&self, id: JobId) -> Option<usize> {
        self.queue.iter().position(|queued| *queued == id)
    }

    /// Notify every queued job whose position differs from its last change
    fn renotify_positions(&mut self) {
        let positions: Vec<(JobId, usize)> = self
            .queue
            .iter()
            .enumerate()
            .map(|(pos, id)| (*id, pos))
            .collect();
        for (id, pos) in positions {
            if let Some(job) = self.jobs.get_mut(&id) {
                let current = job.last_change().and_then(|c| c.queue);
                if current != Some(pos) {
                    job.push_change(JobChange::queued(id, pos));
                }
            }
        }
    }

    fn job_mut(&mut self, id: JobId) -> Result<&mut Job, RegistryError> {
        self.jobs.get_mut(&id).ok_or(RegistryError::UnknownJob(id))
    }
}

/// Errors reported by registry mutations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Jobs, queue and watchers of one gateway process
pub struct StatusRegistry {
    inner: Mutex<Inner>,
    /// Wakes the scheduler driver when a job is queued
    queued: Notify,
    /// Wakes long-polling watchers when any job changes
    changed: Notify,
    change_sets: ChangeSetStore,
    event_bus: EventBus,
}

impl StatusRegistry {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            queued: Notify::new(),
            changed: Notify::new(),
            change_sets: ChangeSetStore::default(),
            event_bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a new Queued job at the tail of the queue
    pub fn submit(&self, request: NewJob) -> JobId {
        let (id, name, session, position) = {
            let mut inner = self.lock();
            let id = inner.next_job_id;
            inner.next_job_id += 1;

            let mut job = Job::new(id, request);
            let position = inner.queue.len();
            job.push_change(JobChange::queued(id, position));
            let name = job.name.clone();
            let session = job.session;
            inner.jobs.insert(id, job);
            inner.queue.push_back(id);
            (id, name, session, position)
        };

        info!(job_id = id, queue_position = position, "Job queued: {}", name);
        self.queued.notify_one();
        self.changed.notify_waiters();
        self.event_bus.emit_lossy(GatewayEvent::JobSubmitted {
            job_id: id,
            name,
            session_id: session,
            queue_position: position,
            timestamp: Utc::now(),
        });
        id
    }

    /// Pop the queue head and mark it Started in one critical section
    pub fn claim_next(&self) -> Option<ClaimedJob> {
        let claimed = {
            let mut inner = self.lock();
            let id = inner.queue.pop_front()?;
            let claimed = match inner.jobs.get_mut(&id) {
                Some(job) => match job.start() {
                    Ok(()) => {
                        job.push_change(JobChange::new(id, ChangeStatus::Started));
                        ClaimedJob {
                            id,
                            name: job.name.clone(),
                            session: job.session,
                            bundle: job.bundle.clone(),
                            credentials: job.credentials.clone(),
                            attempt: job.attempts,
                        }
                    }
                    Err(e) => {
                        // Only Queued jobs are ever in the queue
                        warn!(job_id = id, "Dropping unclaimable queue entry: {}", e);
                        return None;
                    }
                },
                None => return None,
            };
            inner.renotify_positions();
            claimed
        };

        info!(job_id = claimed.id, "Job started: {}", claimed.name);
        self.changed.notify_waiters();
        self.event_bus.emit_lossy(GatewayEvent::JobStarted {
            job_id: claimed.id,
            attempt: claimed.attempt,
            timestamp: Utc::now(),
        });
        Some(claimed)
    }

    /// Wait until a job may have been queued
    ///
    /// Permits are stored, so a submit that races with the caller is
    /// never missed; callers re-check with [`claim_next`](Self::claim_next).
    pub async fn job_queued(&self) {
        self.queued.notified().await;
    }

    /// Cancel a Queued job; any other state (or unknown id) is left alone
    pub fn cancel(&self, id: JobId) -> bool {
        let cancelled = {
            let mut inner = self.lock();
            let Some(position) = inner.queue_position(id) else {
                return false;
            };
            let Some(job) = inner.jobs.get_mut(&id) else {
                return false;
            };
            if job.cancel().is_err() {
                return false;
            }
            job.push_change(JobChange::new(id, ChangeStatus::Cancelled));
            inner.queue.remove(position);
            inner.renotify_positions();
            true
        };

        if cancelled {
            info!(job_id = id, "Job cancelled");
            self.changed.notify_waiters();
            self.event_bus.emit_lossy(GatewayEvent::JobCancelled {
                job_id: id,
                timestamp: Utc::now(),
            });
        }
        cancelled
    }

    /// Append a worker progress note
    pub fn record_progress(&self, id: JobId, message: &str) -> Result<(), RegistryError> {
        self.lock().job_mut(id)?.log_progress(message)?;
        debug!(job_id = id, "Job progress: {}", message);
        self.event_bus.emit_lossy(GatewayEvent::JobProgress {
            job_id: id,
            message: message.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Started → Completed
    pub fn complete(&self, id: JobId, payload: Value) -> Result<(), RegistryError> {
        {
            let mut inner = self.lock();
            let job = inner.job_mut(id)?;
            job.complete(payload)?;
            job.push_change(JobChange::new(id, ChangeStatus::Completed));
        }
        info!(job_id = id, "Job completed");
        self.changed.notify_waiters();
        self.event_bus.emit_lossy(GatewayEvent::JobCompleted {
            job_id: id,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Started → Errored
    pub fn fail(&self, id: JobId, error: JobError) -> Result<(), RegistryError> {
        {
            let mut inner = self.lock();
            let job = inner.job_mut(id)?;
            job.fail(error.clone())?;
            job.push_change(JobChange::errored(id, &error));
        }
        warn!(job_id = id, kind = %error.kind, "Job errored: {}", error.detail);
        self.changed.notify_waiters();
        self.event_bus.emit_lossy(GatewayEvent::JobErrored {
            job_id: id,
            kind: error.kind.to_string(),
            detail: error.detail,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Record another worker attempt for a Started job; returns the attempt number
    pub fn retry(&self, id: JobId, reason: &str) -> Result<u32, RegistryError> {
        let attempt = {
            let mut inner = self.lock();
            let job = inner.job_mut(id)?;
            job.log_progress(format!("retrying after lost worker: {}", reason))?;
            job.restart()?;
            job.attempts
        };
        info!(job_id = id, attempt, "Retrying job");
        self.event_bus.emit_lossy(GatewayEvent::JobStarted {
            job_id: id,
            attempt,
            timestamp: Utc::now(),
        });
        Ok(attempt)
    }

    /// Summaries of every job in id order
    pub fn snapshot(&self) -> Vec<JobSummary> {
        let inner = self.lock();
        inner
            .jobs
            .values()
            .map(|job| job.summary(inner.queue_position(job.id)))
            .collect()
    }

    pub fn get(&self, id: JobId) -> Option<JobDetail> {
        let inner = self.lock();
        inner
            .jobs
            .get(&id)
            .map(|job| job.detail(inner.queue_position(id)))
    }

    pub fn state(&self, id: JobId) -> Option<JobState> {
        self.lock().jobs.get(&id).map(Job::state)
    }

    /// Most recent change of every job, in id order
    pub fn last_changes(&self) -> Vec<JobChange> {
        self.lock()
            .jobs
            .values()
            .filter_map(|job| job.last_change().cloned())
            .collect()
    }

    /// Every change recorded for a job, oldest first
    pub fn changes(&self, id: JobId) -> Option<Vec<JobChange>> {
        self.lock().jobs.get(&id).map(|job| job.changes().to_vec())
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn started_count(&self) -> usize {
        self.lock()
            .jobs
            .values()
            .filter(|job| job.state() == JobState::Started)
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored change sets awaiting `GetChangeSet`
    pub fn change_sets(&self) -> &ChangeSetStore {
        &self.change_sets
    }

    /// Register a watcher that will see every change of `job_id` from the start
    pub fn watch(&self, job_id: JobId, owner: Option<SessionId>) -> Option<WatcherId> {
        let mut inner = self.lock();
        if !inner.jobs.contains_key(&job_id) {
            return None;
        }
        let id = inner.next_watcher_id;
        inner.next_watcher_id += 1;
        inner.watchers.insert(
            id,
            Watcher {
                job_id,
                owner,
                cursor: 0,
            },
        );
        debug!(job_id, watcher_id = id, "Watcher registered");
        Some(id)
    }

    /// Unseen changes for a watcher, waiting until there is at least one
    ///
    /// Returns `None` for unknown watchers. The watcher is removed once the
    /// terminal change of its job has been returned.
    pub async fn next(&self, watcher_id: WatcherId) -> Option<Vec<JobChange>> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                let (job_id, cursor) = {
                    let watcher = inner.watchers.get(&watcher_id)?;
                    (watcher.job_id, watcher.cursor)
                };
                let pending = inner
                    .jobs
                    .get(&job_id)
                    .map(|job| job.changes()[cursor.min(job.changes().len())..].to_vec())?;

                if !pending.is_empty() {
                    let finished = pending.iter().any(|c| c.status.is_terminal());
                    if finished {
                        inner.watchers.remove(&watcher_id);
                        debug!(job_id, watcher_id, "Watcher finished");
                    } else if let Some(watcher) = inner.watchers.get_mut(&watcher_id) {
                        watcher.cursor = cursor + pending.len();
                    }
                    return Some(pending);
                }
            }

            notified.await;
        }
    }

    /// Forget every watcher registered by a session; returns how many
    pub fn drop_watchers(&self, session: SessionId) -> usize {
        let mut inner = self.lock();
        let before = inner.watchers.len();
        inner.watchers.retain(|_, watcher| watcher.owner != Some(session));
        let dropped = before - inner.watchers.len();
        if dropped > 0 {
            debug!(session_id = %session, dropped, "Session watchers removed");
        }
        dropped
    }

    pub fn watcher_count(&self) -> usize {
        self.lock().watchers.len()
    }
}
