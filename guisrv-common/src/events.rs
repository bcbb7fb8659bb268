//! Gateway event types and broadcast bus
//!
//! Job lifecycle and session events are published on an [`EventBus`] and
//! streamed to `/events` subscribers as Server-Sent Events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Gateway event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayEvent {
    /// A deployment job was accepted and queued
    JobSubmitted {
        job_id: u64,
        name: String,
        session_id: Option<Uuid>,
        queue_position: usize,
        timestamp: DateTime<Utc>,
    },

    /// A worker process was started for the job
    JobStarted {
        job_id: u64,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// Progress note reported by the worker
    JobProgress {
        job_id: u64,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Job finished successfully
    JobCompleted {
        job_id: u64,
        timestamp: DateTime<Utc>,
    },

    /// Job ended with an error (WorkerLost, Timeout, EngineFailure)
    JobErrored {
        job_id: u64,
        kind: String,
        detail: String,
        timestamp: DateTime<Utc>,
    },

    /// Queued job was cancelled before it started
    JobCancelled {
        job_id: u64,
        timestamp: DateTime<Utc>,
    },

    /// Client connected and its backend connection is established
    SessionOpened {
        session_id: Uuid,
        backend_url: String,
        timestamp: DateTime<Utc>,
    },

    /// Session torn down (either side closed, or shutdown)
    SessionClosed {
        session_id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Frame tracing switched on or off at runtime
    FrameTracingChanged {
        enabled: bool,
        timestamp: DateTime<Utc>,
    },
}

impl GatewayEvent {
    /// Get event type as string for filtering
    pub fn event_type(&self) -> &str {
        match self {
            GatewayEvent::JobSubmitted { .. } => "JobSubmitted",
            GatewayEvent::JobStarted { .. } => "JobStarted",
            GatewayEvent::JobProgress { .. } => "JobProgress",
            GatewayEvent::JobCompleted { .. } => "JobCompleted",
            GatewayEvent::JobErrored { .. } => "JobErrored",
            GatewayEvent::JobCancelled { .. } => "JobCancelled",
            GatewayEvent::SessionOpened { .. } => "SessionOpened",
            GatewayEvent::SessionClosed { .. } => "SessionClosed",
            GatewayEvent::FrameTracingChanged { .. } => "FrameTracingChanged",
        }
    }

    /// Job the event refers to, if any
    pub fn job_id(&self) -> Option<u64> {
        match self {
            GatewayEvent::JobSubmitted { job_id, .. }
            | GatewayEvent::JobStarted { job_id, .. }
            | GatewayEvent::JobProgress { job_id, .. }
            | GatewayEvent::JobCompleted { job_id, .. }
            | GatewayEvent::JobErrored { job_id, .. }
            | GatewayEvent::JobCancelled { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }
}

/// Broadcast bus for [`GatewayEvent`]s
///
/// Cloning the bus is cheap; all clones share one channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers that fall more than `capacity` events behind
    /// observe `RecvError::Lagged` and skip ahead.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: GatewayEvent) {
        let _ = self.tx.send(event);
    }
}
