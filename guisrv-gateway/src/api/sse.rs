//! Server-Sent Events (SSE) for job and session events

use crate::AppState;
use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Deserialize)]
pub struct EventFilter {
    /// Only forward events about this job (session events are dropped)
    #[serde(default)]
    pub job: Option<u64>,
}

/// GET /events - SSE event stream
///
/// Streams every `GatewayEvent`: JobSubmitted, JobStarted, JobProgress,
/// JobCompleted, JobErrored, JobCancelled, SessionOpened, SessionClosed
/// and FrameTracingChanged. `?job=<id>` narrows the stream to one job.
pub async fn event_stream(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(job = ?filter.job, "New SSE client connected");

    let mut rx = state.event_bus.subscribe();
    let shutdown = state.shutdown.clone();

    let stream = async_stream::stream! {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                // Heartbeat every 15 seconds
                _ = tokio::time::sleep(Duration::from_secs(15)) => {
                    debug!("SSE: Sending heartbeat");
                    yield Ok(Event::default().comment("heartbeat"));
                }

                received = rx.recv() => {
                    let event = match received {
                        Ok(event) => event,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "SSE: subscriber lagged");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    };

                    if filter.job.is_some() && event.job_id() != filter.job {
                        continue;
                    }

                    let event_type = event.event_type().to_string();
                    match serde_json::to_string(&event) {
                        Ok(event_json) => {
                            debug!("SSE: Broadcasting event: {}", event_type);
                            yield Ok(Event::default().event(event_type).data(event_json));
                        }
                        Err(e) => {
                            warn!("SSE: Failed to serialize event {}: {}", event_type, e);
                        }
                    }
                }
            }
        }
        debug!("SSE: stream closed");
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}
