//! Job submission and status endpoints
//!
//! Submission never waits for the job to start; progress is observed
//! through `GET /jobs/:id`, `GET /events` or the deployer Watch requests.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::jobs::{JobDetail, JobId, JobState, JobSummary};
use crate::scheduler::{BundleSource, ImportRequest};
use crate::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    /// Structured bundle; `null` or absent is rejected as malformed
    #[serde(default)]
    pub bundle: Value,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub bundle_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: JobId,
}

#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    pub jobs: Vec<JobSummary>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
    pub state: JobState,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /jobs
pub async fn submit_job(
    State(state): State<AppState>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let Json(request) = payload?;
    let import = ImportRequest {
        name: request.name,
        bundle_id: request.bundle_id,
        source: BundleSource::Structured(request.bundle),
    };

    let job_id = state
        .scheduler
        .submit(None, state.config.http_credentials.clone(), import)?;
    info!(job_id, "HTTP: job submitted");

    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}

/// GET /jobs
pub async fn list_jobs(State(state): State<AppState>) -> Json<SnapshotResponse> {
    Json(SnapshotResponse {
        jobs: state.registry.snapshot(),
    })
}

/// GET /jobs/:id
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> ApiResult<Json<JobDetail>> {
    state
        .registry
        .get(id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {}", id)))
}

/// POST /jobs/:id/cancel
///
/// Only queued jobs can be cancelled; for any other job the current state
/// is reported with `cancelled: false`.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> ApiResult<Json<CancelResponse>> {
    let cancelled = state.scheduler.cancel(id);
    let job_state = state
        .registry
        .state(id)
        .ok_or_else(|| ApiError::NotFound(format!("job {}", id)))?;

    if cancelled {
        info!(job_id = id, "HTTP: job cancelled");
    }
    Ok(Json(CancelResponse {
        cancelled,
        state: job_state,
    }))
}

/// Build job routes
pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
}
