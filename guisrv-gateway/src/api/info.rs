//! Server info endpoint
//!
//! Debugging view of the whole gateway: configured API URL, frame tracing
//! flag, the job snapshot, open sessions and uptime.

use axum::{extract::State, routing::get, Json, Router};
use guisrv_common::time::elapsed_secs;
use serde::Serialize;

use crate::jobs::JobSummary;
use crate::proxy::SessionInfo;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct DeployerInfo {
    pub jobs: Vec<JobSummary>,
    pub queued: usize,
    pub running: usize,
    #[serde(rename = "maxConcurrent")]
    pub max_concurrent: usize,
}

#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub apiurl: String,
    pub debug: bool,
    pub deployer: DeployerInfo,
    pub sessions: Vec<SessionInfo>,
    pub uptime: u64,
    pub version: String,
}

/// GET /gui-server-info
pub async fn server_info(State(state): State<AppState>) -> Json<ServerInfo> {
    Json(ServerInfo {
        apiurl: state.config.api_url.clone(),
        debug: state.frame_tracer.is_enabled(),
        deployer: DeployerInfo {
            jobs: state.registry.snapshot(),
            queued: state.registry.queue_len(),
            running: state.scheduler.running(),
            max_concurrent: state.scheduler.max_concurrent(),
        },
        sessions: state.sessions.list(),
        uptime: elapsed_secs(state.startup_time),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub fn info_routes() -> Router<AppState> {
    Router::new().route("/gui-server-info", get(server_info))
}
