//! WebSocket session proxy
//!
//! Each console connection to `/ws` (or `/ws/*path`) is paired with one
//! backend connection to the control-plane API; frames are relayed verbatim
//! in both directions. See [`session`] for the relay itself.

pub mod auth;
pub mod convert;
pub mod deployer;
pub mod frames;
pub mod session;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::{header, HeaderMap},
    response::Response,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

use crate::config::GatewayConfig;
use crate::jobs::{JobId, SessionId};
use crate::AppState;

pub use frames::{ClientFrame, Direction, FrameTracer};

/// Live session bookkeeping, for introspection only
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub backend_url: String,
    pub opened_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Jobs this session submitted (ids only)
    pub jobs: Vec<JobId>,
}

/// Table of open sessions shared by all relay tasks
#[derive(Clone, Default)]
pub struct SessionTable {
    inner: Arc<Mutex<HashMap<SessionId, SessionInfo>>>,
}

impl SessionTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionInfo>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open(&self, id: SessionId, backend_url: String) {
        self.lock().insert(
            id,
            SessionInfo {
                id,
                backend_url,
                opened_at: Utc::now(),
                user: None,
                jobs: Vec::new(),
            },
        );
    }

    pub fn close(&self, id: SessionId) -> Option<SessionInfo> {
        self.lock().remove(&id)
    }

    pub fn set_user(&self, id: SessionId, user: Option<String>) {
        if let Some(info) = self.lock().get_mut(&id) {
            info.user = user;
        }
    }

    pub fn record_job(&self, id: SessionId, job_id: JobId) {
        if let Some(info) = self.lock().get_mut(&id) {
            info.jobs.push(job_id);
        }
    }

    pub fn jobs(&self, id: SessionId) -> Vec<JobId> {
        self.lock()
            .get(&id)
            .map(|info| info.jobs.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open sessions, oldest first
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.lock().values().cloned().collect();
        sessions.sort_by_key(|s| s.opened_at);
        sessions
    }
}

/// Backend URL for a client request path (relative to `/ws/`)
///
/// `api/{server}/{port}/{uuid}` targets that model's API endpoint;
/// anything else uses the configured API URL.
pub fn backend_url(config: &GatewayConfig, path: Option<&str>) -> String {
    let segments: Vec<&str> = path
        .unwrap_or_default()
        .trim_matches('/')
        .split('/')
        .collect();

    match segments.as_slice() {
        ["api", server, port, uuid]
            if !server.is_empty() && port.parse::<u16>().is_ok() && !uuid.is_empty() =>
        {
            let kind = if config.legacy_paths {
                "environment"
            } else {
                "model"
            };
            format!("wss://{}:{}/{}/{}/api", server, port, kind, uuid)
        }
        _ => config.api_url.clone(),
    }
}

/// HTTP(S) equivalent of a ws/wss URL (scheme, host and path only)
pub fn ws_to_http(url: &str) -> String {
    let (scheme, rest) = match url.split_once("://") {
        Some(("wss", rest)) => ("https", rest),
        Some(("ws", rest)) => ("http", rest),
        Some((scheme, rest)) => (scheme, rest),
        None => return url.to_string(),
    };
    let rest = rest.split(['?', '#']).next().unwrap_or(rest);
    format!("{}://{}", scheme, rest)
}

/// Origin sent to the backend: the client's, else derived from the backend URL
pub fn origin_for(headers: &HeaderMap, backend_url: &str) -> String {
    headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| ws_to_http(backend_url))
}

/// GET /ws
async fn ws_root(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, headers, state, None)
}

/// GET /ws/*path
async fn ws_path(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Path(path): Path<String>,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, headers, state, Some(path))
}

fn upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    state: AppState,
    path: Option<String>,
) -> Response {
    let target = backend_url(&state.config, path.as_deref());
    let origin = origin_for(&headers, &target);
    info!(backend = %target, origin = %origin, "Client connecting");
    ws.on_upgrade(move |socket| session::run(state, socket, target, origin))
}

/// Build WebSocket proxy routes
pub fn proxy_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws_root))
        .route("/ws/*path", get(ws_path))
}
