//! Runtime frame tracing switch

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use guisrv_common::events::GatewayEvent;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::AppState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FrameTracingState {
    pub enabled: bool,
}

/// GET /frame-tracing
pub async fn get_frame_tracing(State(state): State<AppState>) -> Json<FrameTracingState> {
    Json(FrameTracingState {
        enabled: state.frame_tracer.is_enabled(),
    })
}

/// PUT /frame-tracing
///
/// Takes effect for frames relayed after the call, in every open session.
pub async fn set_frame_tracing(
    State(state): State<AppState>,
    Json(request): Json<FrameTracingState>,
) -> Json<FrameTracingState> {
    let previous = state.frame_tracer.set_enabled(request.enabled);
    if previous != request.enabled {
        info!(enabled = request.enabled, "Frame tracing switched");
        state.event_bus.emit_lossy(GatewayEvent::FrameTracingChanged {
            enabled: request.enabled,
            timestamp: Utc::now(),
        });
    }
    Json(request)
}

pub fn tracing_routes() -> Router<AppState> {
    Router::new().route("/frame-tracing", get(get_frame_tracing).put(set_frame_tracing))
}
