//! guisrv-gateway library interface for testing
//!
//! Exposes public APIs for integration testing

pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod proxy;
pub mod scheduler;
pub mod supervisor;

pub use crate::config::GatewayConfig;
pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use guisrv_common::events::EventBus;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::jobs::StatusRegistry;
use crate::proxy::{FrameTracer, SessionTable};
use crate::scheduler::Scheduler;

/// Broadcast capacity of the gateway event bus
pub const EVENT_BUS_CAPACITY: usize = 1000;

/// Application state shared across handlers and relay tasks
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    /// Every job ever submitted since startup
    pub registry: Arc<StatusRegistry>,
    pub scheduler: Scheduler,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Open proxy sessions
    pub sessions: SessionTable,
    pub frame_tracer: FrameTracer,
    /// Cancelled on shutdown; open sessions and SSE streams end with it
    pub shutdown: CancellationToken,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Self {
        let config = Arc::new(config);
        let event_bus = EventBus::new(EVENT_BUS_CAPACITY);
        let registry = Arc::new(StatusRegistry::new(event_bus.clone()));
        let scheduler = Scheduler::new(config.clone(), registry.clone());
        let frame_tracer = FrameTracer::new(config.trace_frames);

        Self {
            config,
            registry,
            scheduler,
            event_bus,
            sessions: SessionTable::default(),
            frame_tracer,
            shutdown: CancellationToken::new(),
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        // Console WebSocket sessions
        .merge(proxy::proxy_routes())
        // API routes
        .merge(api::job_routes())
        .route("/events", get(api::event_stream))
        .merge(api::info_routes())
        .merge(api::tracing_routes())
        .merge(api::health_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
