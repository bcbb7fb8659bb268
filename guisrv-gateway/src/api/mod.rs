//! HTTP API handlers for guisrv-gateway

pub mod frame_tracing;
pub mod health;
pub mod info;
pub mod jobs;
pub mod sse;

pub use frame_tracing::tracing_routes;
pub use health::health_routes;
pub use info::info_routes;
pub use jobs::job_routes;
pub use sse::event_stream;
