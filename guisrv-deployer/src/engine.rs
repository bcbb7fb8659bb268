//! Deployment engine interface

use guisrv_common::protocol::WorkerRequest;
use serde_json::Value;
use thiserror::Error;

/// Errors reported by a deployment engine
///
/// Every variant ends the job as `EngineFailure`; the message is the
/// failure detail shown to the user.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no credentials provided")]
    MissingCredentials,

    #[error("cannot connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("login failed: {0}")]
    LoginFailed(String),

    /// Bundle services that already exist in the model
    #[error("service(s) already in the environment: {}", .0.join(", "))]
    AlreadyDeployed(Vec<String>),

    #[error("{request} failed: {message}")]
    Api { request: String, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Something that can carry out a bundle deployment
pub trait DeploymentEngine {
    /// Deploy `request.bundle`; `progress` receives one note per step.
    /// Returns the result payload reported to the gateway.
    fn deploy(
        &mut self,
        request: &WorkerRequest,
        progress: &mut dyn FnMut(&str),
    ) -> Result<Value, EngineError>;
}
