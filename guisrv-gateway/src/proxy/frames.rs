//! Client frame classification and frame tracing

use chrono::Utc;
use guisrv_common::protocol::Credentials;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::jobs::SessionId;

/// Log target for traced frames
pub const FRAME_LOG_TARGET: &str = "guisrv_gateway::frames";

/// A deployer request carried inside the proxied stream
#[derive(Debug, Clone, PartialEq)]
pub struct DeployerRequest {
    pub request_id: Value,
    pub request: String,
    pub params: Map<String, Value>,
}

impl DeployerRequest {
    /// Requests that may block until a job changes
    pub fn is_long_poll(&self) -> bool {
        self.request == "Next"
    }
}

/// What a text frame from the client means to the gateway
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// Admin Login request: relayed, credentials remembered
    Login {
        request_id: Value,
        credentials: Credentials,
    },
    /// Deployer request: answered locally, never relayed
    Deployer(DeployerRequest),
    /// Anything else, including non-JSON text
    Passthrough,
}

/// Classify one client text frame
pub fn classify(text: &str) -> ClientFrame {
    let Ok(Value::Object(mut data)) = serde_json::from_str::<Value>(text) else {
        return ClientFrame::Passthrough;
    };

    let request_id = data.get("RequestId").cloned().unwrap_or(Value::Null);
    let kind = data.get("Type").and_then(Value::as_str);
    let request = data.get("Request").and_then(Value::as_str);

    match (kind, request) {
        (Some("Deployer"), Some(request)) => {
            let request = request.to_string();
            let params = match data.remove("Params") {
                Some(Value::Object(params)) => params,
                _ => Map::new(),
            };
            ClientFrame::Deployer(DeployerRequest {
                request_id,
                request,
                params,
            })
        }
        (Some("Admin"), Some("Login")) if !request_id.is_null() => {
            let params = data.get("Params");
            let field = |name: &str| {
                params
                    .and_then(|p| p.get(name))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            };
            match (field("AuthTag"), field("Password")) {
                (Some(user), Some(password)) => ClientFrame::Login {
                    request_id,
                    credentials: Credentials { user, password },
                },
                _ => ClientFrame::Passthrough,
            }
        }
        _ => ClientFrame::Passthrough,
    }
}

/// Relay direction of a traced frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToBackend => write!(f, "client->backend"),
            Direction::BackendToClient => write!(f, "backend->client"),
        }
    }
}

/// Process-wide frame tracing switch
#[derive(Debug, Clone, Default)]
pub struct FrameTracer {
    enabled: Arc<AtomicBool>,
}

impl FrameTracer {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Set the flag; returns the previous value
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::Relaxed)
    }

    pub fn trace_text(&self, session_id: SessionId, direction: Direction, frame: &str) {
        if self.is_enabled() {
            tracing::info!(
                target: FRAME_LOG_TARGET,
                session_id = %session_id,
                direction = %direction,
                timestamp = %Utc::now().to_rfc3339(),
                frame = %frame,
                "frame"
            );
        }
    }

    /// Binary frames are logged by size only
    pub fn trace_binary(&self, session_id: SessionId, direction: Direction, len: usize) {
        if self.is_enabled() {
            tracing::info!(
                target: FRAME_LOG_TARGET,
                session_id = %session_id,
                direction = %direction,
                timestamp = %Utc::now().to_rfc3339(),
                frame_len = len,
                "binary frame"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_login_frame() {
        let frame = json!({
            "RequestId": 1,
            "Type": "Admin",
            "Request": "Login",
            "Params": {"AuthTag": "user-admin", "Password": "secret"}
        })
        .to_string();

        assert_eq!(
            classify(&frame),
            ClientFrame::Login {
                request_id: json!(1),
                credentials: Credentials {
                    user: "user-admin".to_string(),
                    password: "secret".to_string()
                }
            }
        );
    }

    #[test]
    fn test_login_without_password_is_passthrough() {
        let frame = json!({
            "RequestId": 1, "Type": "Admin", "Request": "Login",
            "Params": {"AuthTag": "user-admin"}
        })
        .to_string();
        assert_eq!(classify(&frame), ClientFrame::Passthrough);
    }

    #[test]
    fn test_deployer_frame() {
        let frame = json!({
            "RequestId": 7, "Type": "Deployer", "Request": "Watch",
            "Params": {"DeploymentId": 0}
        })
        .to_string();

        match classify(&frame) {
            ClientFrame::Deployer(req) => {
                assert_eq!(req.request, "Watch");
                assert_eq!(req.request_id, json!(7));
                assert_eq!(req.params["DeploymentId"], 0);
                assert!(!req.is_long_poll());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_other_frames_pass_through() {
        assert_eq!(classify("not json"), ClientFrame::Passthrough);
        assert_eq!(classify("[1, 2]"), ClientFrame::Passthrough);
        assert_eq!(
            classify(r#"{"RequestId": 3, "Type": "Client", "Request": "FullStatus"}"#),
            ClientFrame::Passthrough
        );
    }

    #[test]
    fn test_tracer_toggle() {
        let tracer = FrameTracer::new(false);
        let clone = tracer.clone();
        assert!(!tracer.set_enabled(true));
        assert!(clone.is_enabled());
        assert_eq!(Direction::ClientToBackend.to_string(), "client->backend");
        assert_eq!(Direction::BackendToClient.to_string(), "backend->client");
    }
}
