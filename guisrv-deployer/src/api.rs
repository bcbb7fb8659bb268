//! Deployment engine backed by the control-plane WebSocket API
//!
//! Blocking client: one request in flight at a time, replies matched by
//! `RequestId`. Requests use the same envelope the console speaks:
//! `{"RequestId": n, "Type": T, "Request": R, "Params": {...}}`.

use guisrv_common::bundle::{Relation, ServiceSpec};
use guisrv_common::protocol::{Credentials, WorkerRequest};
use serde_json::{json, Map, Value};
use std::net::TcpStream;
use tracing::{debug, info};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::engine::{DeploymentEngine, EngineError};
use guisrv_common::plan::{plan, summary, Step};

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

/// Minimal request/response client over one WebSocket connection
pub struct RpcClient {
    socket: Socket,
    next_id: u64,
}

impl RpcClient {
    pub fn connect(url: &str) -> Result<Self, EngineError> {
        let (socket, _response) = tungstenite::connect(url).map_err(|e| EngineError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { socket, next_id: 1 })
    }

    /// Send one request and wait for its reply
    pub fn call(&mut self, kind: &str, request: &str, params: Value) -> Result<Value, EngineError> {
        let request_id = self.next_id;
        self.next_id += 1;

        let frame = json!({
            "RequestId": request_id,
            "Type": kind,
            "Request": request,
            "Params": params,
        });
        debug!(request_id, kind, request, "API call");
        self.socket
            .send(Message::Text(frame.to_string()))
            .map_err(|e| EngineError::Protocol(e.to_string()))?;

        loop {
            let message = self
                .socket
                .read()
                .map_err(|e| EngineError::Protocol(e.to_string()))?;
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => {
                    return Err(EngineError::Protocol(format!(
                        "connection closed while waiting for {}",
                        request
                    )))
                }
                _ => continue,
            };

            let reply: Value = serde_json::from_str(&text)
                .map_err(|e| EngineError::Protocol(format!("invalid reply: {}", e)))?;
            if reply.get("RequestId").and_then(Value::as_u64) != Some(request_id) {
                continue;
            }
            if let Some(error) = reply.get("Error").filter(|e| !e.is_null()) {
                let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
                return Err(EngineError::Api {
                    request: request.to_string(),
                    message,
                });
            }
            return Ok(reply.get("Response").cloned().unwrap_or(Value::Null));
        }
    }

    pub fn close(mut self) {
        let _ = self.socket.close(None);
        // Drain until the close handshake completes
        while self.socket.read().is_ok() {}
    }
}

/// Engine that deploys through the API server named in the request
#[derive(Debug, Default)]
pub struct ApiEngine;

impl ApiEngine {
    pub fn new() -> Self {
        Self
    }

    fn login(client: &mut RpcClient, credentials: &Credentials) -> Result<(), EngineError> {
        client
            .call(
                "Admin",
                "Login",
                json!({"AuthTag": credentials.user, "Password": credentials.password}),
            )
            .map(|_| ())
            .map_err(|e| match e {
                EngineError::Api { message, .. } => EngineError::LoginFailed(message),
                other => other,
            })
    }

    /// Services already present in the model
    fn existing_services(client: &mut RpcClient) -> Result<Vec<String>, EngineError> {
        let status = client.call("Client", "FullStatus", json!({}))?;
        let services = status
            .get("Services")
            .or_else(|| status.get("Applications"))
            .and_then(Value::as_object)
            .map(|services| services.keys().cloned().collect())
            .unwrap_or_default();
        Ok(services)
    }

    fn run_step(client: &mut RpcClient, step: &Step) -> Result<(), EngineError> {
        match step {
            Step::AddCharm(charm) => {
                client.call("Client", "AddCharm", json!({"URL": charm}))?;
            }
            Step::Deploy { service, spec } => {
                client.call("Client", "ServiceDeploy", deploy_params(service, spec))?;
            }
            Step::Relate(Relation { from, to }) => {
                client.call("Client", "AddRelation", json!({"Endpoints": [from, to]}))?;
            }
        }
        Ok(())
    }
}

fn deploy_params(service: &str, spec: &ServiceSpec) -> Value {
    // Option values are sent as strings, the way the CLI passes them
    let config: Map<String, Value> = spec
        .options
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), Value::String(value))
        })
        .collect();

    json!({
        "ServiceName": service,
        "CharmUrl": spec.charm,
        "NumUnits": spec.num_units,
        "Config": config,
        "Constraints": constraints(spec.constraints.as_deref()),
    })
}

/// `"mem=4G cpu-cores=2"` as a mapping
fn constraints(text: Option<&str>) -> Value {
    let map: Map<String, Value> = text
        .unwrap_or_default()
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
        .collect();
    Value::Object(map)
}

impl DeploymentEngine for ApiEngine {
    fn deploy(
        &mut self,
        request: &WorkerRequest,
        progress: &mut dyn FnMut(&str),
    ) -> Result<Value, EngineError> {
        let credentials = request
            .credentials
            .as_ref()
            .ok_or(EngineError::MissingCredentials)?;

        info!(job_id = request.job_id, api_url = %request.api_url, "Connecting to API");
        let mut client = RpcClient::connect(&request.api_url)?;
        Self::login(&mut client, credentials)?;
        progress(&format!("logged in as {}", credentials.user));

        let existing = Self::existing_services(&mut client)?;
        let overlapping: Vec<String> = request
            .bundle
            .services()
            .keys()
            .filter(|name| existing.contains(name))
            .cloned()
            .collect();
        if !overlapping.is_empty() {
            client.close();
            return Err(EngineError::AlreadyDeployed(overlapping));
        }

        for step in plan(&request.bundle) {
            progress(&step.describe());
            Self::run_step(&mut client, &step)?;
        }
        client.close();

        info!(job_id = request.job_id, name = %request.name, "Bundle deployed");
        Ok(summary(&request.bundle))
    }
}
