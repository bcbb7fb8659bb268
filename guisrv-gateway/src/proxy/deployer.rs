//! Deployer requests answered by the gateway inside a proxied stream
//!
//! Request:  `{"RequestId": n, "Type": "Deployer", "Request": R, "Params": {...}}`
//! Response: `{"RequestId": n, "Response": {...}}`, plus `"Error"` on failure
//!
//! | Request      | Params                                     | Response                      |
//! |--------------|--------------------------------------------|-------------------------------|
//! | Import       | Bundle or YAML, Name?, Version?, BundleID? | `{DeploymentId, jobId}`       |
//! | Watch        | DeploymentId                               | `{WatcherId}`                 |
//! | Next         | WatcherId                                  | `{Changes}` (long poll)       |
//! | Cancel       | DeploymentId                               | `{}`                          |
//! | Status       |                                            | `{LastChanges}`               |
//! | GetChangeSet | YAML or Token                              | `{ChangeSet}` or `{Errors}`   |
//! | SetChangeSet | YAML                                       | `{Token, Created, Expires}`   |

use guisrv_common::plan::{change_set, Change};
use guisrv_common::protocol::Credentials;
use guisrv_common::{Bundle, BundleError};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::frames::DeployerRequest;
use super::SessionTable;
use crate::jobs::{JobId, SessionId, StatusRegistry, WatcherId};
use crate::scheduler::{BundleSource, ImportRequest, Scheduler};

pub const UNAUTHORIZED: &str = "unauthorized access: no user logged in";

const INVALID_PARAMS: &str = "invalid request: invalid data parameters";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImportParams {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    bundle: Option<Value>,
    #[serde(default, rename = "YAML")]
    yaml: Option<String>,
    #[serde(default)]
    version: Option<u64>,
    #[serde(default, rename = "BundleID")]
    bundle_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeploymentParams {
    deployment_id: JobId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WatcherParams {
    watcher_id: WatcherId,
}

/// Outcome of one deployer request, before it is wrapped in an envelope
pub type Reply = Result<Value, String>;

/// Deployer request handler bound to one session
#[derive(Clone)]
pub struct DeployerHandler {
    scheduler: Scheduler,
    sessions: SessionTable,
    session_id: SessionId,
}

impl DeployerHandler {
    pub fn new(scheduler: Scheduler, sessions: SessionTable, session_id: SessionId) -> Self {
        Self {
            scheduler,
            sessions,
            session_id,
        }
    }

    fn registry(&self) -> &StatusRegistry {
        self.scheduler.registry()
    }

    /// Answer a request; `credentials` is `None` until the session logged in
    pub async fn handle(&self, request: DeployerRequest, credentials: Option<Credentials>) -> Value {
        let reply = match credentials {
            None => Err(UNAUTHORIZED.to_string()),
            Some(credentials) => self.dispatch(&request, credentials).await,
        };
        if let Err(error) = &reply {
            warn!(
                session_id = %self.session_id,
                request = %request.request,
                "deployer: {}",
                error
            );
        }
        envelope(request.request_id, reply)
    }

    async fn dispatch(&self, request: &DeployerRequest, credentials: Credentials) -> Reply {
        match request.request.as_str() {
            "Import" => self.import(&request.params, credentials),
            "Watch" => self.watch(&request.params),
            "Next" => self.next(&request.params).await,
            "Cancel" => self.cancel(&request.params),
            "Status" => self.status(&request.params),
            "GetChangeSet" => self.get_change_set(&request.params),
            "SetChangeSet" => self.set_change_set(&request.params),
            other => Err(format!("unknown deployer request: {}", other)),
        }
    }

    fn import(&self, params: &Map<String, Value>, credentials: Credentials) -> Reply {
        let params: ImportParams = serde_json::from_value(Value::Object(params.clone()))
            .map_err(|e| format!("invalid request: {}", e))?;
        let source = match (params.yaml, params.bundle) {
            (Some(contents), _) => BundleSource::Yaml {
                contents,
                version: params.version,
            },
            (None, bundle) => BundleSource::Structured(bundle.unwrap_or(Value::Null)),
        };
        let request = ImportRequest {
            name: params.name,
            bundle_id: params.bundle_id,
            source,
        };

        let id = self
            .scheduler
            .submit(Some(self.session_id), Some(credentials), request)
            .map_err(|e| format!("MalformedBundle: {}", e))?;
        self.sessions.record_job(self.session_id, id);
        info!(session_id = %self.session_id, job_id = id, "deployer: import scheduled");
        Ok(json!({ "DeploymentId": id, "jobId": id }))
    }

    fn watch(&self, params: &Map<String, Value>) -> Reply {
        let params: DeploymentParams = parse_params(params)?;
        self.registry()
            .watch(params.deployment_id, Some(self.session_id))
            .map(|watcher_id| json!({ "WatcherId": watcher_id }))
            .ok_or_else(|| "invalid request: deployment not found".to_string())
    }

    async fn next(&self, params: &Map<String, Value>) -> Reply {
        let params: WatcherParams = parse_params(params)?;
        let changes = self
            .registry()
            .next(params.watcher_id)
            .await
            .ok_or_else(|| "invalid request: invalid watcher identifier".to_string())?;
        Ok(json!({ "Changes": changes }))
    }

    fn cancel(&self, params: &Map<String, Value>) -> Reply {
        let params: DeploymentParams = parse_params(params)?;
        if self.scheduler.cancel(params.deployment_id) {
            Ok(json!({}))
        } else {
            Err("invalid request: deployment not found or already started".to_string())
        }
    }

    fn status(&self, params: &Map<String, Value>) -> Reply {
        if !params.is_empty() {
            return Err(format!("{}: {}", INVALID_PARAMS, param_names(params)));
        }
        Ok(json!({ "LastChanges": self.registry().last_changes() }))
    }

    fn get_change_set(&self, params: &Map<String, Value>) -> Reply {
        if params.len() > 1 {
            return Err(format!(
                "invalid request: too many data parameters: {}",
                param_names(params)
            ));
        }
        if let Some(token) = params.get("Token") {
            let token = token.as_str().ok_or_else(|| INVALID_PARAMS.to_string())?;
            let changes = self
                .registry()
                .change_sets()
                .take(token)
                .ok_or_else(|| "unknown, fulfilled, or expired bundle token".to_string())?;
            info!(session_id = %self.session_id, "deployer: change set fetched by token");
            return Ok(json!({ "ChangeSet": changes }));
        }

        let contents = params
            .get("YAML")
            .and_then(Value::as_str)
            .ok_or_else(|| "invalid request: expected YAML or Token to be provided".to_string())?;
        Ok(match parse_change_set(contents) {
            Ok(changes) => json!({ "ChangeSet": changes }),
            Err(errors) => json!({ "Errors": errors }),
        })
    }

    fn set_change_set(&self, params: &Map<String, Value>) -> Reply {
        let contents = params
            .get("YAML")
            .and_then(Value::as_str)
            .ok_or_else(|| "invalid request: bundle YAML not found".to_string())?;
        match parse_change_set(contents) {
            Ok(changes) => {
                let issued = self.registry().change_sets().store(changes);
                info!(session_id = %self.session_id, "deployer: change set stored");
                serde_json::to_value(issued).map_err(|e| e.to_string())
            }
            Err(errors) => Ok(json!({ "Errors": errors })),
        }
    }
}

/// Change set for v4 YAML contents, or the validation errors
fn parse_change_set(contents: &str) -> Result<Vec<Change>, Vec<String>> {
    let describe = |err: BundleError| match err {
        BundleError::InvalidYaml(_) => "the provided bundle is not a valid YAML".to_string(),
        other => other.to_string(),
    };
    let (_, bundle) = Bundle::from_yaml(contents, Some(4), None).map_err(|e| vec![describe(e)])?;
    change_set(&bundle).map_err(|e| vec![describe(e)])
}

fn parse_params<T: DeserializeOwned>(params: &Map<String, Value>) -> Result<T, String> {
    serde_json::from_value(Value::Object(params.clone())).map_err(|_| INVALID_PARAMS.to_string())
}

fn param_names(params: &Map<String, Value>) -> String {
    params.keys().map(String::as_str).collect::<Vec<_>>().join(", ")
}

/// Wrap a reply in the response envelope
pub fn envelope(request_id: Value, reply: Reply) -> Value {
    match reply {
        Ok(response) => json!({ "RequestId": request_id, "Response": response }),
        Err(error) => json!({ "RequestId": request_id, "Response": {}, "Error": error }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::jobs::StatusRegistry;
    use guisrv_common::events::EventBus;
    use std::sync::Arc;
    use uuid::Uuid;

    fn handler() -> DeployerHandler {
        let registry = Arc::new(StatusRegistry::new(EventBus::new(16)));
        let scheduler = Scheduler::new(Arc::new(GatewayConfig::default()), registry);
        let sessions = SessionTable::default();
        let session_id = Uuid::new_v4();
        sessions.open(session_id, "wss://backend/api".to_string());
        DeployerHandler::new(scheduler, sessions, session_id)
    }

    fn creds() -> Option<Credentials> {
        Some(Credentials {
            user: "user-admin".to_string(),
            password: "secret".to_string(),
        })
    }

    fn request(id: u64, name: &str, params: Value) -> DeployerRequest {
        DeployerRequest {
            request_id: json!(id),
            request: name.to_string(),
            params: params.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn test_requires_login() {
        let h = handler();
        let resp = h.handle(request(1, "Status", json!({})), None).await;
        assert_eq!(resp["RequestId"], 1);
        assert_eq!(resp["Error"], UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_import_and_status() {
        let h = handler();
        let resp = h
            .handle(
                request(
                    1,
                    "Import",
                    json!({"Name": "wiki", "Bundle": {"services": {"wiki": {"charm": "cs:wiki"}}}}),
                ),
                creds(),
            )
            .await;
        assert!(resp.get("Error").is_none(), "{}", resp);
        assert_eq!(resp["Response"]["DeploymentId"], 0);
        assert_eq!(h.sessions.jobs(h.session_id), vec![0]);

        let status = h.handle(request(2, "Status", json!({})), creds()).await;
        let changes = status["Response"]["LastChanges"].as_array().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0]["Status"], "scheduled");
        assert_eq!(changes[0]["Queue"], 0);
    }

    #[tokio::test]
    async fn test_import_without_bundle_is_malformed() {
        let h = handler();
        let resp = h.handle(request(1, "Import", json!({})), creds()).await;
        let error = resp["Error"].as_str().unwrap();
        assert!(error.starts_with("MalformedBundle:"), "{}", error);
        assert!(h.scheduler.registry().is_empty());
    }

    #[tokio::test]
    async fn test_import_yaml_v4() {
        let h = handler();
        let resp = h
            .handle(
                request(
                    1,
                    "Import",
                    json!({"YAML": "services:\n  redis:\n    charm: cs:redis\n", "Version": 4}),
                ),
                creds(),
            )
            .await;
        assert_eq!(resp["Response"]["jobId"], 0);
    }

    #[tokio::test]
    async fn test_watch_next_cancel() {
        let h = handler();
        h.handle(
            request(1, "Import", json!({"Bundle": {"services": {"a": {"charm": "cs:a"}}}})),
            creds(),
        )
        .await;

        let missing = h
            .handle(request(2, "Watch", json!({"DeploymentId": 5})), creds())
            .await;
        assert_eq!(missing["Error"], "invalid request: deployment not found");

        let watch = h
            .handle(request(3, "Watch", json!({"DeploymentId": 0})), creds())
            .await;
        let watcher = watch["Response"]["WatcherId"].as_u64().unwrap();

        let cancel = h
            .handle(request(4, "Cancel", json!({"DeploymentId": 0})), creds())
            .await;
        assert_eq!(cancel["Response"], json!({}));
        assert!(cancel.get("Error").is_none());

        let next = h
            .handle(request(5, "Next", json!({"WatcherId": watcher})), creds())
            .await;
        let statuses: Vec<&str> = next["Response"]["Changes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["Status"].as_str().unwrap())
            .collect();
        assert_eq!(statuses, vec!["scheduled", "cancelled"]);

        let again = h
            .handle(request(6, "Cancel", json!({"DeploymentId": 0})), creds())
            .await;
        assert_eq!(
            again["Error"],
            "invalid request: deployment not found or already started"
        );

        let gone = h
            .handle(request(7, "Next", json!({"WatcherId": watcher})), creds())
            .await;
        assert_eq!(gone["Error"], "invalid request: invalid watcher identifier");
    }

    #[tokio::test]
    async fn test_bad_params_and_unknown_request() {
        let h = handler();
        let bad = h
            .handle(request(1, "Watch", json!({"DeploymentId": "zero"})), creds())
            .await;
        assert_eq!(bad["Error"], "invalid request: invalid data parameters");

        let status = h
            .handle(request(3, "Status", json!({"Verbose": true})), creds())
            .await;
        assert_eq!(
            status["Error"],
            "invalid request: invalid data parameters: Verbose"
        );

        let unknown = h.handle(request(2, "Explode", json!({})), creds()).await;
        assert_eq!(unknown["Error"], "unknown deployer request: Explode");
    }

    const DJANGO_YAML: &str = "services:\n  django:\n    charm: cs:trusty/django-42\n    num_units: 1\n";

    #[tokio::test]
    async fn test_get_change_set_from_yaml() {
        let h = handler();
        let resp = h
            .handle(request(1, "GetChangeSet", json!({"YAML": DJANGO_YAML})), creds())
            .await;
        let changes = resp["Response"]["ChangeSet"].as_array().unwrap();
        let methods: Vec<&str> = changes.iter().map(|c| c["method"].as_str().unwrap()).collect();
        assert_eq!(methods, vec!["addCharm", "deploy", "addUnit"]);
        assert_eq!(changes[1]["requires"], json!(["addCharm-0"]));
        assert!(h.scheduler.registry().is_empty());
    }

    #[tokio::test]
    async fn test_change_set_validation_errors() {
        let h = handler();
        let not_bundle = h
            .handle(request(1, "GetChangeSet", json!({"YAML": "42"})), creds())
            .await;
        assert!(not_bundle.get("Error").is_none());
        assert_eq!(not_bundle["Response"]["Errors"].as_array().unwrap().len(), 1);

        let not_yaml = h
            .handle(request(2, "SetChangeSet", json!({"YAML": "a: [b"})), creds())
            .await;
        assert_eq!(
            not_yaml["Response"]["Errors"],
            json!(["the provided bundle is not a valid YAML"])
        );
    }

    #[tokio::test]
    async fn test_change_set_token_is_single_use() {
        let h = handler();
        let stored = h
            .handle(request(1, "SetChangeSet", json!({"YAML": DJANGO_YAML})), creds())
            .await;
        let token = stored["Response"]["Token"].as_str().unwrap().to_string();
        assert!(stored["Response"]["Expires"].as_str().is_some());

        let first = h
            .handle(request(2, "GetChangeSet", json!({"Token": token})), creds())
            .await;
        assert_eq!(first["Response"]["ChangeSet"].as_array().unwrap().len(), 3);

        let reused = h
            .handle(request(3, "GetChangeSet", json!({"Token": token})), creds())
            .await;
        assert_eq!(reused["Error"], "unknown, fulfilled, or expired bundle token");
    }

    #[tokio::test]
    async fn test_change_set_param_errors() {
        let h = handler();
        let none = h.handle(request(1, "GetChangeSet", json!({})), creds()).await;
        assert_eq!(none["Error"], "invalid request: expected YAML or Token to be provided");

        let both = h
            .handle(
                request(2, "GetChangeSet", json!({"Token": "abc", "YAML": DJANGO_YAML})),
                creds(),
            )
            .await;
        assert!(both["Error"]
            .as_str()
            .unwrap()
            .starts_with("invalid request: too many data parameters:"));

        let missing = h.handle(request(3, "SetChangeSet", json!({})), creds()).await;
        assert_eq!(missing["Error"], "invalid request: bundle YAML not found");

        let unauthenticated = h
            .handle(request(4, "GetChangeSet", json!({"YAML": DJANGO_YAML})), None)
            .await;
        assert_eq!(unauthenticated["Error"], UNAUTHORIZED);
    }
}
