//! Integration tests for guisrv-gateway HTTP endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use guisrv_gateway::{build_router, AppState, GatewayConfig};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tower::util::ServiceExt;

/// Test helper: create test app whose jobs stay queued (driver not started)
fn create_test_app() -> (Router, AppState) {
    let state = AppState::new(GatewayConfig::default());
    (build_router(state.clone()), state)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn with_json(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn wiki_bundle() -> Value {
    json!({
        "services": {
            "wiki": {"charm": "cs:mediawiki", "num_units": 1},
            "db": {"charm": "cs:mysql"}
        },
        "relations": [["wiki:db", "db:db"]]
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _state) = create_test_app();

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "guisrv-gateway");
    assert!(body["uptime_seconds"].is_u64());
}

#[tokio::test]
async fn test_submit_returns_accepted_and_queues() {
    let (app, state) = create_test_app();

    let (status, body) = send(
        &app,
        with_json("POST", "/jobs", json!({"bundle": wiki_bundle(), "name": "wiki"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["jobId"], 0);

    let (status, body) = send(&app, get("/jobs")).await;
    assert_eq!(status, StatusCode::OK);
    let jobs = body["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["state"], "queued");
    assert_eq!(jobs[0]["name"], "wiki");
    assert_eq!(jobs[0]["queuePosition"], 0);
    assert!(jobs[0].get("startedAt").is_none());
    assert_eq!(state.registry.queue_len(), 1);
}

#[tokio::test]
async fn test_null_bundle_is_malformed() {
    let (app, state) = create_test_app();

    let (status, body) = send(&app, with_json("POST", "/jobs", json!({"bundle": null}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "MalformedBundle");
    assert_eq!(body["message"], "no bundle contents provided");

    assert!(state.registry.is_empty());
    let (_, body) = send(&app, get("/jobs")).await;
    assert_eq!(body["jobs"], json!([]));
}

#[tokio::test]
async fn test_bundle_referencing_unknown_service_is_malformed() {
    let (app, _state) = create_test_app();

    let bundle = json!({
        "services": {"wiki": {"charm": "cs:mediawiki"}},
        "relations": [["wiki:db", "mysql:db"]]
    });
    let (status, body) = send(&app, with_json("POST", "/jobs", json!({"bundle": bundle}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "MalformedBundle");
}

#[tokio::test]
async fn test_undecodable_submission_uses_error_object() {
    let (app, state) = create_test_app();

    let not_json = Request::builder()
        .method("POST")
        .uri("/jobs")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, not_json).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "BadRequest");
    assert!(body["message"].is_string());

    let (status, body) = send(
        &app,
        with_json("POST", "/jobs", json!({"bundle": wiki_bundle(), "name": 42})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "BadRequest");

    let no_content_type = Request::builder()
        .method("POST")
        .uri("/jobs")
        .body(Body::from(json!({"bundle": wiki_bundle()}).to_string()))
        .unwrap();
    let (status, body) = send(&app, no_content_type).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "BadRequest");

    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let (app, _state) = create_test_app();

    let (status, body) = send(&app, get("/jobs/42")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NotFound");

    let (status, _) = send(&app, with_json("POST", "/jobs/42/cancel", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_job_detail() {
    let (app, _state) = create_test_app();
    send(
        &app,
        with_json("POST", "/jobs", json!({"bundle": wiki_bundle(), "bundleId": "~admin/wiki/1"})),
    )
    .await;

    let (status, body) = send(&app, get("/jobs/0")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], 0);
    assert_eq!(body["name"], "~admin/wiki/1");
    assert_eq!(body["bundleId"], "~admin/wiki/1");
    assert_eq!(body["bundle"]["services"]["wiki"]["charm"], "cs:mediawiki");
    assert_eq!(body["progress"], json!([]));
}

#[tokio::test]
async fn test_cancel_queued_job() {
    let (app, _state) = create_test_app();
    send(&app, with_json("POST", "/jobs", json!({"bundle": wiki_bundle()}))).await;
    send(&app, with_json("POST", "/jobs", json!({"bundle": wiki_bundle()}))).await;

    let (status, body) = send(&app, with_json("POST", "/jobs/0/cancel", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"cancelled": true, "state": "cancelled"}));

    // Already terminal: reported, not changed
    let (_, body) = send(&app, with_json("POST", "/jobs/0/cancel", json!({}))).await;
    assert_eq!(body, json!({"cancelled": false, "state": "cancelled"}));

    // The remaining job moved to the head of the queue
    let (_, body) = send(&app, get("/jobs/1")).await;
    assert_eq!(body["queuePosition"], 0);
}

#[tokio::test]
async fn test_snapshot_is_stable_without_activity() {
    let (app, _state) = create_test_app();
    send(&app, with_json("POST", "/jobs", json!({"bundle": wiki_bundle()}))).await;
    send(&app, with_json("POST", "/jobs/0/cancel", json!({}))).await;
    send(&app, with_json("POST", "/jobs", json!({"bundle": wiki_bundle()}))).await;

    let (_, first) = send(&app, get("/jobs")).await;
    let (_, second) = send(&app, get("/jobs")).await;
    assert_eq!(first, second);
    let ids: Vec<u64> = first["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![0, 1]);
}

#[tokio::test]
async fn test_frame_tracing_toggle() {
    let (app, state) = create_test_app();
    let mut events = state.event_bus.subscribe();

    let (_, body) = send(&app, get("/frame-tracing")).await;
    assert_eq!(body, json!({"enabled": false}));

    let (status, body) =
        send(&app, with_json("PUT", "/frame-tracing", json!({"enabled": true}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"enabled": true}));
    assert!(state.frame_tracer.is_enabled());

    let event = events.recv().await.unwrap();
    assert_eq!(event.event_type(), "FrameTracingChanged");

    let (_, body) = send(&app, get("/gui-server-info")).await;
    assert_eq!(body["debug"], true);
}

#[tokio::test]
async fn test_server_info() {
    let (app, _state) = create_test_app();
    send(&app, with_json("POST", "/jobs", json!({"bundle": wiki_bundle()}))).await;

    let (status, body) = send(&app, get("/gui-server-info")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["apiurl"], "wss://127.0.0.1:17070");
    assert_eq!(body["debug"], false);
    assert_eq!(body["deployer"]["queued"], 1);
    assert_eq!(body["deployer"]["running"], 0);
    assert_eq!(body["deployer"]["maxConcurrent"], 1);
    assert_eq!(body["deployer"]["jobs"][0]["state"], "queued");
    assert_eq!(body["sessions"], json!([]));
}

#[cfg(unix)]
#[tokio::test]
async fn test_submitted_job_runs_to_completion() {
    let config = GatewayConfig {
        worker_command: PathBuf::from("/bin/sh"),
        worker_args: vec![
            "-c".to_string(),
            r#"read line; echo '{"type":"progress","message":"deploying"}'; echo '{"type":"result","payload":{"services":2}}'"#
                .to_string(),
        ],
        worker_exit_grace: Duration::from_millis(200),
        ..GatewayConfig::default()
    };
    let state = AppState::new(config);
    let app = build_router(state.clone());
    let driver = state.scheduler.start(state.shutdown.clone());

    send(&app, with_json("POST", "/jobs", json!({"bundle": wiki_bundle()}))).await;

    let mut body = Value::Null;
    for _ in 0..100 {
        body = send(&app, get("/jobs/0")).await.1;
        if body["state"] == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(body["state"], "completed", "{}", body);
    assert_eq!(body["result"], json!({"services": 2}));
    assert_eq!(body["progress"][0]["message"], "deploying");
    assert!(body["startedAt"].is_string());
    assert!(body["finishedAt"].is_string());

    state.shutdown.cancel();
    driver.await.unwrap();
}
