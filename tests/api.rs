//! Integration tests for the HTTP surface, driven through the router with `oneshot`.

mod common;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use common::{body_bytes, body_json, send, RecordingScheduler, ScriptedExecutor, DOMAIN, OWNER};
use flowkeeper::{
    api::{webhooks::sign_payload, AppState},
    config::Config,
    runtime::NodeRegistry,
    scheduler::JobScheduler,
    server::create_router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

async fn build_app(config: Config, scheduler: Arc<RecordingScheduler>) -> Router {
    let mut registry = NodeRegistry::with_builtin_nodes();
    registry
        .register("ok-step", ScriptedExecutor::ok(json!({ "done": true })))
        .register("bad-step", ScriptedExecutor::failing("upstream said no"));
    let scheduler: Arc<dyn JobScheduler> = scheduler;
    let state = AppState::new(common::pool().await, Arc::new(config), scheduler, Arc::new(registry));
    create_router(state)
}

async fn app() -> Router {
    build_app(common::test_config(), RecordingScheduler::new()).await
}

fn flow_body(id: &str, trigger: Value, steps: Value) -> Value {
    json!({ "flow": { "id": id, "name": "Test flow", "creator_id": "ignored", "trigger": trigger, "steps": steps } })
}

fn cron_trigger() -> Value {
    json!({ "node_id": "interval-trigger", "propsData": { "cron": "0 9 * * *", "timezone": "Africa/Lagos" } })
}

async fn webhook(app: Router, body: &str, signature: Option<&str>) -> axum::response::Response {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/api/webhooks/email")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header("x-webhook-signature", signature);
    }
    app.oneshot(builder.body(Body::from(body.to_string())).unwrap()).await.unwrap()
}

#[tokio::test]
async fn health_check_returns_ok() {
    let response = send(app().await, Method::GET, "/healthz", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"ok");
}

#[tokio::test]
async fn webhook_rejects_non_post() {
    let response = send(app().await, Method::GET, "/api/webhooks/email", None, None).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn webhook_rejects_malformed_payloads() {
    let response = webhook(app().await, "{not json", None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], json!("invalid-argument"));

    let response = webhook(app().await, r#"{"hello":"world"}"#, None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn webhook_checks_signatures_when_configured() {
    let mut config = common::test_config();
    config.email.webhook_secret = Some("shh".to_string());
    let body = json!({
        "fromAddress": "a@b.com",
        "toAddress": [format!("nobody12@{}", DOMAIN)],
        "subject": "Hi"
    })
    .to_string();

    let app = build_app(config, RecordingScheduler::new()).await;

    let response = webhook(app.clone(), &body, Some("sha256=deadbeef")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], json!("unauthenticated"));

    let signature = format!("sha256={}", sign_payload("shh", body.as_bytes()).unwrap());
    let response = webhook(app.clone(), &body, Some(&signature)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["success"], json!(true));
    assert_eq!(json["processed_triggers"], json!(0));
    assert_eq!(json["results"][0]["triggerId"], json!("nobody12"));
    assert_eq!(json["results"][0]["status"], json!("failed"));
    assert_eq!(json["results"][0]["reason"], json!("TRIGGER_NOT_FOUND"));

    // Unsigned deliveries are accepted
    let response = webhook(app, &body, None).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn flow_routes_require_a_caller() {
    let response = send(app().await, Method::GET, "/api/flows", None, None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn flow_lifecycle_over_http() {
    let scheduler = RecordingScheduler::new();
    let app = build_app(common::test_config(), scheduler.clone()).await;

    let body = flow_body("f-http", cron_trigger(), json!([{ "node_id": "ok-step", "propsData": {} }]));
    let response = send(app.clone(), Method::POST, "/api/flows", Some(OWNER), Some(body.clone())).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(app.clone(), Method::POST, "/api/flows", Some(OWNER), Some(body)).await;
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);

    let response = send(app.clone(), Method::GET, "/api/flows/f-http", Some(OWNER), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let flow = body_json(response).await;
    assert_eq!(flow["creator_id"], json!(OWNER));
    assert_eq!(flow["status"], json!(0));

    let response = send(app.clone(), Method::GET, "/api/flows/f-http", Some("mallory"), None).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let response = send(app.clone(), Method::GET, "/api/flows/nope", Some(OWNER), None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(app.clone(), Method::GET, "/api/flows", Some(OWNER), None).await;
    let listed = body_json(response).await;
    assert_eq!(listed["flows"].as_array().unwrap().len(), 1);
    assert_eq!(listed["flows"][0]["trigger"], json!("interval-trigger"));

    let response = send(app.clone(), Method::POST, "/api/flows/f-http/activate", Some(OWNER), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let activation = body_json(response).await;
    assert_eq!(activation["success"], json!(true));
    assert_eq!(activation["scheduleId"], json!("scd_1"));
    assert_eq!(activation["cron_used"], json!("0 8 * * *"));
    assert_eq!(scheduler.scheduled().len(), 1);

    // The scheduler fires
    let fire = json!({ "flowId": "f-http", "userId": OWNER, "executionId": "exec-1" });
    let response = send(app.clone(), Method::POST, "/api/executions", None, Some(fire)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let report = body_json(response).await;
    assert_eq!(report["executionId"], json!("exec-1"));
    assert_eq!(report["status"], json!("completed"));
    assert_eq!(report["stepsCompleted"], json!(1));
    assert_eq!(report["results"]["step-0-ok-step"]["done"], json!(true));

    let response = send(app.clone(), Method::GET, "/api/flows/f-http/executions/exec-1", Some(OWNER), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let log = body_json(response).await;
    assert_eq!(log["execution"]["status"], json!("completed"));
    assert_eq!(log["steps"].as_array().unwrap().len(), 2);
    assert_eq!(log["steps"][0]["key"], json!("trigger-interval-trigger"));

    let response = send(app.clone(), Method::POST, "/api/flows/f-http/deactivate", Some(OWNER), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(scheduler.cancelled(), vec!["scd_1".to_string()]);

    let response = send(app.clone(), Method::DELETE, "/api/flows/f-http", Some(OWNER), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = send(app, Method::GET, "/api/flows/f-http", Some(OWNER), None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn failed_runs_answer_with_an_error_status() {
    let app = app().await;
    let body = flow_body("f-bad", cron_trigger(), json!([{ "node_id": "bad-step", "propsData": {} }]));
    send(app.clone(), Method::POST, "/api/flows", Some(OWNER), Some(body)).await;

    let fire = json!({ "flowId": "f-bad", "userId": OWNER, "executionId": "exec-bad" });
    let response = send(app.clone(), Method::POST, "/api/executions", None, Some(fire)).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(response).await;
    assert_eq!(json["code"], json!("step-failed"));
    assert_eq!(json["executionId"], json!("exec-bad"));
    assert_eq!(json["nodeId"], json!("bad-step"));

    let response = send(app.clone(), Method::GET, "/api/flows/f-bad/executions/exec-bad", Some(OWNER), None).await;
    let log = body_json(response).await;
    assert_eq!(log["execution"]["status"], json!("failed"));
    assert_eq!(log["execution"]["error"]["message"], json!("upstream said no"));

    let notice = json!({ "destination": "http://engine.test/api/executions", "body": { "flowId": "f-bad" }, "error": "500" });
    let response = send(app, Method::POST, "/api/executions/failed", None, Some(notice)).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn email_address_endpoint_is_stable() {
    let app = app().await;
    let trigger = json!({ "node_id": "email-trigger", "propsData": {} });
    let body = flow_body("f-mail", trigger, json!([{ "node_id": "ok-step", "propsData": {} }]));
    send(app.clone(), Method::POST, "/api/flows", Some(OWNER), Some(body)).await;

    let first = body_json(send(app.clone(), Method::POST, "/api/flows/f-mail/email-address", Some(OWNER), None).await).await;
    let second = body_json(send(app.clone(), Method::POST, "/api/flows/f-mail/email-address", Some(OWNER), None).await).await;
    assert_eq!(first["unique_email"], second["unique_email"]);

    let activation = body_json(send(app, Method::POST, "/api/flows/f-mail/activate", Some(OWNER), None).await).await;
    assert_eq!(activation["triggerType"], json!("email-trigger"));
    assert_eq!(activation["unique_email"], first["unique_email"]);
}
