//! Shared fixtures for the integration tests: in-memory store, a recording Job
//! Scheduler, scripted step executors and request helpers.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request},
    response::Response,
    Router,
};
use flowkeeper::{
    config::{Config, DatabaseConfig, EmailConfig, SchedulerConfig, ServerConfig},
    database,
    flow::{Flow, FlowStatus, FlowStorage, NodeSpec},
    runtime::{PriorResults, RunContext, StepExecutor},
    scheduler::{CronRequest, DispatchRequest, JobScheduler},
};
use http_body_util::BodyExt;
use serde_json::{json, Map, Value};
use sqlx::sqlite::SqlitePool;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use tower::ServiceExt;

pub const DOMAIN: &str = "flows.test.dev";
pub const OWNER: &str = "user-alpha";

pub async fn pool() -> SqlitePool {
    database::connect_in_memory().await.expect("in-memory database")
}

pub fn test_config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            public_url: "http://engine.test".to_string(),
        },
        database: DatabaseConfig {
            data_dir: "unused".to_string(),
        },
        email: EmailConfig {
            domain: DOMAIN.to_string(),
            webhook_secret: None,
        },
        scheduler: SchedulerConfig {
            url: None,
            token: None,
            retries: 1,
        },
    }
}

/// Job Scheduler double that records every call
#[derive(Default)]
pub struct RecordingScheduler {
    pub published: Mutex<Vec<DispatchRequest>>,
    pub scheduled: Mutex<Vec<CronRequest>>,
    pub cancelled: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A scheduler that rejects every registration
    pub fn failing() -> Arc<Self> {
        Arc::new(Self { fail: true, ..Default::default() })
    }

    pub fn published(&self) -> Vec<DispatchRequest> {
        self.published.lock().unwrap().clone()
    }

    pub fn scheduled(&self) -> Vec<CronRequest> {
        self.scheduled.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobScheduler for RecordingScheduler {
    async fn publish(&self, request: DispatchRequest) -> Result<String> {
        if self.fail {
            anyhow::bail!("scheduler unavailable");
        }
        let mut published = self.published.lock().unwrap();
        published.push(request);
        Ok(format!("msg_{}", published.len()))
    }

    async fn schedule(&self, request: CronRequest) -> Result<String> {
        if self.fail {
            anyhow::bail!("scheduler unavailable");
        }
        let mut scheduled = self.scheduled.lock().unwrap();
        scheduled.push(request);
        Ok(format!("scd_{}", scheduled.len()))
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        self.cancelled.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

/// Step executor returning a fixed result and counting its invocations
#[derive(Clone)]
pub struct ScriptedExecutor {
    result: Value,
    pub calls: Arc<AtomicUsize>,
}

impl ScriptedExecutor {
    pub fn ok(output: Value) -> Self {
        let mut result = json!({ "success": true });
        if let (Some(target), Value::Object(extra)) = (result.as_object_mut(), output) {
            target.extend(extra);
        }
        Self { result, calls: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn failing(error: &str) -> Self {
        Self {
            result: json!({ "success": false, "error": error }),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        "Scripted"
    }

    async fn run(&self, _ctx: &RunContext, _config: &Map<String, Value>, _prior: &PriorResults) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.result.clone())
    }
}

/// Reports which earlier results it could see
pub struct PriorKeysExecutor;

#[async_trait]
impl StepExecutor for PriorKeysExecutor {
    fn name(&self) -> &str {
        "Prior keys"
    }

    async fn run(&self, ctx: &RunContext, _config: &Map<String, Value>, prior: &PriorResults) -> Result<Value> {
        Ok(json!({
            "success": true,
            "seen": prior.keys().cloned().collect::<Vec<_>>(),
            "user": ctx.user_id,
        }))
    }
}

pub fn node(node_id: &str, props: Value) -> NodeSpec {
    NodeSpec::new(node_id, props)
}

pub fn flow(id: &str, trigger: NodeSpec, steps: Vec<NodeSpec>) -> Flow {
    Flow {
        id: id.to_string(),
        name: format!("Flow {}", id),
        creator_id: OWNER.to_string(),
        status: FlowStatus::Draft,
        trigger: Some(trigger),
        steps,
        schedule: None,
    }
}

pub async fn store(flows: &FlowStorage, flow: &Flow) {
    flows.save_flow(flow).await.expect("save flow");
}

pub async fn send(app: Router, method: Method, uri: &str, user: Option<&str>, body: Option<Value>) -> Response {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    app.oneshot(builder.body(body).unwrap()).await.unwrap()
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

pub async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
