/// HTTP API Layer
///
/// This module provides the REST surface of the engine. It handles:
/// - Flow CRUD plus activation, deactivation and address generation
/// - The execution endpoint the Job Scheduler calls back into
/// - The inbound email webhook

// Flow management and activation endpoints
pub mod flows;

// Execution endpoint, failure callback and log reads
pub mod executions;

// Inbound email webhook
pub mod webhooks;

use crate::{
    activation::ActivationManager,
    config::Config,
    error::{EngineError, EngineResult},
    flow::FlowStorage,
    inbound::{InboundEmailProcessor, InboundLogStorage, TriggerStorage},
    runtime::{ExecutionLogStorage, ExecutionOrchestrator, NodeRegistry},
    scheduler::JobScheduler,
};
use axum::http::HeaderMap;
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;

pub use executions::create_execution_routes;
pub use flows::create_flow_routes;
pub use webhooks::create_webhook_routes;

/// Header carrying the authenticated caller's user id
pub const USER_ID_HEADER: &str = "x-user-id";

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub flows: FlowStorage,
    pub logs: ExecutionLogStorage,
    pub activation: Arc<ActivationManager>,
    pub orchestrator: Arc<ExecutionOrchestrator>,
    pub inbound: Arc<InboundEmailProcessor>,
}

impl AppState {
    /// Wire every component over one pool and one Job Scheduler
    pub fn new(
        pool: SqlitePool,
        config: Arc<Config>,
        scheduler: Arc<dyn JobScheduler>,
        registry: Arc<NodeRegistry>,
    ) -> Self {
        let flows = FlowStorage::new(pool.clone());
        let logs = ExecutionLogStorage::new(pool.clone());
        let triggers = TriggerStorage::new(pool.clone());
        let inbound_logs = InboundLogStorage::new(pool);

        Self {
            activation: Arc::new(ActivationManager::new(
                flows.clone(),
                triggers.clone(),
                scheduler.clone(),
                config.clone(),
            )),
            orchestrator: Arc::new(ExecutionOrchestrator::new(flows.clone(), logs.clone(), registry)),
            inbound: Arc::new(InboundEmailProcessor::new(
                triggers,
                inbound_logs,
                flows.clone(),
                scheduler,
                config.clone(),
            )),
            config,
            flows,
            logs,
        }
    }
}

/// Caller identity from the request headers
pub fn caller_id(headers: &HeaderMap) -> EngineResult<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| EngineError::Unauthenticated(format!("Missing {} header", USER_ID_HEADER)))
}
