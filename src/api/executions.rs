/// Execution endpoints
///
/// `POST /api/executions` is the destination every Job Scheduler registration points
/// at. A non-2xx answer makes the scheduler retry, and once retries run out it posts
/// to `/api/executions/failed`.

use crate::{
    api::{caller_id, flows::owned_flow, AppState},
    error::{EngineError, EngineResult},
    runtime::{ExecutionRequest, RunReport},
};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};

pub fn create_execution_routes() -> Router<AppState> {
    Router::new()
        .route("/api/executions", post(execute_flow))
        .route("/api/executions/failed", post(execution_failed))
        .route("/api/flows/{id}/executions/{execution_id}", get(get_execution))
}

/// POST /api/executions
/// Body: { "flowId": "...", "userId": "...", "executionId": "...", "triggerInput": {...} }
async fn execute_flow(
    State(state): State<AppState>,
    Json(request): Json<ExecutionRequest>,
) -> EngineResult<Json<RunReport>> {
    tracing::info!("📥 Execution request for flow {}", request.flow_id);
    if request.flow_id.trim().is_empty() || request.user_id.trim().is_empty() {
        return Err(EngineError::InvalidArgument("flowId and userId are required".to_string()));
    }
    Ok(Json(state.orchestrator.execute(request).await?))
}

/// POST /api/executions/failed
///
/// Exhaustion notice from the Job Scheduler. The run logs already say `failed`;
/// this only records that no further attempt is coming.
async fn execution_failed(Json(notice): Json<Value>) -> Json<Value> {
    let flow_id = notice
        .pointer("/body/flowId")
        .or_else(|| notice.get("flowId"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    tracing::error!("💀 Scheduler gave up on flow {}: {}", flow_id, notice);
    Json(json!({ "success": true }))
}

/// GET /api/flows/{id}/executions/{execution_id}
async fn get_execution(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((flow_id, execution_id)): Path<(String, String)>,
) -> EngineResult<Json<Value>> {
    let user_id = caller_id(&headers)?;
    owned_flow(&state, &flow_id, &user_id).await?;

    let run = state
        .logs
        .get_run(&execution_id)
        .await?
        .filter(|run| run.flow_id == flow_id)
        .ok_or_else(|| EngineError::NotFound(format!("Execution not found: {}", execution_id)))?;
    let steps = state.logs.list_steps(&execution_id).await?;

    Ok(Json(json!({ "execution": run, "steps": steps })))
}
