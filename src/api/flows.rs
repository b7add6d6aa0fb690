/// Flow management REST API endpoints
///
/// CRUD over flow documents plus the activation entry points. Every route is scoped
/// to the caller named by the `x-user-id` header; only a flow's creator may touch it.

use crate::{
    activation::ActivationOutcome,
    api::{caller_id, AppState},
    error::{EngineError, EngineResult},
    flow::{Flow, FlowStatus},
};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Response for flow creation/update operations
#[derive(Debug, Serialize)]
pub struct FlowResponse {
    pub id: String,
    pub message: String,
}

/// Request body for flow creation and update
#[derive(Debug, Deserialize)]
pub struct FlowRequest {
    pub flow: Flow,
}

pub fn create_flow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/flows", post(create_flow).get(list_flows))
        .route("/api/flows/{id}", get(get_flow).put(update_flow).delete(delete_flow))
        .route("/api/flows/{id}/activate", post(activate_flow))
        .route("/api/flows/{id}/deactivate", post(deactivate_flow))
        .route("/api/flows/{id}/email-address", post(generate_email_address))
}

/// Load a flow and check the caller owns it
pub(crate) async fn owned_flow(state: &AppState, id: &str, user_id: &str) -> EngineResult<Flow> {
    let flow = state
        .flows
        .get_flow(id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("Flow not found: {}", id)))?;
    if flow.creator_id != user_id {
        return Err(EngineError::PermissionDenied(format!("Flow {} belongs to another user", id)));
    }
    Ok(flow)
}

/// POST /api/flows
/// Body: { "flow": { "id": "...", "name": "...", "trigger": {...}, "steps": [...] } }
async fn create_flow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<FlowRequest>,
) -> EngineResult<Json<FlowResponse>> {
    let user_id = caller_id(&headers)?;
    let mut flow = payload.flow;

    if flow.id.trim().is_empty() {
        return Err(EngineError::InvalidArgument("Flow id is required".to_string()));
    }
    if state.flows.get_flow(&flow.id).await?.is_some() {
        return Err(EngineError::FailedPrecondition(format!("Flow {} already exists", flow.id)));
    }

    // Flows start life as drafts; only activation arms them
    flow.creator_id = user_id;
    flow.status = FlowStatus::Draft;
    flow.schedule = None;
    state.flows.save_flow(&flow).await?;

    tracing::info!("🔥 Created flow: {} ({})", flow.id, flow.name);
    Ok(Json(FlowResponse {
        message: format!("Flow '{}' created successfully", flow.name),
        id: flow.id,
    }))
}

/// GET /api/flows
async fn list_flows(State(state): State<AppState>, headers: HeaderMap) -> EngineResult<Json<Value>> {
    let user_id = caller_id(&headers)?;
    let flows = state.flows.list_flows(&user_id).await?;
    Ok(Json(json!({ "flows": flows })))
}

/// GET /api/flows/{id}
async fn get_flow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> EngineResult<Json<Flow>> {
    let user_id = caller_id(&headers)?;
    Ok(Json(owned_flow(&state, &id, &user_id).await?))
}

/// PUT /api/flows/{id}
///
/// Replaces trigger and steps. Status and schedule stay as activation left them.
async fn update_flow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<FlowRequest>,
) -> EngineResult<Json<FlowResponse>> {
    let user_id = caller_id(&headers)?;
    let existing = owned_flow(&state, &id, &user_id).await?;

    let mut flow = payload.flow;
    flow.id = existing.id;
    flow.creator_id = existing.creator_id;
    flow.status = existing.status;
    flow.schedule = existing.schedule;
    state.flows.save_flow(&flow).await?;

    tracing::info!("✏️ Updated flow: {} ({})", flow.id, flow.name);
    Ok(Json(FlowResponse {
        message: format!("Flow '{}' updated successfully", flow.name),
        id: flow.id,
    }))
}

/// DELETE /api/flows/{id}
async fn delete_flow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> EngineResult<Json<Value>> {
    let user_id = caller_id(&headers)?;
    let flow = owned_flow(&state, &id, &user_id).await?;

    if flow.is_active() {
        state.activation.deactivate(&id, &user_id).await?;
    }
    if !state.flows.delete_flow(&id).await? {
        return Err(EngineError::NotFound(format!("Flow not found: {}", id)));
    }

    tracing::info!("🗑️ Deleted flow: {}", id);
    Ok(Json(json!({ "success": true, "message": "Flow deleted successfully" })))
}

/// POST /api/flows/{id}/activate
async fn activate_flow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> EngineResult<Json<ActivationOutcome>> {
    let user_id = caller_id(&headers)?;
    Ok(Json(state.activation.activate(&id, &user_id).await?))
}

/// POST /api/flows/{id}/deactivate
async fn deactivate_flow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> EngineResult<Json<ActivationOutcome>> {
    let user_id = caller_id(&headers)?;
    Ok(Json(state.activation.deactivate(&id, &user_id).await?))
}

/// POST /api/flows/{id}/email-address
async fn generate_email_address(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> EngineResult<Json<Value>> {
    let user_id = caller_id(&headers)?;
    let address = state.activation.generate_email_address(&id, &user_id).await?;
    Ok(Json(json!({ "success": true, "unique_email": address })))
}
