/// Coded engine errors
///
/// Validation failures, scheduling failures and step failures each carry a stable
/// code string so callers (and the Job Scheduler's retry logic) can tell them apart.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("{0}")]
    Unimplemented(String),

    #[error("{0}")]
    Unauthenticated(String),

    /// Wraps Job Scheduler rejections and other upstream failures
    #[error("{0}")]
    Internal(String),

    /// A trigger or step reported failure; the run is already logged as failed
    #[error("step '{node_id}' ({name}) failed: {message}")]
    StepFailed {
        execution_id: String,
        node_id: String,
        name: String,
        message: String,
    },

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidArgument(_) => "invalid-argument",
            EngineError::NotFound(_) => "not-found",
            EngineError::PermissionDenied(_) => "permission-denied",
            EngineError::FailedPrecondition(_) => "failed-precondition",
            EngineError::Unimplemented(_) => "unimplemented",
            EngineError::Unauthenticated(_) => "unauthenticated",
            EngineError::Internal(_) | EngineError::Storage(_) => "internal",
            EngineError::StepFailed { .. } => "step-failed",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            EngineError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            EngineError::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
            EngineError::Unimplemented(_) => StatusCode::NOT_IMPLEMENTED,
            EngineError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            EngineError::Internal(_) | EngineError::Storage(_) | EngineError::StepFailed { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "❌ Request failed");
        } else {
            tracing::warn!(code = self.code(), error = %self, "⚠️ Request rejected");
        }

        let mut body = json!({
            "success": false,
            "code": self.code(),
            "error": self.to_string(),
        });
        if let EngineError::StepFailed { execution_id, node_id, .. } = &self {
            body["executionId"] = json!(execution_id);
            body["nodeId"] = json!(node_id);
        }

        (status, Json(body)).into_response()
    }
}
