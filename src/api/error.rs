//! API error mapping with stable machine-readable reasons.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::orchestrator::OrchestratorError;

/// Wrapper turning orchestrator failures into HTTP responses.
///
/// | Failure | Status | Reason |
/// |---|---|---|
/// | unknown id / track | 404 | `NotFound` |
/// | illegal transition | 409 | `InvalidTransition` |
/// | queue cap exceeded | 409 | `QueueFull` |
/// | store/metadata error | 500 | `Internal` |
#[derive(Debug)]
pub struct ApiError(pub OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason) = match &self.0 {
            OrchestratorError::NotFound(_) | OrchestratorError::UnknownTrack(_) => {
                (StatusCode::NOT_FOUND, "NotFound")
            }
            OrchestratorError::InvalidTransition { .. } => {
                (StatusCode::CONFLICT, "InvalidTransition")
            }
            OrchestratorError::QueueFull { .. } => (StatusCode::CONFLICT, "QueueFull"),
            OrchestratorError::Store(_) | OrchestratorError::Track(_) => {
                error!(error = %self.0, "internal error serving API request");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal")
            }
        };

        let body = json!({
            "error": self.0.to_string(),
            "reason": reason,
        });
        (status, Json(body)).into_response()
    }
}
