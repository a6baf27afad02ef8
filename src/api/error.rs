//! Maps service errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::service::ServiceError;

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let (status, body) = match &self {
            ServiceError::NotFound { .. } => (
                StatusCode::NOT_FOUND,
                json!({ "timestamp": timestamp, "message": self.to_string() }),
            ),
            ServiceError::InvalidCommand(_) => (
                StatusCode::BAD_REQUEST,
                json!({ "timestamp": timestamp, "message": self.to_string() }),
            ),
            ServiceError::Storage(e) => {
                tracing::error!(error = %e, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "timestamp": timestamp,
                        "message": "An unexpected error occurred",
                        "error": format!("{:#}", e),
                    }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
