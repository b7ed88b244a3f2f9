//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use processing::ProcessingError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Command pipeline error.
    Processing(ProcessingError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Processing(err) => processing_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn processing_error_to_response(err: ProcessingError) -> (StatusCode, String) {
    let status = match &err {
        ProcessingError::AggregateNotFound { .. } | ProcessingError::HandlerNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        ProcessingError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ProcessingError::ConcurrencyConflictExhausted { .. } => StatusCode::CONFLICT,
        ProcessingError::MailboxFull(_) | ProcessingError::ShutDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ProcessingError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ProcessingError::InvalidAggregate(_)
        | ProcessingError::Storage(_)
        | ProcessingError::Serialization(_) => {
            tracing::error!(error = %err, "internal server error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

impl From<ProcessingError> for ApiError {
    fn from(err: ProcessingError) -> Self {
        ApiError::Processing(err)
    }
}
