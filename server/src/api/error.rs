//! API error handling.
//!
//! Provides consistent error responses for the API, and maps the engine's
//! error kinds onto the HTTP status codes from the error handling design
//! (§7): TransientProducerFailure→409, WaitTimeout→408, NotFound→404,
//! MalformedRequest→400, StoreIOError/FatalConfig→500.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use engine::EngineError;
use serde::Serialize;

use crate::error::Error;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error type that can be converted to HTTP responses.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error.
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Add details to the error.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Create a 400 Bad Request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "MALFORMED_REQUEST", message)
    }

    /// Create a 404 Not Found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    /// Create a 408 Request Timeout error.
    pub fn request_timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::REQUEST_TIMEOUT, "WAIT_TIMEOUT", message)
    }

    /// Create a 409 Conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "TRANSIENT_PRODUCER_FAILURE", message)
    }

    /// Create a 500 Internal Server Error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code,
            message: self.message,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::TransientProducerFailure { id } => ApiError::conflict(format!(
                "encoder was replaced before producing chunk {id}; retry"
            )),
            EngineError::WaitTimeout { id } => {
                ApiError::request_timeout(format!("timed out waiting for chunk {id}"))
            }
            EngineError::NotFound(quality) => {
                ApiError::not_found(format!("unknown quality '{quality}'"))
            }
            EngineError::MalformedRequest(msg) => ApiError::bad_request(msg),
            EngineError::StoreIoError(e) => {
                tracing::error!("segment store I/O error: {e}");
                ApiError::internal("failed to read segment")
            }
            EngineError::FatalConfig(msg) => {
                tracing::error!("failed to launch encoder: {msg}");
                ApiError::internal("failed to launch encoder")
            }
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Engine(engine_err) => engine_err.into(),
            Error::Configuration(msg) => ApiError::bad_request(msg),
            Error::Io(e) => {
                tracing::error!("IO error: {e}");
                ApiError::internal("IO error occurred")
            }
            Error::Other(msg) => {
                tracing::error!("Unexpected error: {msg}");
                ApiError::internal("An unexpected error occurred")
            }
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_creation() {
        let err = ApiError::not_found("quality not found");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.code, "NOT_FOUND");
    }

    #[test]
    fn test_api_error_with_details() {
        let err = ApiError::bad_request("bad filename")
            .with_details(serde_json::json!({"field": "filename"}));

        assert!(err.details.is_some());
    }

    #[test]
    fn wait_timeout_maps_to_408() {
        let api_err: ApiError = EngineError::WaitTimeout { id: 5 }.into();
        assert_eq!(api_err.status, StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn transient_producer_failure_maps_to_409() {
        let api_err: ApiError = EngineError::TransientProducerFailure { id: 5 }.into();
        assert_eq!(api_err.status, StatusCode::CONFLICT);
    }

    #[test]
    fn not_found_maps_to_404() {
        let api_err: ApiError = EngineError::NotFound("4k".into()).into();
        assert_eq!(api_err.status, StatusCode::NOT_FOUND);
    }
}
