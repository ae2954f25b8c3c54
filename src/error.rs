//! # Error Handling
//!
//! HTTP-facing error type. Domain modules keep their own `thiserror` enums
//! (`CodecError`, `EndpointError`, `OrchestratorError`); this module decides how
//! they look to REST clients.
//!
//! ## Key Rust Concepts for Error Handling:
//! - **thiserror**: derives `Display` and `std::error::Error` from the `#[error]` attributes
//! - **From trait**: lets `?` convert domain errors into `AppError` automatically
//! - **ResponseError trait**: converts errors to HTTP responses
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "conflict",
//!     "message": "previous session ... could not be released cleanly",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use crate::session::OrchestratorError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;

/// Custom error types for the application.
///
/// ## Error Categories:
/// - **Internal** / **ConfigError**: server-side problems (500)
/// - **BadRequest** / **ValidationError**: client sent invalid data (400)
/// - **NotFound**: requested resource doesn't exist (404)
/// - **Conflict**: the owner's previous session is still being released (409)
/// - **Unavailable**: the server is at its session limit (503)
/// - **Upstream**: the conversational endpoint failed (502)
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "capacity_exceeded", msg),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, "endpoint_error", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();
        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        let message = err.to_string();
        match err {
            OrchestratorError::Conflict(_) => AppError::Conflict(message),
            OrchestratorError::Capacity(_) => AppError::Unavailable(message),
            OrchestratorError::NotFound(_) => AppError::NotFound(message),
            OrchestratorError::InvalidState { .. } => AppError::BadRequest(message),
            OrchestratorError::InvalidInput(_) => AppError::ValidationError(message),
            OrchestratorError::Connection(_) => AppError::Upstream(message),
            OrchestratorError::ResourceRelease(_) => AppError::Internal(message),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointError;
    use crate::session::SessionStatus;

    #[test]
    fn test_orchestrator_errors_map_to_status_codes() {
        let cases = [
            (OrchestratorError::Conflict("s1".to_string()), StatusCode::CONFLICT),
            (OrchestratorError::Capacity(10), StatusCode::SERVICE_UNAVAILABLE),
            (OrchestratorError::NotFound("s1".to_string()), StatusCode::NOT_FOUND),
            (
                OrchestratorError::InvalidState {
                    session_id: "s1".to_string(),
                    status: SessionStatus::Paused,
                    operation: "interrupt",
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                OrchestratorError::Connection(EndpointError::terminal("AUTH_REJECTED", "401")),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status_code(), status);
        }
    }

    #[test]
    fn test_error_response_body() {
        let response = AppError::NotFound("session s9".to_string()).error_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
