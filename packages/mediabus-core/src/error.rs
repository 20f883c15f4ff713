//! Centralized error types for the MediaBus core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses
//!
//! Domain-level outcomes (challenge expired, pairing blocked, not found)
//! are NOT errors - runtime operations model those as return-type variants.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Application-wide error type for the MediaBus host.
#[derive(Debug, Error)]
pub enum MediaBusError {
    /// Malformed path, name, or query argument.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// No session cookie, or the cookie failed verification.
    #[error("Not authorized")]
    NotAuthorized,

    /// The session's device was revoked and a notice is pending.
    #[error("Device access revoked: {0}")]
    Revoked(String),

    /// A host policy toggle denies the operation.
    #[error("Operation not permitted: {0}")]
    PolicyDenied(String),

    /// Target file or directory does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A file or directory with that name already exists.
    #[error("Already exists: {0}")]
    Conflict(String),

    /// The shared folder is not configured or not readable.
    #[error("Shared folder unavailable: {0}")]
    ResourceUnavailable(String),

    /// Internal server error. The short message is surfaced, never a stack.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MediaBusError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_request",
            Self::NotAuthorized => "not_authorized",
            Self::Revoked(_) => "revoked",
            Self::PolicyDenied(_) => "policy_denied",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::ResourceUnavailable(_) => "shared_folder_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotAuthorized | Self::Revoked(_) => StatusCode::UNAUTHORIZED,
            Self::PolicyDenied(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ResourceUnavailable(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type MediaBusResult<T> = Result<T, MediaBusError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for MediaBusError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Revocation has a fixed shape the browser UI matches on.
        let mut response = if let Self::Revoked(message) = &self {
            let body = json!({ "status": "revoked", "error": message });
            (status, Json(body)).into_response()
        } else {
            let body = ErrorResponse {
                error: self.code(),
                message: self.to_string(),
                status: status.as_u16(),
            };
            (status, Json(body)).into_response()
        };

        // Error bodies can embed session state; keep them out of caches.
        response.headers_mut().insert(
            axum::http::header::CACHE_CONTROL,
            axum::http::HeaderValue::from_static("no-store"),
        );
        response
    }
}

impl From<std::io::Error> for MediaBusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            std::io::ErrorKind::AlreadyExists => Self::Conflict(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_bad_request() {
        let err = MediaBusError::Validation("bad path".into());
        assert_eq!(err.code(), "invalid_request");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn revoked_maps_to_unauthorized() {
        let err = MediaBusError::Revoked("revoked by host".into());
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn io_not_found_becomes_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = MediaBusError::from(io);
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
