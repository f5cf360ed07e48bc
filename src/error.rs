//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - [`RelayError`]: the failure taxonomy of the audio relay itself (frames,
//!   sessions, upstream, capture and playback). Every relay component returns it.
//! - [`AppError`]: what the HTTP surface returns. It implements actix's
//!   `ResponseError` so handlers can use `?` and still answer with JSON.
//!
//! ## Containment:
//! A `RelayError` that is fatal to a session never leaves that session's
//! teardown path. Only `AppError` crosses the HTTP boundary.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Failures raised while moving audio between a client and the upstream service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Payload is not a whole number of 16-bit samples.
    #[error("malformed frame: {len} bytes is not a whole number of 16-bit samples")]
    MalformedFrame { len: usize },

    /// Microphone could not be opened (missing device, permission denied, unsupported format).
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(String),

    /// A session for this client identifier is already registered.
    #[error("client '{0}' already has an active session")]
    DuplicateClient(String),

    /// The registry is at `max_concurrent_sessions`.
    #[error("maximum concurrent sessions ({0}) reached")]
    CapacityReached(usize),

    /// The upstream session failed to establish or dropped mid-conversation.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// A connection ended, normally or not.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// A destination did not accept a write within the write timeout.
    #[error("backpressure: {0} stalled beyond the queue bound")]
    Backpressure(String),

    /// Too many consecutive malformed frames.
    #[error("unstable stream: {0} consecutive malformed frames")]
    UnstableStream(u32),

    /// The playback output failed while rendering a frame.
    #[error("render failed: {0}")]
    Render(String),

    /// The upstream sent a message that could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Errors returned from HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500)
/// - **BadRequest**: Client sent invalid data (400)
/// - **NotFound**: Unknown session or resource (404)
/// - **Conflict**: A session already exists for the client id (409)
/// - **Unavailable**: The relay is at capacity (503)
/// - **ConfigError**: Configuration problems (500)
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "duplicate_client", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
        }
    }
}

/// Converts errors into JSON responses:
///
/// ```json
/// {
///   "error": {
///     "type": "duplicate_client",
///     "message": "client 'abc' already has an active session",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
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

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::DuplicateClient(_) => AppError::Conflict(err.to_string()),
            RelayError::CapacityReached(_) => AppError::Unavailable(err.to_string()),
            RelayError::MalformedFrame { .. } => AppError::BadRequest(err.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_client_maps_to_conflict() {
        let err: AppError = RelayError::DuplicateClient("abc".to_string()).into();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn test_capacity_maps_to_unavailable() {
        let err: AppError = RelayError::CapacityReached(4).into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
