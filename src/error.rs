//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **GatewayError**: the failures the gateway core can produce (broker, hub,
//!   sessions, upstream ports). These never know about HTTP.
//! - **AppError**: what HTTP handlers return. Every variant maps to a status code
//!   and a JSON body, and `GatewayError` converts into it with `?`.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "not_found",
//!     "message": "device 12312 is not connected",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Failures produced by the gateway core.
///
/// ## Recovery policy:
/// - `Closed`: the broker or hub was shut down; callers stop using it.
/// - `NotFound`: the addressed device or history is absent.
/// - `QueueFull`: a best-effort send found no capacity. Nothing is retried.
/// - `DuplicateConnection`: the device already has a live session.
/// - `Transport`: a read or write on the device connection failed. Always fatal
///   for the session.
/// - `Upstream`: the LLM, speech or history backend failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    Closed,
    NotFound(String),
    QueueFull(String),
    DuplicateConnection(String),
    Transport(String),
    Upstream(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Closed => write!(f, "already closed"),
            GatewayError::NotFound(what) => write!(f, "not found: {}", what),
            GatewayError::QueueFull(what) => write!(f, "queue is full: {}", what),
            GatewayError::DuplicateConnection(device_id) => {
                write!(f, "device {} is already connected", device_id)
            }
            GatewayError::Transport(msg) => write!(f, "transport error: {}", msg),
            GatewayError::Upstream(msg) => write!(f, "upstream error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Upstream(err.to_string())
    }
}

/// Errors returned from HTTP handlers.
///
/// ## Error Categories:
/// - **Internal / ConfigError**: server-side problems (500)
/// - **BadRequest / ValidationError**: the client sent something invalid (400)
/// - **NotFound**: addressed resource is absent (404)
/// - **Timeout**: upstream work did not finish in time (408)
/// - **Conflict**: the device already holds a connection (409)
/// - **PayloadTooLarge**: upload exceeded the configured size (413)
/// - **TooManyRequests**: concurrency limit reached (429)
/// - **BadGateway**: an upstream AI service failed (502)
/// - **Unavailable**: the gateway is shutting down (503)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    Timeout(String),
    Conflict(String),
    PayloadTooLarge(String),
    TooManyRequests(String),
    BadGateway(String),
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::PayloadTooLarge(msg) => write!(f, "Payload too large: {}", msg),
            AppError::TooManyRequests(msg) => write!(f, "Too many requests: {}", msg),
            AppError::BadGateway(msg) => write!(f, "Upstream failure: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl AppError {
    /// Status code plus the machine-readable `type` field of the JSON body.
    fn classify(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::Timeout(msg) => (StatusCode::REQUEST_TIMEOUT, "timeout", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", msg),
            AppError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, "too_many_requests", msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "upstream_error", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.classify().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.classify();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Core failures surface to HTTP callers with the closest matching status.
impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Closed => AppError::Unavailable("gateway is shutting down".to_string()),
            GatewayError::NotFound(what) => AppError::NotFound(what),
            GatewayError::QueueFull(what) => AppError::Unavailable(format!("queue is full: {}", what)),
            GatewayError::DuplicateConnection(device_id) => {
                AppError::Conflict(format!("device {} is already connected", device_id))
            }
            GatewayError::Transport(msg) => AppError::Internal(msg),
            GatewayError::Upstream(msg) => AppError::BadGateway(msg),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON problems are almost always the client's fault, so they become 400s.
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

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_display() {
        assert_eq!(GatewayError::Closed.to_string(), "already closed");
        assert_eq!(
            GatewayError::DuplicateConnection("12312".to_string()).to_string(),
            "device 12312 is already connected"
        );
        assert!(GatewayError::Upstream("boom".to_string()).to_string().contains("boom"));
    }

    #[test]
    fn test_gateway_errors_map_to_status_codes() {
        let cases = [
            (GatewayError::Closed, StatusCode::SERVICE_UNAVAILABLE),
            (GatewayError::NotFound("device".to_string()), StatusCode::NOT_FOUND),
            (GatewayError::QueueFull("device".to_string()), StatusCode::SERVICE_UNAVAILABLE),
            (GatewayError::DuplicateConnection("d".to_string()), StatusCode::CONFLICT),
            (GatewayError::Transport("reset".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
            (GatewayError::Upstream("llm".to_string()), StatusCode::BAD_GATEWAY),
        ];

        for (err, expected) in cases {
            assert_eq!(AppError::from(err).status_code(), expected);
        }
    }

    #[test]
    fn test_error_response_body_shape() {
        let response = AppError::TooManyRequests("slow down".to_string()).error_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
