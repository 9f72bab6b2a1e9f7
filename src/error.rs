//! # Error Handling
//!
//! Two error families live here:
//!
//! - **AppError**: errors returned by HTTP handlers, converted into JSON responses.
//! - **RelayError**: errors raised inside the realtime relay (capture, upstream
//!   socket, playback). Each variant carries a stable machine code so the
//!   downstream client can tell a microphone-permission problem apart from a
//!   generic connection failure.
//!
//! ## Propagation policy for RelayError:
//! - `DeviceUnavailable`, `HandshakeTimeout`, `Connect`, `UpstreamProtocol`:
//!   terminal for the session, surfaced as status `error` with this error as reason
//! - `TransportClosed`: drives status to `disconnected`, never auto-reconnects
//! - `DecodeFailure`: recovered inside the playback queue, only logged

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// Custom error types for the HTTP surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **ServiceUnavailable**: The relay is at its session limit (503 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// No capacity left for another relay session
    ServiceUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts errors into HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Turn detection threshold must be within [0, 1]",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl AppError {
    /// HTTP status and the machine-readable `type` used in the JSON body.
    fn kind(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            AppError::ValidationError(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            AppError::ServiceUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable"),
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::ConfigError(msg)
            | AppError::ValidationError(msg)
            | AppError::ServiceUnavailable(msg) => msg,
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.kind().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type) = self.kind();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// `anyhow` errors become internal errors.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
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

/// Errors raised by the realtime relay pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    /// The local capture device could not be opened (permission denied,
    /// no hardware, or already in use)
    DeviceUnavailable(String),

    /// Upstream did not finish session setup within the bound
    HandshakeTimeout(Duration),

    /// The upstream service sent an `error` event
    UpstreamProtocol {
        code: Option<String>,
        message: String,
    },

    /// A socket closed while the session was using it
    TransportClosed(String),

    /// One playback chunk could not be decoded or played
    DecodeFailure(String),

    /// The upstream socket could not be opened at all
    Connect(String),

    /// The relay is missing configuration it needs (e.g. an API key)
    Config(String),
}

impl RelayError {
    /// Stable machine-readable code, sent to the downstream client.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::DeviceUnavailable(_) => "device_unavailable",
            RelayError::HandshakeTimeout(_) => "handshake_timeout",
            RelayError::UpstreamProtocol { .. } => "upstream_error",
            RelayError::TransportClosed(_) => "transport_closed",
            RelayError::DecodeFailure(_) => "decode_failure",
            RelayError::Connect(_) => "connect_failed",
            RelayError::Config(_) => "config_error",
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::DeviceUnavailable(msg) => write!(f, "Audio device unavailable: {}", msg),
            RelayError::HandshakeTimeout(after) => {
                write!(f, "Upstream session setup timed out after {}ms", after.as_millis())
            }
            RelayError::UpstreamProtocol { code: Some(code), message } => {
                write!(f, "Upstream error ({}): {}", code, message)
            }
            RelayError::UpstreamProtocol { code: None, message } => write!(f, "Upstream error: {}", message),
            RelayError::TransportClosed(msg) => write!(f, "Transport closed: {}", msg),
            RelayError::DecodeFailure(msg) => write!(f, "Audio decode failure: {}", msg),
            RelayError::Connect(msg) => write!(f, "Upstream connect failed: {}", msg),
            RelayError::Config(msg) => write!(f, "Relay configuration error: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_error_codes_are_distinct() {
        let errors = vec![
            RelayError::DeviceUnavailable("denied".to_string()),
            RelayError::HandshakeTimeout(Duration::from_secs(10)),
            RelayError::UpstreamProtocol { code: None, message: "bad".to_string() },
            RelayError::TransportClosed("eof".to_string()),
            RelayError::DecodeFailure("odd length".to_string()),
            RelayError::Connect("refused".to_string()),
            RelayError::Config("no key".to_string()),
        ];

        let mut codes: Vec<&str> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_relay_error_display() {
        let err = RelayError::UpstreamProtocol {
            code: Some("invalid_request_error".to_string()),
            message: "Unknown parameter".to_string(),
        };
        assert_eq!(err.to_string(), "Upstream error (invalid_request_error): Unknown parameter");

        let err = RelayError::HandshakeTimeout(Duration::from_millis(1500));
        assert!(err.to_string().contains("1500ms"));
    }

    #[test]
    fn test_app_error_status_codes() {
        let response = AppError::ServiceUnavailable("full".to_string()).error_response();
        assert_eq!(response.status(), actix_web::http::StatusCode::SERVICE_UNAVAILABLE);

        let response = AppError::ValidationError("bad".to_string()).error_response();
        assert_eq!(response.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_status_code_matches_response() {
        let errors = vec![
            AppError::Internal("boom".to_string()),
            AppError::BadRequest("bad json".to_string()),
            AppError::NotFound("nope".to_string()),
            AppError::ConfigError("missing".to_string()),
            AppError::ValidationError("bad".to_string()),
            AppError::ServiceUnavailable("full".to_string()),
        ];

        for err in errors {
            assert_eq!(err.status_code(), err.error_response().status(), "{}", err);
        }
        assert_eq!(
            AppError::ValidationError("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::ServiceUnavailable("full".to_string()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
