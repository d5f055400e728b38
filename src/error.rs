//! # Error Handling
//!
//! Error types for the gateway and how they turn into HTTP responses when an
//! upgrade request is rejected.
//!
//! ## Taxonomy
//! - **Handshake**: malformed first frame, missing identifiers. Fatal to the call.
//! - **Connect**: orchestration unreachable. Fatal to the call.
//! - **Transport**: a socket read/write failed. Triggers the closing transition.
//! - **UnknownTemplate**: a response template is missing. Configuration integrity
//!   error, never papered over with an empty frame.
//! - **Protocol**: a frame could not be parsed or serialized.
//! - **Archive**: recording upload failed. Logged, never blocks teardown.
//! - **Config / Unauthorized / Capacity**: process and upgrade-time failures.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors raised by the gateway and its per-call tasks.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(GatewayError::Handshake("missing conversationId".to_string()));
/// ```
#[derive(Debug)]
pub enum GatewayError {
    /// The first carrier frame could not be turned into call identifiers
    Handshake(String),

    /// The orchestration WebSocket could not be opened
    Connect(String),

    /// A socket read or write failed mid-call
    Transport(String),

    /// A response template was requested that was never loaded
    UnknownTemplate {
        name: String,
        available: Vec<String>,
    },

    /// A frame could not be parsed or serialized
    Protocol(String),

    /// Recording archival failed
    Archive(String),

    /// Configuration file, environment or template set problems
    Config(String),

    /// The upgrade request failed authentication
    Unauthorized(String),

    /// The gateway is already carrying its maximum number of calls
    Capacity(String),
}

impl GatewayError {
    /// Machine-readable error type used in JSON bodies and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Handshake(_) => "handshake_error",
            GatewayError::Connect(_) => "connect_error",
            GatewayError::Transport(_) => "transport_error",
            GatewayError::UnknownTemplate { .. } => "unknown_template",
            GatewayError::Protocol(_) => "protocol_error",
            GatewayError::Archive(_) => "archive_error",
            GatewayError::Config(_) => "config_error",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::Capacity(_) => "capacity_exceeded",
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Handshake(msg) => write!(f, "Handshake error: {}", msg),
            GatewayError::Connect(msg) => write!(f, "Orchestration connect error: {}", msg),
            GatewayError::Transport(msg) => write!(f, "Transport error: {}", msg),
            GatewayError::UnknownTemplate { name, available } => write!(
                f,
                "Unknown response template '{}' (available: {})",
                name,
                available.join(", ")
            ),
            GatewayError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            GatewayError::Archive(msg) => write!(f, "Archive error: {}", msg),
            GatewayError::Config(msg) => write!(f, "Configuration error: {}", msg),
            GatewayError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            GatewayError::Capacity(msg) => write!(f, "Capacity exceeded: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Converts rejected upgrades into HTTP responses.
///
/// ## HTTP Status Code Mapping:
/// - Unauthorized → 401
/// - Capacity → 503
/// - Handshake/Protocol → 400
/// - everything else → 500
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "unauthorized",
///     "message": "Unauthorized: missing X-API-KEY header",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Capacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Handshake(_) | GatewayError::Protocol(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Malformed JSON on either socket is a protocol problem, not a server fault.
impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Protocol(format!("JSON error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

impl From<config::ConfigError> for GatewayError {
    fn from(err: config::ConfigError) -> Self {
        GatewayError::Config(err.to_string())
    }
}

/// Archival is the only part of the gateway that touches the filesystem per call.
impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Archive(err.to_string())
    }
}

/// Shorthand for `Result<T, GatewayError>`.
pub type GatewayResult<T> = Result<T, GatewayError>;
