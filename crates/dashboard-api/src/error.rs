//! Error types for the watch bridge
//!
//! The variants form the stable vocabulary the dashboard UI renders. Cluster
//! responses of every shape (structured `Status` bodies, bare HTTP errors,
//! transport failures) are folded into one of these before they cross the
//! websocket boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::resource::StatusBody;

/// Result type for watch bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Message sent to websocket clients for every authentication failure
pub const UNAUTHORIZED_MESSAGE: &str = "Unauthorized";

/// Error type for watch bridge operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing, malformed, invalid or expired credential
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The cluster API or identity provider could not be reached
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The cluster API answered with an error response
    #[error("{message}")]
    Resource {
        /// HTTP status code returned by the cluster
        status: u16,
        /// Message from the structured body, or synthesized from status and URL
        message: String,
    },

    /// A watch frame could not be decoded
    #[error("malformed watch frame: {0}")]
    Parse(String),

    /// The client sent a request that cannot be served
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A per-connection bound was hit
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an error from a non-success cluster response.
    ///
    /// The `message` of a Kubernetes `Status` body is preferred. When the body
    /// carries no usable message, one is synthesized from the status code and
    /// the target URL. A 401 always maps to [`Error::Unauthorized`].
    pub fn from_response(status: u16, body: &[u8], url: &str) -> Self {
        let message = serde_json::from_slice::<StatusBody>(body)
            .ok()
            .and_then(|s| s.message)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| synthesize_message(status, url));

        if status == 401 {
            Error::Unauthorized(message)
        } else {
            Error::Resource { status, message }
        }
    }

    /// HTTP status of a cluster error, if this error came from a response
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Resource { status, .. } => Some(*status),
            Error::Unauthorized(_) => Some(401),
            _ => None,
        }
    }

    /// Whether retrying the same call later may succeed.
    ///
    /// Transport failures, throttling and server-side errors are transient;
    /// everything else needs a different request or credential.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::UpstreamUnavailable(_) => true,
            Error::Resource { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Text delivered to websocket clients inside `{"error": ...}`
    pub fn client_message(&self) -> String {
        match self {
            Error::Unauthorized(_) => UNAUTHORIZED_MESSAGE.to_string(),
            Error::Resource { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

fn synthesize_message(status: u16, url: &str) -> String {
    let reason = StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown Status");
    format!("{} {} returned by {}", status, reason, url)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Error::Resource { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Error::InvalidRequest(_) | Error::Parse(_) => StatusCode::BAD_REQUEST,
            Error::LimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::Config(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // K8s-style Status response
        let body = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": self.client_message(),
            "code": status.as_u16()
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            Error::Internal(e.to_string())
        } else {
            Error::UpstreamUnavailable(e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}
