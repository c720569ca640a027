//! Error types for the gram gateway
//!
//! Domain failures carry an [`ErrorKind`] from a small stable taxonomy and a
//! short random [`ErrorId`] that is logged alongside the failure and echoed
//! to callers for correlation.

use std::fmt;
use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::encryption::EncryptionError;

/// Result type alias for the gram gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// An internal precondition did not hold
    InvariantViolated,
    /// The caller sent something malformed
    BadRequest,
    /// Missing or invalid credentials
    Unauthorized,
    /// Credentials valid but not allowed
    Forbidden,
    /// Entity does not exist
    NotFound,
    /// Entity already exists or was modified concurrently
    Conflict,
    /// Feature or input shape not supported
    Unsupported,
    /// Will fail the same way on retry
    Permanent,
    /// Retrying may succeed
    Temporary,
    /// Deadline exceeded
    Timeout,
    /// Server-side bug
    Fault,
    /// Anything else
    Unexpected,
}

impl ErrorKind {
    /// Kebab-case name used in logs and response bodies.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvariantViolated => "invariant-violated",
            Self::BadRequest => "bad-request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not-found",
            Self::Conflict => "conflict",
            Self::Unsupported => "unsupported",
            Self::Permanent => "permanent",
            Self::Temporary => "temporary",
            Self::Timeout => "timeout",
            Self::Fault => "fault",
            Self::Unexpected => "unexpected",
        }
    }

    /// HTTP status for this kind.
    #[must_use]
    pub fn status(self) -> StatusCode {
        match self {
            Self::BadRequest | Self::Unsupported | Self::Permanent => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::Temporary => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::InvariantViolated | Self::Fault | Self::Unexpected => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Short correlation id: base64url (no padding) of 8 random bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ErrorId(String);

impl ErrorId {
    /// Generate a fresh id
    #[must_use]
    pub fn new() -> Self {
        Self(gram_functions_core::short_id())
    }

    /// The id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ErrorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ErrorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Gram gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Classified domain error
    #[error("{message}")]
    Service {
        /// Taxonomy kind
        kind: ErrorKind,
        /// Correlation id
        id: ErrorId,
        /// Caller-safe message
        message: String,
    },

    /// Upstream returned something the gateway refuses to relay
    #[error("{0}")]
    BadGateway(String),

    /// Encryption error
    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Cache backend error
    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a classified error
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Service {
            kind,
            id: ErrorId::new(),
            message: message.into(),
        }
    }

    /// `bad-request`
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    /// `unauthorized`
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    /// `not-found`
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// `unexpected`
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unexpected, message)
    }

    /// `invariant-violated`
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvariantViolated, message)
    }

    /// Taxonomy kind of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Service { kind, .. } => *kind,
            Self::Config(_) => ErrorKind::InvariantViolated,
            Self::Json(_) | Self::Yaml(_) => ErrorKind::BadRequest,
            Self::Http(e) if e.is_timeout() => ErrorKind::Timeout,
            Self::Http(_) | Self::Cache(_) => ErrorKind::Temporary,
            Self::Encryption(_) | Self::Io(_) | Self::Internal(_) => ErrorKind::Fault,
            Self::BadGateway(_) => ErrorKind::Unexpected,
        }
    }

    /// HTTP status for this error
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            _ => self.kind().status(),
        }
    }

    /// Correlation id, if one was assigned at construction
    #[must_use]
    pub fn id(&self) -> Option<&ErrorId> {
        match self {
            Self::Service { id, .. } => Some(id),
            _ => None,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let id = self.id().cloned().unwrap_or_default();
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error_id = %id, kind = %self.kind(), error = %self, "request failed");
        } else {
            tracing::debug!(error_id = %id, kind = %self.kind(), error = %self, "request rejected");
        }
        (
            status,
            Json(json!({
                "error": self.to_string(),
                "id": id.as_str(),
                "kind": self.kind().as_str(),
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_render_kebab_case() {
        assert_eq!(ErrorKind::InvariantViolated.to_string(), "invariant-violated");
        assert_eq!(ErrorKind::NotFound.as_str(), "not-found");
    }

    #[test]
    fn service_error_carries_kind_and_id() {
        let err = Error::bad_request("missing tool");
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.id().map(|id| id.as_str().len()), Some(11));
        assert_eq!(err.to_string(), "missing tool");
    }

    #[test]
    fn bad_gateway_maps_to_502() {
        let err = Error::BadGateway("function attempted fly replay".into());
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(ErrorId::new(), ErrorId::new());
    }
}
