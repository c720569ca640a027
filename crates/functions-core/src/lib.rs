//! Function runner wire contract
//!
//! Types and header names shared between the gateway (which forwards tool
//! calls to a runner) and the runner itself. Kept dependency-light so both
//! sides agree on the exact JSON and header shapes.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Trailer carrying child CPU seconds (user + system).
pub const CPU_HEADER: &str = "X-Gram-Functions-Cpu";
/// Trailer carrying total host memory in GB.
pub const MEMORY_HEADER: &str = "X-Gram-Functions-Memory";
/// Trailer carrying wall-clock execution seconds.
pub const EXECUTION_TIME_HEADER: &str = "X-Gram-Functions-Execution-Time";
/// Response header echoing the authenticated invocation id.
pub const INVOKE_ID_HEADER: &str = "Gram-Invoke-ID";
/// Response header carrying the runner build version.
pub const RUNNER_VERSION_HEADER: &str = "Gram-Runner-Version";
/// Header set by user-code entrypoints when the call failed inside the runtime.
pub const FUNCTIONS_ERROR_HEADER: &str = "Gram-Functions-Error";
/// Content type used by edge proxies to request a replay on another machine.
pub const FLY_REPLAY_CONTENT_TYPE: &str = "application/vnd.fly.replay";

/// Value of the `Trailer` announcement header.
#[must_use]
pub fn trailer_announcement() -> String {
    format!("{CPU_HEADER}, {MEMORY_HEADER}, {EXECUTION_TIME_HEADER}")
}

/// Response headers that may pass from an upstream or child process to the caller.
const ALLOWED_RESPONSE_HEADERS: &[&str] = &["content-type", "retry-after"];

/// Returns `true` when a response header may be forwarded to the caller.
///
/// Comparison is case-insensitive; any `x-ratelimit-*` header is allowed.
#[must_use]
pub fn is_allowed_response_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    ALLOWED_RESPONSE_HEADERS.contains(&lower.as_str()) || lower.starts_with("x-ratelimit-")
}

/// Returns `true` when a content type asks for an edge replay.
#[must_use]
pub fn is_fly_replay(content_type: &str) -> bool {
    content_type
        .trim()
        .to_ascii_lowercase()
        .starts_with(FLY_REPLAY_CONTENT_TYPE)
}

/// Kind of call dispatched to user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    /// A tool invocation (`handleToolCall`).
    Tool,
    /// A resource read (`handleResources`).
    Resource,
}

impl RequestType {
    /// Argument passed to the entrypoint.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Resource => "resource",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of `POST /tool-call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolPayload {
    /// Tool name.
    #[serde(default)]
    pub name: String,
    /// Raw JSON input, passed verbatim to user code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Box<RawValue>>,
    /// Environment for the child process. Never forwarded to user code as an argument.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

/// Body of `POST /resource-request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourcePayload {
    /// Resource URI.
    #[serde(default)]
    pub uri: String,
    /// Raw JSON input, passed verbatim to user code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Box<RawValue>>,
    /// Environment for the child process.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

/// Plaintext of a runner bearer token (`v01.` prefixed, AES-GCM sealed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationClaims {
    /// Invocation id, echoed in [`INVOKE_ID_HEADER`].
    #[serde(default)]
    pub id: String,
    /// Expiry as Unix seconds.
    #[serde(default)]
    pub exp: i64,
}

/// Error codes written by the language entrypoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionsErrorCode {
    /// Unexpected runtime failure
    Unexpected,
    /// Tool returned something other than a response
    InvalidToolResult,
    /// Tool threw
    ToolCallFailed,
    /// User module failed to import
    ImportFailure,
    /// `handleToolCall` missing
    InvalidToolFunc,
    /// Resource handler returned something other than a response
    InvalidResourceResult,
    /// Resource handler threw
    ResourceRequestFailed,
    /// `handleResources` missing
    InvalidResourceFunc,
}

impl FunctionsErrorCode {
    /// Wire code (`gram_err_00N`).
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Unexpected => "gram_err_000",
            Self::InvalidToolResult => "gram_err_001",
            Self::ToolCallFailed => "gram_err_002",
            Self::ImportFailure => "gram_err_003",
            Self::InvalidToolFunc => "gram_err_004",
            Self::InvalidResourceResult => "gram_err_005",
            Self::ResourceRequestFailed => "gram_err_006",
            Self::InvalidResourceFunc => "gram_err_007",
        }
    }

    /// Parse a wire code.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        [
            Self::Unexpected,
            Self::InvalidToolResult,
            Self::ToolCallFailed,
            Self::ImportFailure,
            Self::InvalidToolFunc,
            Self::InvalidResourceResult,
            Self::ResourceRequestFailed,
            Self::InvalidResourceFunc,
        ]
        .into_iter()
        .find(|c| c.code() == code)
    }
}

impl fmt::Display for FunctionsErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Parse the [`FUNCTIONS_ERROR_HEADER`] value, ignoring unknown codes.
#[must_use]
pub fn parse_functions_error(value: &str) -> Option<FunctionsErrorCode> {
    FunctionsErrorCode::from_code(value.trim())
}

/// Structured error envelope returned by runner endpoints.
///
/// `temporary` marks retriable failures, `fault` marks server-side bugs,
/// and neither set means a permanent client error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodError {
    /// Short correlation id (base64url of 8 random bytes).
    pub id: String,
    /// Human readable message.
    pub message: String,
    /// Deadline exceeded.
    #[serde(default)]
    pub timeout: bool,
    /// Retrying may succeed.
    #[serde(default)]
    pub temporary: bool,
    /// Server fault.
    #[serde(default)]
    pub fault: bool,
    /// HTTP status to respond with.
    #[serde(rename = "http_code", default = "default_http_code")]
    pub http_code: u16,
}

fn default_http_code() -> u16 {
    500
}

impl MethodError {
    fn new(message: impl Into<String>, http_code: u16) -> Self {
        Self {
            id: short_id(),
            message: message.into(),
            timeout: false,
            temporary: false,
            fault: false,
            http_code,
        }
    }

    /// A client error that will fail the same way on retry.
    pub fn permanent(message: impl Into<String>, http_code: u16) -> Self {
        Self::new(message, http_code)
    }

    /// A retriable error. 408/504 codes are also flagged as timeouts.
    pub fn temporary(message: impl Into<String>, http_code: u16) -> Self {
        let mut err = Self::new(message, http_code);
        err.temporary = true;
        err.timeout = matches!(http_code, 408 | 504);
        err
    }

    /// A server fault.
    pub fn fault(message: impl Into<String>, http_code: u16) -> Self {
        let mut err = Self::new(message, http_code);
        err.fault = true;
        err
    }

    /// Code sent in [`FUNCTIONS_ERROR_HEADER`]. Rejected requests carry
    /// none; the runner failing to run the function is `gram_err_000`.
    #[must_use]
    pub fn functions_code(&self) -> Option<FunctionsErrorCode> {
        (self.temporary || self.fault).then_some(FunctionsErrorCode::Unexpected)
    }

    /// HTTP status, clamped to a valid error status.
    #[must_use]
    pub fn code(&self) -> u16 {
        if (400..=599).contains(&self.http_code) {
            self.http_code
        } else {
            500
        }
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (id: {})", self.message, self.id)
    }
}

impl std::error::Error for MethodError {}

/// Base64url (no padding) of 8 random bytes.
#[must_use]
pub fn short_id() -> String {
    let bytes: [u8; 8] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_headers_are_case_insensitive() {
        assert!(is_allowed_response_header("Content-Type"));
        assert!(is_allowed_response_header("RETRY-AFTER"));
        assert!(is_allowed_response_header("X-RateLimit-Remaining"));
        assert!(is_allowed_response_header("x-ratelimit-reset-after"));
        assert!(!is_allowed_response_header("Set-Cookie"));
        assert!(!is_allowed_response_header("Content-Length"));
    }

    #[test]
    fn fly_replay_detection_ignores_parameters() {
        assert!(is_fly_replay("application/vnd.fly.replay; charset=utf-8"));
        assert!(is_fly_replay("Application/Vnd.Fly.Replay"));
        assert!(!is_fly_replay("application/json"));
    }

    #[test]
    fn short_id_is_eleven_url_safe_chars() {
        let id = short_id();
        assert_eq!(id.len(), 11);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(id, short_id());
    }

    #[test]
    fn method_error_serializes_flags() {
        let err = MethodError::temporary("timed out waiting for sub-process", 408);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["timeout"], true);
        assert_eq!(json["temporary"], true);
        assert_eq!(json["fault"], false);
        assert_eq!(json["http_code"], 408);
        assert_eq!(err.code(), 408);
    }

    #[test]
    fn method_error_code_clamps_invalid_status() {
        let err = MethodError::fault("boom", 200);
        assert_eq!(err.code(), 500);
    }

    #[test]
    fn payload_omits_empty_environment() {
        let payload: CallToolPayload =
            serde_json::from_str(r#"{"name":"greet","input":{"who":"ada"}}"#).unwrap();
        assert!(payload.environment.is_empty());
        let out = serde_json::to_string(&payload).unwrap();
        assert_eq!(out, r#"{"name":"greet","input":{"who":"ada"}}"#);
    }

    #[test]
    fn error_codes_round_trip() {
        assert_eq!(FunctionsErrorCode::ImportFailure.code(), "gram_err_003");
        assert_eq!(
            FunctionsErrorCode::from_code("gram_err_007"),
            Some(FunctionsErrorCode::InvalidResourceFunc)
        );
        assert_eq!(FunctionsErrorCode::from_code("nope"), None);
        assert_eq!(
            parse_functions_error(" gram_err_002 "),
            Some(FunctionsErrorCode::ToolCallFailed)
        );
        assert_eq!(FunctionsErrorCode::Unexpected.to_string(), "gram_err_000");
    }

    #[test]
    fn only_runner_failures_carry_a_functions_code() {
        assert_eq!(MethodError::permanent("invalid request: missing name", 400).functions_code(), None);
        assert_eq!(
            MethodError::fault("function exited without writing a response", 500).functions_code(),
            Some(FunctionsErrorCode::Unexpected)
        );
        assert_eq!(
            MethodError::temporary("timed out waiting for sub-process", 408).functions_code(),
            Some(FunctionsErrorCode::Unexpected)
        );
    }
}
