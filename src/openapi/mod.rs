//! OpenAPI ingestion
//!
//! Parses OpenAPI 3.0/3.1 documents (JSON or YAML), upgrades 3.0 documents,
//! inlines references and turns each operation into an
//! [`HttpToolDefinition`](crate::tools::HttpToolDefinition).

pub mod enums;
pub mod extract;
pub mod naming;
pub mod resolve;
pub mod responses;
pub mod security;
pub mod upgrade;

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

pub use extract::{ExtractOutcome, ExtractTask, ToolExtractor, extract_document};
pub use security::DocumentScope;

use crate::{Error, Result};

/// Severity of a deployment event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    /// Informational, e.g. a skipped operation
    Info,
    /// Something was processed partially
    Warn,
    /// Something was dropped
    Error,
}

/// One entry of the deployment event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentEvent {
    /// Severity
    pub level: EventLevel,
    /// Stable tag such as `circular-ref` or `deployment:warning`
    pub event: String,
    /// Human readable message
    pub message: String,
}

impl DeploymentEvent {
    pub(crate) fn new(level: EventLevel, event: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            event: event.into(),
            message: message.into(),
        }
    }
}

/// A per-operation failure with a stable tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedError {
    /// Tag, e.g. `unsupported-request`
    pub tag: &'static str,
    /// Message
    pub message: String,
}

impl TaggedError {
    pub(crate) fn new(tag: &'static str, message: impl Into<String>) -> Self {
        Self {
            tag,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaggedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.tag, self.message)
    }
}

impl std::error::Error for TaggedError {}

/// Parse a JSON or YAML document into an ordered JSON value.
///
/// # Errors
///
/// Returns a `bad-request` error naming the document when it cannot be
/// parsed or is not an OpenAPI 3.x document.
pub fn parse_document(name: &str, content: &[u8]) -> Result<Value> {
    let mut problems = Vec::new();
    let text = String::from_utf8_lossy(content);

    let parsed = if text.trim_start().starts_with('{') {
        serde_json::from_str::<Value>(&text).or_else(|_| from_yaml(&text))
    } else {
        from_yaml(&text)
    };

    let doc = match parsed {
        Ok(doc) => Some(doc),
        Err(e) => {
            problems.push(e);
            None
        }
    };

    if let Some(doc) = &doc {
        match doc.get("openapi").and_then(Value::as_str) {
            Some(v) if v.starts_with("3.") => {}
            Some(v) => problems.push(format!("unsupported openapi version: {v}")),
            None => problems.push("missing openapi version field".to_string()),
        }
        if !doc.get("paths").is_none_or(Value::is_object) {
            problems.push("paths must be an object".to_string());
        }
    }

    match doc {
        Some(doc) if problems.is_empty() => Ok(doc),
        _ => {
            for problem in &problems {
                tracing::debug!(document = %name, problem = %problem, "openapi parse problem");
            }
            Err(Error::bad_request(format!(
                "openapi v3 document '{name}' had {} errors",
                problems.len()
            )))
        }
    }
}

fn from_yaml(text: &str) -> std::result::Result<Value, String> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| e.to_string())?;
    Ok(yaml_to_json(yaml))
}

/// YAML allows non-string keys (`200:`); JSON does not, so keys are
/// stringified.
fn yaml_to_json(value: serde_yaml::Value) -> Value {
    use serde_yaml::Value as Y;
    match value {
        Y::Null => Value::Null,
        Y::Bool(b) => Value::Bool(b),
        Y::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                n.as_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map_or(Value::Null, Value::Number)
            }
        }
        Y::String(s) => Value::String(s),
        Y::Sequence(items) => Value::Array(items.into_iter().map(yaml_to_json).collect()),
        Y::Mapping(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                let key = match k {
                    Y::String(s) => s,
                    Y::Number(n) => n.to_string(),
                    Y::Bool(b) => b.to_string(),
                    Y::Null => "null".to_string(),
                    other => serde_yaml::to_string(&other).unwrap_or_default().trim().to_string(),
                };
                out.insert(key, yaml_to_json(v));
            }
            Value::Object(out)
        }
        Y::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}
