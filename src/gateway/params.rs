//! OpenAPI parameter serialization
//!
//! Renders JSON tool input into path segments, query pairs and header values
//! following each parameter's recorded `style` and `explode`. Path and header
//! parameters default to `simple` without explode, query parameters to
//! `form` with explode.

use serde_json::{Map, Value};

use crate::tools::ParameterSettings;

/// Parameter serialization style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    /// `a,b`
    Simple,
    /// `name=a&name=b`
    Form,
    /// `.a.b`
    Label,
    /// `;name=a;name=b`
    Matrix,
    /// `name=a b`
    SpaceDelimited,
    /// `name=a|b`
    PipeDelimited,
    /// `name[k]=v`
    DeepObject,
}

impl Style {
    fn parse(raw: Option<&str>, default: Self) -> Self {
        match raw {
            Some("simple") => Self::Simple,
            Some("form") => Self::Form,
            Some("label") => Self::Label,
            Some("matrix") => Self::Matrix,
            Some("spaceDelimited") => Self::SpaceDelimited,
            Some("pipeDelimited") => Self::PipeDelimited,
            Some("deepObject") => Self::DeepObject,
            _ => default,
        }
    }
}

fn style_of(settings: Option<&ParameterSettings>, default: Style, default_explode: bool) -> (Style, bool) {
    let style = Style::parse(settings.and_then(|s| s.style.as_deref()), default);
    let explode = settings
        .and_then(|s| s.explode)
        .unwrap_or(if style == Style::Form { true } else { default_explode });
    (style, explode)
}

/// Plain text form of a scalar. Nested structures are rendered as JSON.
fn scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Percent-encode everything outside the unreserved set.
fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn object_parts(obj: &Map<String, Value>, explode: bool, escape_fn: fn(&str) -> String) -> Vec<String> {
    if explode {
        obj.iter()
            .map(|(k, v)| format!("{}={}", escape_fn(k), escape_fn(&scalar(v))))
            .collect()
    } else {
        obj.iter()
            .flat_map(|(k, v)| [escape_fn(k), escape_fn(&scalar(v))])
            .collect()
    }
}

fn identity(raw: &str) -> String {
    raw.to_string()
}

fn render_simple_like(name: &str, value: &Value, style: Style, explode: bool, escape_fn: fn(&str) -> String) -> String {
    let items: Vec<String> = match value {
        Value::Array(items) => items.iter().map(|v| escape_fn(&scalar(v))).collect(),
        Value::Object(obj) => object_parts(obj, explode, escape_fn),
        other => vec![escape_fn(&scalar(other))],
    };
    let is_object = value.is_object();
    match style {
        Style::Label => {
            let sep = if explode { "." } else { "," };
            format!(".{}", items.join(sep))
        }
        Style::Matrix => {
            if explode && value.is_array() {
                items.iter().map(|i| format!(";{name}={i}")).collect()
            } else if explode && is_object {
                items.iter().map(|i| format!(";{i}")).collect()
            } else {
                format!(";{name}={}", items.join(","))
            }
        }
        _ => items.join(","),
    }
}

/// Render a path parameter value, percent-encoded.
#[must_use]
pub fn path_value(name: &str, value: &Value, settings: Option<&ParameterSettings>) -> String {
    let (style, explode) = style_of(settings, Style::Simple, false);
    render_simple_like(name, value, style, explode, escape)
}

/// Render a header parameter value.
#[must_use]
pub fn header_value(value: &Value, settings: Option<&ParameterSettings>) -> String {
    let (_, explode) = style_of(settings, Style::Simple, false);
    render_simple_like("", value, Style::Simple, explode, identity)
}

/// Render a query parameter into (unencoded) name/value pairs.
#[must_use]
pub fn query_pairs(name: &str, value: &Value, settings: Option<&ParameterSettings>) -> Vec<(String, String)> {
    let (style, explode) = style_of(settings, Style::Form, true);
    match (style, value) {
        (Style::DeepObject, Value::Object(obj)) => obj
            .iter()
            .map(|(k, v)| (format!("{name}[{k}]"), scalar(v)))
            .collect(),
        (Style::SpaceDelimited | Style::PipeDelimited, Value::Array(items)) => {
            let sep = if style == Style::SpaceDelimited { " " } else { "|" };
            let joined = items.iter().map(scalar).collect::<Vec<_>>().join(sep);
            vec![(name.to_string(), joined)]
        }
        (_, Value::Array(items)) if explode => items.iter().map(|v| (name.to_string(), scalar(v))).collect(),
        (_, Value::Array(items)) => {
            let joined = items.iter().map(scalar).collect::<Vec<_>>().join(",");
            vec![(name.to_string(), joined)]
        }
        (_, Value::Object(obj)) if explode => obj.iter().map(|(k, v)| (k.clone(), scalar(v))).collect(),
        (_, Value::Object(obj)) => {
            let joined = obj
                .iter()
                .flat_map(|(k, v)| [k.clone(), scalar(v)])
                .collect::<Vec<_>>()
                .join(",");
            vec![(name.to_string(), joined)]
        }
        (_, other) => vec![(name.to_string(), scalar(other))],
    }
}

/// Flatten a JSON body into `application/x-www-form-urlencoded` pairs:
/// arrays become `key[i]`, objects `key[k]`.
#[must_use]
pub fn form_pairs(body: &Value) -> Vec<(String, String)> {
    fn walk(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
        match value {
            Value::Object(obj) => {
                for (k, v) in obj {
                    let key = if prefix.is_empty() { k.clone() } else { format!("{prefix}[{k}]") };
                    walk(&key, v, out);
                }
            }
            Value::Array(items) => {
                for (i, v) in items.iter().enumerate() {
                    walk(&format!("{prefix}[{i}]"), v, out);
                }
            }
            other => out.push((prefix.to_string(), scalar(other))),
        }
    }
    let mut out = Vec::new();
    walk("", body, &mut out);
    out
}
