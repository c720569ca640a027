//! Operation to tool extraction
//!
//! Walks every path and method of a document and produces one
//! [`HttpToolDefinition`] per supported operation. A failing operation is
//! recorded as a deployment event and skipped; its siblings still proceed.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::enums::rewrite_numeric_enums;
use super::naming::{MAX_TOOL_NAME_LEN, env_var, sanitize, snake_case, tool_name, truncate_with_hash};
use super::resolve::{Resolver, merge_defs};
use super::responses::{response_filter_property, select_response};
use super::security::{DocumentScope, effective_security, extract_security_schemes, serialize_security};
use super::upgrade::upgrade_document;
use super::{DeploymentEvent, EventLevel, TaggedError, parse_document};
use crate::tools::{
    Confirm, FilterType, HttpSecurity, HttpToolDefinition, MAX_PATH_LEN, ParameterSettings, ResponseFilter,
    ToolRepository,
};
use crate::{Error, Result};

const METHODS: [&str; 8] = ["get", "post", "put", "delete", "head", "patch", "options", "trace"];

/// Input for one document.
#[derive(Debug, Clone, Default)]
pub struct ExtractTask {
    /// Project, deployment, document and slug
    pub scope: DocumentScope,
    /// Display name used in messages
    pub name: String,
    /// Raw document bytes
    pub content: Vec<u8>,
}

/// Everything extracted from one document.
#[derive(Debug, Clone, Default)]
pub struct ExtractOutcome {
    /// One row per supported operation
    pub tools: Vec<HttpToolDefinition>,
    /// One row per supported security scheme
    pub security: Vec<HttpSecurity>,
    /// Skips, warnings and errors
    pub events: Vec<DeploymentEvent>,
    /// The document was upgraded from 3.0
    pub upgraded: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GramExtension {
    name: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    confirm: Option<String>,
    confirm_prompt: Option<String>,
    response_filter_type: Option<FilterType>,
}

#[derive(Debug, Default, Deserialize)]
struct SpeakeasyExtension {
    name: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenApiParameter {
    name: String,
    #[serde(rename = "in")]
    location: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    deprecated: bool,
    #[serde(default)]
    allow_empty_value: bool,
    #[serde(default)]
    style: Option<String>,
    #[serde(default)]
    explode: Option<bool>,
    #[serde(default)]
    schema: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenApiRequestBody {
    #[serde(default)]
    required: bool,
    #[serde(default)]
    content: Map<String, Value>,
}

/// Name, descriptions and confirmation after vendor extensions.
#[derive(Debug, Default)]
struct Descriptor {
    name: String,
    untruncated_name: String,
    summary: String,
    description: String,
    original_name: Option<String>,
    original_summary: Option<String>,
    original_description: Option<String>,
    confirm: Confirm,
    confirm_prompt: Option<String>,
    response_filter_type: Option<FilterType>,
    x_gram: bool,
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

fn parse_descriptor(scope: &DocumentScope, op_id: &str, op: &Map<String, Value>) -> Descriptor {
    let (name, untruncated) = tool_name(&scope.slug, op_id);
    let summary = op.get("summary").and_then(Value::as_str).unwrap_or_default().to_string();
    let description = op.get("description").and_then(Value::as_str).unwrap_or_default().to_string();

    let mut descriptor = Descriptor {
        name: name.clone(),
        untruncated_name: untruncated,
        summary: summary.clone(),
        description: description.clone(),
        ..Descriptor::default()
    };

    let gram = op.get("x-gram").and_then(|v| {
        serde_json::from_value::<GramExtension>(v.clone())
            .map_err(|e| warn!(operation = %op_id, error = %e, "error parsing x-gram extension"))
            .ok()
    });
    let speakeasy = op.get("x-speakeasy-mcp").and_then(|v| {
        serde_json::from_value::<SpeakeasyExtension>(v.clone())
            .map_err(|e| warn!(operation = %op_id, error = %e, "error parsing x-speakeasy-mcp extension"))
            .ok()
    });

    let ext = match (gram, speakeasy) {
        (Some(gram), _) => {
            descriptor.x_gram = true;
            gram
        }
        (None, Some(speakeasy)) if speakeasy.name.is_some() || speakeasy.description.is_some() => GramExtension {
            name: speakeasy.name,
            description: speakeasy.description,
            ..GramExtension::default()
        },
        _ => return descriptor,
    };

    let custom_name = snake_case(&sanitize(ext.name.as_deref().unwrap_or_default()));
    if !custom_name.is_empty() {
        descriptor.name = truncate_with_hash(&custom_name, MAX_TOOL_NAME_LEN);
    }
    descriptor.confirm = match ext.confirm.as_deref() {
        None => Confirm::Always,
        Some(raw) => Confirm::parse(raw).unwrap_or_else(|| {
            warn!(operation = %op_id, confirm = %raw, "invalid tool confirmation mode");
            Confirm::Always
        }),
    };
    descriptor.confirm_prompt = ext.confirm_prompt;
    descriptor.response_filter_type = ext.response_filter_type;
    if let Some(s) = ext.summary {
        descriptor.summary = s;
    }
    if let Some(d) = ext.description {
        descriptor.description = d;
    }
    descriptor.original_name = non_empty(&name);
    descriptor.original_summary = non_empty(&summary);
    descriptor.original_description = non_empty(&description);
    descriptor
}

fn preferred_request_types() -> &'static [Regex] {
    static TYPES: OnceLock<Vec<Regex>> = OnceLock::new();
    TYPES.get_or_init(|| {
        [
            r"\bjson\b",
            r"^application/x-www-form-urlencoded\b",
            r"^multipart/form-data\b",
            r"^text/",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static regex"))
        .collect()
    })
}

struct CapturedBody {
    schema: Value,
    required: bool,
    content_type: String,
}

fn capture_request_body(body: Option<&Value>, resolver: &mut Resolver<'_>) -> std::result::Result<Option<CapturedBody>, TaggedError> {
    let Some(body) = body else {
        return Ok(None);
    };
    let body: OpenApiRequestBody = serde_json::from_value(body.clone())
        .map_err(|e| TaggedError::new("invalid-request-body", e.to_string()))?;
    if body.content.is_empty() {
        return Ok(None);
    }

    let Some((content_type, media)) = body
        .content
        .iter()
        .find(|(ct, _)| preferred_request_types().iter().any(|re| re.is_match(ct)))
    else {
        let types: Vec<&str> = body.content.keys().map(String::as_str).collect();
        return Err(TaggedError::new(
            "unsupported-request",
            format!("no supported request body content type found: {}", types.join(", ")),
        ));
    };

    let schema = match media.get("schema") {
        Some(schema) => resolver
            .resolve(schema)
            .map_err(|e| TaggedError::new(e.tag(), format!("request body: {e}")))?,
        None => json!({"type": "object", "additionalProperties": true}),
    };
    Ok(Some(CapturedBody {
        schema,
        required: body.required,
        content_type: content_type.clone(),
    }))
}

/// An object sub-schema: `{type: object, properties, additionalProperties: false, required?}`.
fn object_schema(properties: Map<String, Value>, required: Vec<String>) -> Value {
    let mut schema = Map::new();
    schema.insert("type".into(), json!("object"));
    schema.insert("properties".into(), Value::Object(properties));
    if !required.is_empty() {
        schema.insert("required".into(), json!(required));
    }
    schema.insert("additionalProperties".into(), json!(false));
    Value::Object(schema)
}

type CapturedParams = (Option<Value>, BTreeMap<String, ParameterSettings>);

fn capture_parameters(params: &[OpenApiParameter], always_required: bool) -> CapturedParams {
    if params.is_empty() {
        return (None, BTreeMap::new());
    }
    let mut properties = Map::new();
    let mut required = Vec::new();
    let mut settings = BTreeMap::new();

    for param in params {
        let mut schema = param.schema.clone().unwrap_or_else(|| json!({"type": "string"}));
        if let (Value::Object(obj), Some(desc)) = (&mut schema, &param.description)
            && !obj.contains_key("description")
            && !desc.is_empty()
        {
            obj.insert("description".into(), json!(desc));
        }
        properties.insert(param.name.clone(), schema);
        if param.required || always_required {
            required.push(param.name.clone());
        }
        settings.insert(
            param.name.clone(),
            ParameterSettings {
                location: param.location.clone(),
                name: param.name.clone(),
                description: param.description.clone(),
                required: param.required || always_required,
                deprecated: param.deprecated,
                allow_empty_value: param.allow_empty_value,
                style: param.style.clone(),
                explode: param.explode,
            },
        );
    }
    (Some(object_schema(properties, required)), settings)
}

fn default_server(doc: &Value, name: &str) -> Option<String> {
    for server in doc.get("servers").and_then(Value::as_array).into_iter().flatten() {
        let Some(raw) = server.get("url").and_then(Value::as_str) else {
            continue;
        };
        if server.get("variables").and_then(Value::as_object).is_some_and(|v| !v.is_empty()) {
            continue;
        }
        match url::Url::parse(raw) {
            Ok(u) if u.scheme() == "https" => return Some(raw.to_string()),
            Ok(_) => warn!(document = %name, "skipping non-https server url"),
            Err(e) => warn!(document = %name, error = %e, "skipping server due to malformed url"),
        }
    }
    None
}

struct OperationContext<'a> {
    task: &'a ExtractTask,
    doc: &'a Value,
    server_env_var: &'a str,
    default_server_url: Option<&'a str>,
}

fn extract_operation(
    ctx: &OperationContext<'_>,
    resolver: &mut Resolver<'_>,
    events: &mut Vec<DeploymentEvent>,
    path: &str,
    method: &str,
    shared_params: &[Value],
    op: &Map<String, Value>,
) -> std::result::Result<HttpToolDefinition, TaggedError> {
    let upper = method.to_ascii_uppercase();
    let op_id = op
        .get("operationId")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map_or_else(|| format!("{upper}_{path}"), String::from);

    if op.get("servers").and_then(Value::as_array).is_some_and(|s| !s.is_empty()) {
        return Err(TaggedError::new("op-servers", "per-operation servers are not currently supported"));
    }
    if op.get("deprecated").and_then(Value::as_bool) == Some(true) {
        return Err(TaggedError::new("deprecated-op", "operation is deprecated"));
    }

    let body_value = match op.get("requestBody") {
        Some(b) => Some(
            resolver
                .resolve(b)
                .map_err(|e| TaggedError::new(e.tag(), format!("request body: {e}")))?,
        ),
        None => None,
    };
    if let Some(count) = body_value
        .as_ref()
        .and_then(|b| b.get("content"))
        .and_then(Value::as_object)
        .map(Map::len)
        && count > 1
    {
        events.push(DeploymentEvent::new(
            EventLevel::Warn,
            "deployment:warning",
            format!("{}: {op_id}: only one request body content type processed for operation", ctx.task.name),
        ));
    }
    let body = capture_request_body(body_value.as_ref(), resolver)?;

    // Operation parameters override shared ones with the same (name, in).
    let mut by_location: BTreeMap<String, Vec<OpenApiParameter>> = BTreeMap::new();
    let own_params = op.get("parameters").and_then(Value::as_array).map_or(&[][..], Vec::as_slice);
    for raw in shared_params.iter().chain(own_params) {
        let resolved = resolver
            .resolve(raw)
            .map_err(|e| TaggedError::new(e.tag(), format!("parameter: {e}")))?;
        let param: OpenApiParameter = serde_json::from_value(resolved)
            .map_err(|e| TaggedError::new("invalid-parameter", e.to_string()))?;
        let slot = by_location.entry(param.location.clone()).or_default();
        slot.retain(|p| p.name != param.name);
        slot.push(param);
    }
    let empty = Vec::new();
    let (path_schema, path_settings) = capture_parameters(by_location.get("path").unwrap_or(&empty), true);
    let (header_schema, header_settings) = capture_parameters(by_location.get("header").unwrap_or(&empty), false);
    let (query_schema, query_settings) = capture_parameters(by_location.get("query").unwrap_or(&empty), false);

    let mut properties = Map::new();
    let mut required = Vec::new();
    for (key, schema) in [
        ("pathParameters", path_schema),
        ("headerParameters", header_schema),
        ("queryParameters", query_schema),
    ] {
        let Some(schema) = schema else { continue };
        if schema.get("required").and_then(Value::as_array).is_some_and(|r| !r.is_empty()) {
            required.push(key.to_string());
        }
        properties.insert(key.to_string(), schema);
    }

    let request_content_type = body.as_ref().map(|b| b.content_type.clone());
    if let Some(body) = body {
        if body.required {
            required.push("body".into());
        }
        properties.insert("body".into(), body.schema);
    }

    let descriptor = parse_descriptor(&ctx.task.scope, &op_id, op);

    let mut response_filter = None;
    if descriptor.response_filter_type == Some(FilterType::Jq)
        && let Some(responses) = op.get("responses")
    {
        let responses = resolver
            .resolve(responses)
            .map_err(|e| TaggedError::new(e.tag(), format!("responses: {e}")))?;
        if let Some(selected) = select_response(&responses) {
            properties.insert("responseFilter".into(), response_filter_property(&selected.schema));
            response_filter = Some(ResponseFilter {
                filter_type: FilterType::Jq,
                schema: selected.schema,
                status_codes: selected.status_codes,
                content_types: selected.content_types,
            });
        }
    }

    let mut schema = object_schema(properties, required);
    rewrite_numeric_enums(&mut schema);

    let (security, security_scopes) = serialize_security(effective_security(&Value::Object(op.clone()), ctx.doc));
    let tags = op
        .get("tags")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(String::from)
        .collect();

    let scope = &ctx.task.scope;
    Ok(HttpToolDefinition {
        id: Uuid::new_v4(),
        project_id: scope.project_id.clone(),
        deployment_id: scope.deployment_id.clone(),
        openapi_document_id: scope.document_id,
        untruncated_name: (descriptor.untruncated_name != descriptor.name).then_some(descriptor.untruncated_name),
        name: descriptor.name,
        openapi_operation_id: truncate_with_hash(&op_id, MAX_TOOL_NAME_LEN),
        http_method: upper,
        path: path.to_string(),
        summary: descriptor.summary,
        description: descriptor.description,
        tags,
        confirm: Some(descriptor.confirm),
        confirm_prompt: descriptor.confirm_prompt,
        original_name: descriptor.original_name,
        original_summary: descriptor.original_summary,
        original_description: descriptor.original_description,
        x_gram: descriptor.x_gram,
        security,
        security_scopes,
        schema,
        server_env_var: ctx.server_env_var.to_string(),
        default_server_url: ctx.default_server_url.map(String::from),
        header_settings,
        query_settings,
        path_settings,
        request_content_type,
        response_filter,
    })
}

/// Extract tool and security rows without persisting them.
///
/// # Errors
///
/// Returns `bad-request` when the document cannot be parsed. Per-operation
/// failures are reported as events instead.
pub fn extract_document(task: &ExtractTask) -> Result<ExtractOutcome> {
    let mut doc = parse_document(&task.name, &task.content)?;
    let mut outcome = ExtractOutcome::default();

    let upgrade = upgrade_document(&mut doc);
    outcome.upgraded = upgrade.upgraded;
    for issue in upgrade.issues {
        outcome
            .events
            .push(DeploymentEvent::new(EventLevel::Warn, "openapi:upgrade", format!("{}: {issue}", task.name)));
    }

    let (security, security_errors) = extract_security_schemes(&doc, &task.scope);
    outcome.security = security;
    for e in security_errors {
        outcome
            .events
            .push(DeploymentEvent::new(EventLevel::Error, "openapi:error", format!("{}: {e}", task.name)));
    }

    let server_env_var = env_var(&[&task.scope.slug, "SERVER_URL"]);
    let default_server_url = default_server(&doc, &task.name);
    let ctx = OperationContext {
        task,
        doc: &doc,
        server_env_var: &server_env_var,
        default_server_url: default_server_url.as_deref(),
    };

    let mut defs_pool = BTreeMap::new();
    let mut resolver = Resolver::new(&doc);
    let empty = Map::new();
    let paths = doc.get("paths").and_then(Value::as_object).unwrap_or(&empty);

    for (path, item) in paths {
        let Some(item) = item.as_object() else { continue };
        let shared = item.get("parameters").and_then(Value::as_array).map_or(&[][..], Vec::as_slice);
        for method in METHODS {
            let Some(op) = item.get(method).and_then(Value::as_object) else {
                continue;
            };
            let upper = method.to_ascii_uppercase();
            match extract_operation(&ctx, &mut resolver, &mut outcome.events, path, method, shared, op) {
                Ok(tool) => outcome.tools.push(tool),
                Err(e) => {
                    let level = match e.tag {
                        "op-servers" | "deprecated-op" => EventLevel::Info,
                        _ => EventLevel::Error,
                    };
                    debug!(document = %task.name, path = %path, method = %upper, tag = e.tag, "skipping operation");
                    outcome.events.push(DeploymentEvent::new(
                        level,
                        e.tag,
                        format!("{}: {upper} {path}: {}", task.name, e.message),
                    ));
                }
            }
            for warning in merge_defs(&mut defs_pool, resolver.take_defs()) {
                warn!(document = %task.name, "{warning}");
            }
        }
    }

    info!(
        document = %task.name,
        tools = outcome.tools.len(),
        security = outcome.security.len(),
        events = outcome.events.len(),
        "extracted openapi document"
    );
    Ok(outcome)
}

/// Extracts documents and persists the rows in one transaction.
pub struct ToolExtractor {
    repository: Arc<dyn ToolRepository>,
}

impl ToolExtractor {
    /// Create an extractor writing to `repository`
    #[must_use]
    pub fn new(repository: Arc<dyn ToolRepository>) -> Self {
        Self { repository }
    }

    /// Extract and persist one document.
    ///
    /// # Errors
    ///
    /// Fails when the document cannot be parsed, or with
    /// `failed to save N tool definitions` when any row could not be written.
    /// Nothing is committed in that case.
    pub async fn process(&self, task: &ExtractTask) -> Result<ExtractOutcome> {
        let outcome = extract_document(task)?;
        let mut tx = self.repository.begin().await?;

        for security in &outcome.security {
            tx.insert_security(security.clone()).await?;
        }

        let mut first_error: Option<Error> = None;
        let mut failed = 0usize;
        for tool in &outcome.tools {
            if let Err(e) = tx.insert_tool(tool.clone()).await {
                if tool.path.len() > MAX_PATH_LEN {
                    error!(
                        event = "openapi:error:path-too-long",
                        document = %task.name,
                        tool = %tool.name,
                        path_len = tool.path.len(),
                        "tool path is too long"
                    );
                } else {
                    error!(document = %task.name, tool = %tool.name, error = %e, "failed to save tool definition");
                }
                failed += 1;
                first_error.get_or_insert(e);
            }
        }

        if let Some(first) = first_error {
            return Err(Error::new(
                first.kind(),
                format!("failed to save {failed} tool definitions: {first}"),
            ));
        }

        tx.commit().await?;
        Ok(outcome)
    }
}
