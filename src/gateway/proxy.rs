//! Tool invocation proxy
//!
//! Builds the upstream request for an HTTP tool from its structured input,
//! applies credentials, sends it (retrying idempotent requests) and streams
//! the upstream response back with only allow-listed headers. Function tools
//! are forwarded to their runner with a freshly minted invocation token.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use chrono::Utc;
use gram_functions_core::{
    CallToolPayload, FUNCTIONS_ERROR_HEADER, FunctionsErrorCode, INVOKE_ID_HEADER, InvocationClaims,
    is_allowed_response_header, is_fly_replay, parse_functions_error, trailer_announcement,
};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use super::env::CaseInsensitiveEnv;
use super::params::{form_pairs, header_value, path_value, query_pairs};
use super::security::{CredentialResolver, SecurityContext};
use crate::config::RetryConfig;
use crate::encryption::Encryption;
use crate::openapi::responses::is_json;
use crate::secret::Secret;
use crate::tools::{FunctionToolDefinition, HttpToolDefinition, ToolRepository};
use crate::{Error, Result};

/// Marks requests that went through the proxy.
pub const PROXY_HEADER: &str = "X-Gram-Proxy";

/// Invocation tokens outlive the runner's hard execution ceiling.
const INVOCATION_TOKEN_TTL: i64 = 10 * 60;

/// An upstream request being assembled.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    /// Method
    pub method: Method,
    /// Full URL including query
    pub url: Url,
    /// Headers
    pub headers: HeaderMap,
    /// Body
    pub body: Option<Bytes>,
}

impl OutgoingRequest {
    /// A bodiless request
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    fn build(&self, http: &reqwest::Client, timeout: Duration) -> reqwest::RequestBuilder {
        let mut builder = http
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone())
            .timeout(timeout);
        if let Some(body) = &self.body {
            builder = builder.body(body.clone());
        }
        builder
    }
}

/// jq filter supplied with a call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseFilterInput {
    /// Filter flavour, `jq`
    #[serde(default, rename = "type")]
    pub filter_type: String,
    /// Filter expression
    #[serde(default)]
    pub filter: String,
}

/// Structured input of an HTTP tool call.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallBody {
    /// Values for `{name}` placeholders
    #[serde(default)]
    pub path_parameters: Option<Map<String, Value>>,
    /// Query values
    #[serde(default)]
    pub query_parameters: Option<Map<String, Value>>,
    /// Header values
    #[serde(default, alias = "headers")]
    pub header_parameters: Option<Map<String, Value>>,
    /// Request body
    #[serde(default)]
    pub body: Option<Value>,
    /// Optional response filter
    #[serde(default)]
    pub response_filter: Option<ResponseFilterInput>,
    /// Caller environment, overriding the project environment
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
}

/// Exponential backoff for idempotent upstream requests.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Whether retries are enabled
    pub enabled: bool,
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Initial backoff
    pub initial_backoff: Duration,
    /// Maximum backoff
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            multiplier: config.multiplier,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        self.initial_backoff
            .mul_f64(self.multiplier.powi(exp))
            .min(self.max_backoff)
    }
}

/// Statuses worth retrying for idempotent requests.
fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504 | 509 | 521..=524)
}

/// `Retry-After` as seconds or an HTTP date.
fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
    (at.with_timezone(&Utc) - Utc::now()).to_std().ok()
}

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([^}]+)\}").expect("static regex"))
}

/// Substitute `{name}` placeholders in a path template.
///
/// # Errors
///
/// Returns `bad-request` naming the first placeholder without a value.
pub fn render_path(tool: &HttpToolDefinition, params: Option<&Map<String, Value>>) -> Result<String> {
    let mut missing = None;
    let rendered = placeholder().replace_all(&tool.path, |caps: &regex::Captures| {
        let name = &caps[1];
        match params.and_then(|p| p.get(name)) {
            Some(value) => path_value(name, value, tool.path_settings.get(name)),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                caps[0].to_string()
            }
        }
    });
    match missing {
        Some(name) => Err(Error::bad_request(format!("missing path parameter: {name}"))),
        None => Ok(rendered.into_owned()),
    }
}

/// Server URL for a call.
///
/// The project environment wins. A caller may only supply the URL when the
/// project has no environment at all, so callers cannot redirect credentials
/// of a configured project to a host of their choosing.
#[must_use]
pub fn resolve_server_url(
    tool: &HttpToolDefinition,
    system_env: &CaseInsensitiveEnv,
    user_env: &CaseInsensitiveEnv,
) -> Option<String> {
    if let Some(url) = system_env.get_non_empty(&tool.server_env_var) {
        return Some(url.to_string());
    }
    if system_env.is_empty()
        && let Some(url) = user_env.get_non_empty(&tool.server_env_var)
    {
        return Some(url.to_string());
    }
    tool.default_server_url.clone().filter(|u| !u.is_empty())
}

fn encode_body(tool: &HttpToolDefinition, body: &Value) -> Result<(Bytes, Option<String>)> {
    let content_type = tool.request_content_type.clone();
    let bytes = match content_type.as_deref() {
        Some(ct) if ct.starts_with("application/x-www-form-urlencoded") => {
            let encoded = serde_urlencoded::to_string(form_pairs(body))
                .map_err(|e| Error::bad_request(format!("encode form body: {e}")))?;
            Bytes::from(encoded)
        }
        Some(ct) if is_json(ct) => Bytes::from(serde_json::to_vec(body)?),
        _ => match body {
            Value::String(s) => Bytes::from(s.clone()),
            other => Bytes::from(serde_json::to_vec(other)?),
        },
    };
    Ok((bytes, content_type))
}

/// Build the upstream request for an HTTP tool, without credentials.
///
/// # Errors
///
/// Returns `bad-request` for missing inputs or invalid header values and
/// `unexpected` when the resulting URL does not parse.
pub fn build_request(tool: &HttpToolDefinition, call: &ToolCallBody, server_url: &str) -> Result<OutgoingRequest> {
    let path = render_path(tool, call.path_parameters.as_ref())?;
    let joined = format!("{}/{}", server_url.trim_end_matches('/'), path.trim_start_matches('/'));
    let url = Url::parse(&joined).map_err(|e| Error::unexpected(format!("failed to parse tool url: {e}")))?;
    let method = Method::from_bytes(tool.http_method.as_bytes())
        .map_err(|e| Error::invariant(format!("invalid http method {}: {e}", tool.http_method)))?;
    let mut req = OutgoingRequest::new(method, url);

    if let Some(query) = &call.query_parameters {
        let mut pairs = req.url.query_pairs_mut();
        for (name, value) in query {
            for (k, v) in query_pairs(name, value, tool.query_settings.get(name)) {
                pairs.append_pair(&k, &v);
            }
        }
    }
    if req.url.query() == Some("") {
        req.url.set_query(None);
    }

    for (name, value) in call.header_parameters.iter().flatten() {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::bad_request(format!("invalid header name {name}: {e}")))?;
        let rendered = header_value(value, tool.header_settings.get(name));
        let header_value = HeaderValue::from_str(&rendered)
            .map_err(|e| Error::bad_request(format!("invalid value for header {name}: {e}")))?;
        req.headers.insert(header_name, header_value);
    }

    if let Some(body) = call.body.as_ref().filter(|b| !b.is_null()) {
        let (bytes, content_type) = encode_body(tool, body)?;
        if let Some(ct) = content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
            req.headers.insert(header::CONTENT_TYPE, ct);
        }
        req.body = Some(bytes);
    }

    req.headers.insert(PROXY_HEADER, HeaderValue::from_static("1"));
    if !req.headers.contains_key(header::ACCEPT) {
        req.headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
    }
    Ok(req)
}

/// One HTTP tool invocation.
pub struct HttpToolCall<'a> {
    /// Owning project
    pub project_id: &'a str,
    /// Tool being called
    pub tool: &'a HttpToolDefinition,
    /// Structured input
    pub body: ToolCallBody,
    /// Project environment
    pub system_env: &'a BTreeMap<String, String>,
    /// Access tokens from the OAuth proxy, keyed by security scheme key
    pub oauth_tokens: BTreeMap<String, Secret<String>>,
}

/// Forwards tool calls upstream.
pub struct ToolProxy {
    http: reqwest::Client,
    resolver: CredentialResolver,
    repository: Arc<dyn ToolRepository>,
    retry: RetryPolicy,
    upstream_timeout: Duration,
    function_auth: Option<Encryption>,
}

impl ToolProxy {
    /// Create a proxy
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        resolver: CredentialResolver,
        repository: Arc<dyn ToolRepository>,
        retry: RetryPolicy,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            http,
            resolver,
            repository,
            retry,
            upstream_timeout,
            function_auth: None,
        }
    }

    /// Enable function tools, sealing invocation tokens with `key`
    #[must_use]
    pub fn with_function_auth(mut self, key: Encryption) -> Self {
        self.function_auth = Some(key);
        self
    }

    /// Invoke an HTTP tool.
    ///
    /// # Errors
    ///
    /// `bad-request` for invalid input or a missing server URL,
    /// `unauthorized` when a token request fails, and a bad-gateway error
    /// when the upstream cannot be reached or asks for a replay.
    pub async fn call_http(&self, call: HttpToolCall<'_>) -> Result<Response> {
        let tool = call.tool;
        let none = BTreeMap::<String, String>::new();
        let system_env = CaseInsensitiveEnv::merged(call.system_env, &none);
        let user_env = CaseInsensitiveEnv::merged(&none, &call.body.environment_variables);

        let server_url = resolve_server_url(tool, &system_env, &user_env)
            .ok_or_else(|| Error::bad_request(format!("no server URL provided for tool {}", tool.name)))?;
        let mut req = build_request(tool, &call.body, &server_url)?;

        let schemes = self
            .repository
            .find_security(tool.openapi_document_id, &tool.security_keys())
            .await?;

        let mut env = CaseInsensitiveEnv::merged(call.system_env, &call.body.environment_variables);
        for scheme in &schemes {
            let Some(token) = call.oauth_tokens.get(&scheme.key) else {
                continue;
            };
            for var in scheme.env_variables.iter().filter(|v| v.ends_with("ACCESS_TOKEN")) {
                if !user_env.contains(var) {
                    env.set(var, token.reveal());
                }
            }
        }

        let ctx = SecurityContext {
            project_id: call.project_id,
            schemes: &schemes,
            scopes: &tool.security_scopes,
            env: &env,
            server_url: &server_url,
        };
        self.resolver.apply(&mut req, &ctx).await?;

        if let Some(filter) = call.body.response_filter.as_ref().filter(|f| !f.filter.is_empty()) {
            debug!(tool = %tool.name, filter_type = %filter.filter_type, "response filter is not applied by the proxy");
        }

        let response = self.send(&req, &tool.name).await?;
        relay(response, None)
    }

    /// Invoke a function tool on its runner.
    ///
    /// # Errors
    ///
    /// Fails when function tools are not configured, when the runner cannot
    /// be reached, or when its response does not echo the invocation id.
    pub async fn call_function(
        &self,
        tool: &FunctionToolDefinition,
        input: &Value,
        system_env: &BTreeMap<String, String>,
        user_env: &BTreeMap<String, String>,
    ) -> Result<Response> {
        let key = self
            .function_auth
            .as_ref()
            .ok_or_else(|| Error::invariant("function tools require functions.auth_secret"))?;

        let invocation_id = Uuid::new_v4().to_string();
        let claims = InvocationClaims {
            id: invocation_id.clone(),
            exp: Utc::now().timestamp() + INVOCATION_TOKEN_TTL,
        };
        let sealed = key.encrypt(&serde_json::to_vec(&claims)?)?;

        let none = BTreeMap::<String, String>::new();
        let user = CaseInsensitiveEnv::merged(&none, user_env);
        let mut environment = CaseInsensitiveEnv::merged(system_env, &none).to_upper_map();
        for var in &tool.variables {
            if let Some(value) = user.get(var) {
                environment.insert(var.clone(), value.to_string());
            }
        }

        let payload = CallToolPayload {
            name: tool.name.clone(),
            input: Some(serde_json::value::to_raw_value(input)?),
            environment,
        };
        let url = format!("{}/tool-call", tool.runner_url.trim_end_matches('/'));
        let mut req = OutgoingRequest::new(
            Method::POST,
            Url::parse(&url).map_err(|e| Error::invariant(format!("invalid runner url {url}: {e}")))?,
        );
        req.body = Some(Bytes::from(serde_json::to_vec(&payload)?));
        req.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = HeaderValue::from_str(&format!("bearer v01.{sealed}"))
            .map_err(|e| Error::Internal(format!("invalid invocation token: {e}")))?;
        req.headers.insert(header::AUTHORIZATION, bearer);
        req.headers.insert(PROXY_HEADER, HeaderValue::from_static("1"));

        let response = self.send(&req, &tool.name).await?;
        let echoed = response
            .headers()
            .get(INVOKE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if echoed != invocation_id {
            error!(tool = %tool.name, "runner response does not match invocation");
            return Err(Error::BadGateway("function response did not match invocation".into()));
        }
        if let Some(code) = functions_error(response.headers()) {
            warn!(tool = %tool.name, %code, status = response.status().as_u16(), "function call failed");
        }
        relay(response, Some(&invocation_id))
    }

    /// Send with retries for idempotent methods.
    async fn send(&self, req: &OutgoingRequest, tool: &str) -> Result<reqwest::Response> {
        let retryable = self.retry.enabled && req.method == Method::GET;
        let max_attempts = if retryable { self.retry.max_attempts } else { 1 };
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = req.build(&self.http, self.upstream_timeout).send().await;
            let delay = match &result {
                Ok(resp) if attempt < max_attempts && is_retryable_status(resp.status()) => {
                    Some(retry_after(resp.headers()).unwrap_or_else(|| self.retry.backoff(attempt)))
                }
                Err(e) if attempt < max_attempts && !e.is_builder() => Some(self.retry.backoff(attempt)),
                _ => None,
            };
            let Some(delay) = delay else {
                return result.map_err(|e| {
                    warn!(tool = %tool, error = %e, attempts = attempt, "upstream request failed");
                    Error::BadGateway("failed to execute request".into())
                });
            };
            debug!(tool = %tool, attempt, delay_ms = delay.as_millis(), "retrying upstream request");
            sleep(delay.min(self.retry.max_backoff)).await;
        }
    }
}

/// Error code a runner attached to its response, if any.
fn functions_error(headers: &HeaderMap) -> Option<FunctionsErrorCode> {
    headers
        .get(FUNCTIONS_ERROR_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_functions_error)
}

/// Copy status, allow-listed headers and the streamed body (with any
/// trailers) into a response for the caller.
fn relay(response: reqwest::Response, invocation_id: Option<&str>) -> Result<Response> {
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if is_fly_replay(content_type) {
        warn!("upstream attempted fly replay");
        return Err(Error::BadGateway("function attempted fly replay".into()));
    }

    let status = response.status();
    info!(status = status.as_u16(), url = %response.url(), "upstream responded");

    let upstream: axum::http::Response<reqwest::Body> = response.into();
    let (parts, body) = upstream.into_parts();

    let mut out = Response::new(Body::new(body));
    *out.status_mut() = parts.status;
    for (name, value) in &parts.headers {
        if is_allowed_response_header(name.as_str()) {
            out.headers_mut().append(name.clone(), value.clone());
        }
    }
    if let Some(id) = invocation_id {
        if let Some(code) = functions_error(&parts.headers) {
            out.headers_mut()
                .insert(FUNCTIONS_ERROR_HEADER, HeaderValue::from_static(code.code()));
        }
        if let Ok(v) = HeaderValue::from_str(id) {
            out.headers_mut().insert(INVOKE_ID_HEADER, v);
        }
        if let Ok(v) = HeaderValue::from_str(&trailer_announcement()) {
            out.headers_mut().insert(header::TRAILER, v);
        }
    }
    Ok(out)
}
