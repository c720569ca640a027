//! Credential resolver
//!
//! Applies a tool's security schemes to an outgoing request using the
//! caller's environment. Configuration problems (a missing variable, a bad
//! header name) are logged and the scheme is skipped. Only a failing
//! client-credentials token request is surfaced to the caller.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use super::env::CaseInsensitiveEnv;
use super::proxy::OutgoingRequest;
use crate::cache::{Cacheable, TypedCache};
use crate::tools::HttpSecurity;
use crate::{Error, Result};

/// Marker carried by every user-visible token request failure.
pub const TOKEN_REQUEST_FAILED: &str = "failed to make client credentials token request";

/// A cached client-credentials access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCredentialsToken {
    /// Cache key the token was stored under
    pub key: String,
    /// Bearer token
    pub access_token: String,
    /// Token type reported by the provider
    #[serde(default)]
    pub token_type: String,
    /// Lifetime in seconds
    pub expires_in: i64,
    /// Scope granted by the provider
    #[serde(default)]
    pub scope: String,
    /// When the token was obtained
    pub created_at: DateTime<Utc>,
}

impl ClientCredentialsToken {
    /// Past `created_at + expires_in`
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.created_at + chrono::Duration::seconds(self.expires_in) <= Utc::now()
    }
}

impl Cacheable for ClientCredentialsToken {
    fn cache_key(&self) -> String {
        self.key.clone()
    }

    fn ttl(&self) -> Option<Duration> {
        u64::try_from(self.expires_in).ok().map(Duration::from_secs)
    }
}

/// `clientCredentialsTokenCache:projectID-{p}-clientID-{c}-tokenURL-{url}-scopes-{s}`
#[must_use]
pub fn token_cache_key(project_id: &str, client_id: &str, token_url: &str, scopes: &[String]) -> String {
    let mut sorted = scopes.to_vec();
    sorted.sort();
    let encoded: String = url::form_urlencoded::byte_serialize(token_url.as_bytes()).collect();
    format!(
        "clientCredentialsTokenCache:projectID-{project_id}-clientID-{client_id}-tokenURL-{encoded}-scopes-{}",
        sorted.join(",")
    )
}

/// Prefix `Bearer ` unless the value already carries it.
#[must_use]
pub fn format_for_bearer(token: &str) -> String {
    let has_prefix = token.get(..7).is_some_and(|p| p.eq_ignore_ascii_case("bearer "));
    if has_prefix { token.to_string() } else { format!("Bearer {token}") }
}

/// Token endpoint response; both snake and camel case are accepted.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default, alias = "accessToken")]
    access_token: Option<String>,
    #[serde(default, alias = "tokenType")]
    token_type: Option<String>,
    #[serde(default, alias = "expiresIn")]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

/// Inputs of one resolution pass.
pub struct SecurityContext<'a> {
    /// Owning project, part of the token cache key
    pub project_id: &'a str,
    /// Schemes in requirement order
    pub schemes: &'a [HttpSecurity],
    /// Scopes requested per scheme key
    pub scopes: &'a BTreeMap<String, Vec<String>>,
    /// Merged caller environment
    pub env: &'a CaseInsensitiveEnv,
    /// Server URL, base for relative token URLs
    pub server_url: &'a str,
}

/// Resolves credentials for outgoing tool requests.
pub struct CredentialResolver {
    http: reqwest::Client,
    tokens: TypedCache<ClientCredentialsToken>,
    token_timeout: Duration,
}

impl CredentialResolver {
    /// Create a resolver caching tokens in `tokens`
    #[must_use]
    pub fn new(http: reqwest::Client, tokens: TypedCache<ClientCredentialsToken>, token_timeout: Duration) -> Self {
        Self {
            http,
            tokens,
            token_timeout,
        }
    }

    /// Apply every scheme in order.
    ///
    /// # Errors
    ///
    /// Returns `unauthorized` when a client-credentials token request fails.
    /// Processing stops at that scheme.
    pub async fn apply(&self, req: &mut OutgoingRequest, ctx: &SecurityContext<'_>) -> Result<()> {
        for scheme in ctx.schemes {
            match scheme.scheme_type.as_str() {
                "apiKey" => apply_api_key(req, scheme, ctx.env),
                "http" => match scheme.scheme.as_deref() {
                    Some("bearer") => {
                        if let Some(token) = first_var(scheme, ctx.env, |_| true) {
                            set_header(req, AUTHORIZATION, &format_for_bearer(token));
                        } else {
                            warn!(scheme = %scheme.key, "no bearer token in environment");
                        }
                    }
                    Some("basic") => apply_basic(req, scheme, ctx.env),
                    other => warn!(scheme = %scheme.key, kind = ?other, "unsupported http security scheme"),
                },
                "openIdConnect" => apply_access_token(req, scheme, ctx.env),
                "oauth2" => {
                    if first_var(scheme, ctx.env, |v| v.contains("ACCESS_TOKEN")).is_some()
                        || !scheme.oauth_types.iter().any(|t| t == "client_credentials")
                    {
                        apply_access_token(req, scheme, ctx.env);
                    } else if let Some(token) = self.client_credentials(scheme, ctx).await? {
                        set_header(req, AUTHORIZATION, &format_for_bearer(&token));
                    }
                }
                other => warn!(scheme = %scheme.key, kind = %other, "unsupported security scheme type"),
            }
        }
        Ok(())
    }

    /// Obtain a token, from cache when possible.
    ///
    /// `Ok(None)` means the scheme is misconfigured and was skipped.
    async fn client_credentials(&self, scheme: &HttpSecurity, ctx: &SecurityContext<'_>) -> Result<Option<String>> {
        let Some(client_secret) = first_var(scheme, ctx.env, |v| v.contains("CLIENT_SECRET")) else {
            error!(scheme = %scheme.key, "missing client secret for client credentials");
            return Ok(None);
        };
        let Some(client_id) = first_var(scheme, ctx.env, |v| v.contains("CLIENT_ID")) else {
            error!(scheme = %scheme.key, "missing client id for client credentials");
            return Ok(None);
        };
        let Some(token_url) = resolve_token_url(scheme, ctx) else {
            error!(scheme = %scheme.key, "missing token url for client credentials");
            return Ok(None);
        };

        let scopes = ctx.scopes.get(&scheme.key).cloned().unwrap_or_default();
        let key = token_cache_key(ctx.project_id, client_id, &token_url, &scopes);

        match self.tokens.get(&key).await {
            Ok(Some(cached)) if !cached.is_expired() => {
                debug!(scheme = %scheme.key, "using cached client credentials token");
                return Ok(Some(cached.access_token));
            }
            Ok(Some(expired)) => {
                if let Err(e) = self.tokens.delete(&expired).await {
                    warn!(error = %e, "failed to delete expired client credentials token");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "client credentials token cache lookup failed"),
        }

        let response = self.request_token(&token_url, client_id, client_secret, &scopes).await?;
        let Some(access_token) = response.access_token.filter(|t| !t.is_empty()) else {
            return Err(Error::unauthorized(format!(
                "{TOKEN_REQUEST_FAILED}: response did not include an access token"
            )));
        };

        let expires_in = response.expires_in.unwrap_or_default();
        if expires_in > 0 {
            let token = ClientCredentialsToken {
                key,
                access_token: access_token.clone(),
                token_type: response.token_type.unwrap_or_default(),
                expires_in,
                scope: response.scope.unwrap_or_default(),
                created_at: Utc::now(),
            };
            if let Err(e) = self.tokens.store(&token).await {
                warn!(error = %e, "failed to cache client credentials token");
            }
        }
        Ok(Some(access_token))
    }

    async fn request_token(
        &self,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        scopes: &[String],
    ) -> Result<TokenResponse> {
        let scope = scopes.join(" ");
        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ];
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }

        let send = |builder: reqwest::RequestBuilder| async move {
            builder
                .timeout(self.token_timeout)
                .send()
                .await
                .map_err(|e| Error::unauthorized(format!("{TOKEN_REQUEST_FAILED}: {e}")))
        };

        let mut response = send(self.http.post(token_url).form(&form)).await?;

        // Some providers only accept client authentication via Basic.
        if matches!(
            response.status(),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            debug!(status = %response.status(), "retrying client credentials request with basic auth");
            let mut basic_form = vec![("grant_type", "client_credentials")];
            if !scope.is_empty() {
                basic_form.push(("scope", scope.as_str()));
            }
            response = send(
                self.http
                    .post(token_url)
                    .basic_auth(client_id, Some(client_secret))
                    .form(&basic_form),
            )
            .await?;
        }

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::unauthorized(format!(
                "{TOKEN_REQUEST_FAILED}: status {}, response: {body}",
                status.as_u16()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::unauthorized(format!("{TOKEN_REQUEST_FAILED}: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::unauthorized(format!("{TOKEN_REQUEST_FAILED}: invalid token response: {e}")))
    }
}

/// First non-empty env value among the scheme's variables matching `pred`.
fn first_var<'e>(scheme: &HttpSecurity, env: &'e CaseInsensitiveEnv, pred: impl Fn(&str) -> bool) -> Option<&'e str> {
    scheme
        .env_variables
        .iter()
        .filter(|v| pred(&v.to_ascii_uppercase()))
        .find_map(|v| env.get_non_empty(v))
}

fn resolve_token_url(scheme: &HttpSecurity, ctx: &SecurityContext<'_>) -> Option<String> {
    if let Some(url) = first_var(scheme, ctx.env, |v| v.contains("TOKEN_URL")) {
        return Some(url.to_string());
    }
    let url = scheme
        .oauth_flows
        .as_ref()?
        .pointer("/clientCredentials/tokenUrl")
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())?;
    if url.starts_with('/') {
        Some(format!("{}{url}", ctx.server_url.trim_end_matches('/')))
    } else {
        Some(url.to_string())
    }
}

fn set_header(req: &mut OutgoingRequest, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(mut v) => {
            v.set_sensitive(true);
            req.headers.insert(name, v);
        }
        Err(e) => error!(header = %name, error = %e, "invalid credential header value"),
    }
}

fn apply_api_key(req: &mut OutgoingRequest, scheme: &HttpSecurity, env: &CaseInsensitiveEnv) {
    let Some(name) = scheme.name.as_deref().filter(|n| !n.is_empty()) else {
        error!(scheme = %scheme.key, "no name provided for api key security scheme");
        return;
    };
    let Some(value) = scheme.env_variables.first().and_then(|v| env.get_non_empty(v)) else {
        error!(scheme = %scheme.key, "no api key value in environment");
        return;
    };
    match scheme.placement.as_deref() {
        Some("header") => match HeaderName::from_bytes(name.as_bytes()) {
            Ok(header) => set_header(req, header, value),
            Err(e) => error!(scheme = %scheme.key, error = %e, "invalid api key header name"),
        },
        Some("query") => {
            req.url.query_pairs_mut().append_pair(name, value);
        }
        other => error!(scheme = %scheme.key, placement = ?other, "unsupported api key placement"),
    }
}

fn apply_basic(req: &mut OutgoingRequest, scheme: &HttpSecurity, env: &CaseInsensitiveEnv) {
    let username = first_var(scheme, env, |v| v.contains("USERNAME"));
    let password = first_var(scheme, env, |v| v.contains("PASSWORD"));
    match (username, password) {
        (Some(user), Some(pass)) => {
            let encoded = STANDARD.encode(format!("{user}:{pass}"));
            set_header(req, AUTHORIZATION, &format!("Basic {encoded}"));
        }
        _ => warn!(scheme = %scheme.key, "basic auth requires both username and password"),
    }
}

fn apply_access_token(req: &mut OutgoingRequest, scheme: &HttpSecurity, env: &CaseInsensitiveEnv) {
    match first_var(scheme, env, |v| v.contains("ACCESS_TOKEN")) {
        Some(token) => set_header(req, AUTHORIZATION, &format_for_bearer(token)),
        None => warn!(scheme = %scheme.key, "no access token in environment"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{Form, Router, routing::post};
    use pretty_assertions::assert_eq;
    use reqwest::Method;
    use reqwest::header::HeaderMap;
    use serde_json::json;

    use super::*;
    use crate::cache::InMemoryCache;

    fn request() -> OutgoingRequest {
        OutgoingRequest::new(Method::GET, url::Url::parse("https://api.example.com/pets").unwrap())
    }

    fn resolver() -> CredentialResolver {
        let backend = Arc::new(InMemoryCache::new());
        CredentialResolver::new(
            reqwest::Client::new(),
            TypedCache::new(backend, "test", Duration::from_secs(60)),
            Duration::from_secs(10),
        )
    }

    fn scheme(key: &str, kind: &str, http: Option<&str>, vars: &[&str]) -> HttpSecurity {
        HttpSecurity {
            key: key.into(),
            scheme_type: kind.into(),
            scheme: http.map(String::from),
            env_variables: vars.iter().map(|v| (*v).to_string()).collect(),
            ..HttpSecurity::default()
        }
    }

    async fn apply(schemes: &[HttpSecurity], env: &CaseInsensitiveEnv, req: &mut OutgoingRequest) -> Result<()> {
        let scopes = BTreeMap::new();
        let ctx = SecurityContext {
            project_id: "p",
            schemes,
            scopes: &scopes,
            env,
            server_url: "https://api.example.com",
        };
        resolver().apply(req, &ctx).await
    }

    // ========================================================================
    // Static schemes
    // ========================================================================

    #[test]
    fn bearer_prefix_is_idempotent() {
        assert_eq!(format_for_bearer("abc"), "Bearer abc");
        assert_eq!(format_for_bearer("bearer abc"), "bearer abc");
        assert_eq!(format_for_bearer("BEARER abc"), "BEARER abc");
    }

    #[tokio::test]
    async fn api_key_header_and_query() {
        let mut header = scheme("api_key", "apiKey", None, &["PETS_API_KEY"]);
        header.name = Some("X-API-Key".into());
        header.placement = Some("header".into());
        let mut query = scheme("q", "apiKey", None, &["PETS_Q"]);
        query.name = Some("key".into());
        query.placement = Some("query".into());

        let env: CaseInsensitiveEnv = [("pets_api_key", "k1"), ("PETS_Q", "k2")].into_iter().collect();
        let mut req = request();
        apply(&[header, query], &env, &mut req).await.unwrap();
        assert_eq!(req.headers["x-api-key"], "k1");
        assert_eq!(req.url.query(), Some("key=k2"));
    }

    #[tokio::test]
    async fn missing_values_are_skipped() {
        let mut header = scheme("api_key", "apiKey", None, &["PETS_API_KEY"]);
        header.placement = Some("header".into());
        let basic = scheme("basic", "http", Some("basic"), &["PETS_BASIC_USERNAME", "PETS_BASIC_PASSWORD"]);
        let env: CaseInsensitiveEnv = [("PETS_BASIC_USERNAME", "u")].into_iter().collect();
        let mut req = request();
        apply(&[header, basic], &env, &mut req).await.unwrap();
        assert!(req.headers.is_empty());
    }

    #[tokio::test]
    async fn basic_bearer_and_access_token() {
        let basic = scheme("basic", "http", Some("basic"), &["PETS_BASIC_USERNAME", "PETS_BASIC_PASSWORD"]);
        let env: CaseInsensitiveEnv = [("PETS_BASIC_USERNAME", "u"), ("PETS_BASIC_PASSWORD", "p")]
            .into_iter()
            .collect();
        let mut req = request();
        apply(&[basic], &env, &mut req).await.unwrap();
        assert_eq!(req.headers[AUTHORIZATION], "Basic dTpw");

        let oidc = scheme("oidc", "openIdConnect", None, &["PETS_OIDC_ACCESS_TOKEN"]);
        let env: CaseInsensitiveEnv = [("PETS_OIDC_ACCESS_TOKEN", "Bearer t")].into_iter().collect();
        let mut req = request();
        apply(&[oidc], &env, &mut req).await.unwrap();
        assert_eq!(req.headers[AUTHORIZATION], "Bearer t");
    }

    // ========================================================================
    // Client credentials
    // ========================================================================

    #[derive(Deserialize)]
    struct TokenForm {
        grant_type: String,
        client_id: Option<String>,
    }

    /// Rejects client credentials in the form, accepts them via Basic.
    async fn token_server(hits: Arc<AtomicUsize>) -> String {
        let app = Router::new().route(
            "/oauth/token",
            post(move |headers: HeaderMap, Form(form): Form<TokenForm>| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(form.grant_type, "client_credentials");
                    let basic = headers.get(AUTHORIZATION).is_some_and(|v| v == "Basic aWQ6c2VjcmV0");
                    if form.client_id.is_some() || !basic {
                        return (StatusCode::UNAUTHORIZED, axum::Json(json!({"error": "invalid_client"})));
                    }
                    (StatusCode::OK, axum::Json(json!({"accessToken": "cc-token", "expiresIn": 3600})))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn client_credentials_scheme() -> HttpSecurity {
        let mut s = scheme(
            "oauth",
            "oauth2",
            None,
            &[
                "PETS_OAUTH_ACCESS_TOKEN",
                "PETS_OAUTH_CLIENT_SECRET",
                "PETS_OAUTH_CLIENT_ID",
                "PETS_OAUTH_TOKEN_URL",
            ],
        );
        s.oauth_types = vec!["client_credentials".into()];
        s.oauth_flows = Some(json!({"clientCredentials": {"tokenUrl": "/oauth/token", "scopes": {}}}));
        s
    }

    #[tokio::test]
    async fn relative_token_url_is_fetched_once_and_cached() {
        let hits = Arc::new(AtomicUsize::new(0));
        let server = token_server(Arc::clone(&hits)).await;
        let resolver = resolver();
        let schemes = [client_credentials_scheme()];
        let scopes = BTreeMap::from([("oauth".to_string(), vec!["write".to_string(), "read".to_string()])]);
        let env: CaseInsensitiveEnv = [("PETS_OAUTH_CLIENT_ID", "id"), ("PETS_OAUTH_CLIENT_SECRET", "secret")]
            .into_iter()
            .collect();
        let ctx = SecurityContext {
            project_id: "p",
            schemes: &schemes,
            scopes: &scopes,
            env: &env,
            server_url: &format!("{server}/"),
        };

        for _ in 0..2 {
            let mut req = request();
            resolver.apply(&mut req, &ctx).await.unwrap();
            assert_eq!(req.headers[AUTHORIZATION], "Bearer cc-token");
        }
        // form attempt + basic retry, then served from cache
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let key = token_cache_key("p", "id", &format!("{server}/oauth/token"), &scopes["oauth"]);
        assert!(key.ends_with("-scopes-read,write"));
        assert!(resolver.tokens.get(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn explicit_access_token_wins() {
        let env: CaseInsensitiveEnv = [("PETS_OAUTH_ACCESS_TOKEN", "preset")].into_iter().collect();
        let mut req = request();
        apply(&[client_credentials_scheme()], &env, &mut req).await.unwrap();
        assert_eq!(req.headers[AUTHORIZATION], "Bearer preset");
    }

    #[tokio::test]
    async fn unreachable_token_endpoint_is_unauthorized() {
        let env: CaseInsensitiveEnv = [
            ("PETS_OAUTH_CLIENT_ID", "id"),
            ("PETS_OAUTH_CLIENT_SECRET", "secret"),
            ("PETS_OAUTH_TOKEN_URL", "http://127.0.0.1:1/token"),
        ]
        .into_iter()
        .collect();
        let mut req = request();
        let err = apply(&[client_credentials_scheme()], &env, &mut req).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Unauthorized);
        assert!(err.to_string().starts_with(TOKEN_REQUEST_FAILED));
    }

    #[test]
    fn expiry_uses_created_at() {
        let token = ClientCredentialsToken {
            key: "k".into(),
            access_token: "t".into(),
            token_type: String::new(),
            expires_in: 60,
            scope: String::new(),
            created_at: Utc::now() - chrono::Duration::seconds(61),
        };
        assert!(token.is_expired());
    }
}
