//! OAuth HTTP endpoints

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use url::Url;

use super::clients::RegistrationRequest;
use super::grants::{AuthorizationRequest, ExternalSecret, authorization_response, error_response};
use super::metadata::AuthorizationServerMetadata;
use super::pkce::generate_pkce;
use super::provider::ExternalProvider;
use super::state::{ExternalOAuthState, state_key};
use super::tokens::TokenRequest;
use super::{OAuthError, OAuthService};
use crate::config::OAuthProviderConfig;

/// OAuth routes for every MCP slug
pub fn router(service: Arc<OAuthService>) -> Router {
    Router::new()
        .route("/oauth/{mcp}/register", post(register))
        .route("/oauth/{mcp}/authorize", get(authorize))
        .route("/oauth/{mcp}/complete", post(complete))
        .route("/oauth/{mcp}/callback", get(callback))
        .route("/oauth/{mcp}/token", post(token))
        .route("/oauth/{mcp}/.well-known/oauth-authorization-server", get(metadata))
        .route("/.well-known/oauth-authorization-server/oauth/{mcp}", get(metadata))
        .with_state(service)
}

fn provider<'a>(service: &'a OAuthService, mcp: &str) -> Result<&'a OAuthProviderConfig, OAuthError> {
    service.provider_config(mcp).ok_or_else(OAuthError::not_found)
}

/// `302 Found` to `location`
fn found(location: &Url) -> Response {
    match HeaderValue::from_str(location.as_str()) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(_) => OAuthError::server_error("invalid redirect location").into_response(),
    }
}

/// Authorization failures never redirect: the client is not trusted yet.
fn unauthorized_client(err: &OAuthError) -> Response {
    warn!(error = %err, "invalid authorization request");
    (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid_client"}))).into_response()
}

async fn metadata(State(service): State<Arc<OAuthService>>, Path(mcp): Path<String>) -> Result<Response, OAuthError> {
    let provider = provider(&service, &mcp)?;
    let meta = AuthorizationServerMetadata::for_issuer(&service.issuer(&mcp), &provider.allowed_scopes);
    Ok(Json(meta).into_response())
}

async fn register(
    State(service): State<Arc<OAuthService>>,
    Path(mcp): Path<String>,
    body: Bytes,
) -> Result<Response, OAuthError> {
    provider(&service, &mcp)?;
    let req: RegistrationRequest =
        serde_json::from_slice(&body).map_err(|e| OAuthError::invalid_client_metadata(e.to_string()))?;
    let registered = service.clients.register(&service.issuer(&mcp), req).await?;
    Ok((StatusCode::CREATED, [(header::CACHE_CONTROL, "no-store")], Json(registered)).into_response())
}

fn normalize(mut req: AuthorizationRequest) -> AuthorizationRequest {
    if !req.code_challenge.is_empty() && req.code_challenge_method.is_empty() {
        "plain".clone_into(&mut req.code_challenge_method);
    }
    req
}

async fn authorize(
    State(service): State<Arc<OAuthService>>,
    Path(mcp): Path<String>,
    Query(req): Query<AuthorizationRequest>,
) -> Result<Response, OAuthError> {
    let provider = provider(&service, &mcp)?;
    let req = normalize(req);
    let client = match service
        .grants
        .validate_authorization_request(&service.issuer(&mcp), &req, &provider.allowed_scopes)
        .await
    {
        Ok(client) => client,
        Err(err) if err.status.is_server_error() => return Err(err),
        Err(err) => return Ok(unauthorized_client(&err)),
    };
    let name = client.client_name.as_deref().unwrap_or(&client.client_id);
    Ok(Html(consent_page(&mcp, name, &req)).into_response())
}

/// Form posted by the consent page.
#[derive(Debug, Deserialize)]
struct CompleteForm {
    action: String,
    #[serde(flatten)]
    request: AuthorizationRequest,
}

/// The `state` parameter sent to the provider.
#[derive(Debug, Serialize, Deserialize)]
struct ProviderState {
    key: String,
    mcp_slug: String,
    #[serde(flatten)]
    request: AuthorizationRequest,
}

async fn complete(
    State(service): State<Arc<OAuthService>>,
    Path(mcp): Path<String>,
    Form(form): Form<CompleteForm>,
) -> Result<Response, OAuthError> {
    let provider = provider(&service, &mcp)?;
    let issuer = service.issuer(&mcp);
    let req = normalize(form.request);
    // hidden fields are client controlled, validate again
    match service
        .grants
        .validate_authorization_request(&issuer, &req, &provider.allowed_scopes)
        .await
    {
        Ok(_) => {}
        Err(err) if err.status.is_server_error() => return Err(err),
        Err(err) => return Ok(unauthorized_client(&err)),
    }

    if form.action != "approve" {
        info!(client_id = %req.client_id, "user denied authorization");
        let url = error_response(&req.redirect_uri, "access_denied", "the user denied access", &req.state)?;
        return Ok(found(&url));
    }

    let (verifier, challenge) = generate_pkce();
    let key = state_key(&verifier);
    let state_param = serde_json::to_string(&ProviderState {
        key: key.clone(),
        mcp_slug: mcp.clone(),
        request: req.clone(),
    })
    .map_err(|e| OAuthError::server_error(e.to_string()))?;

    service
        .states
        .put(&ExternalOAuthState {
            key,
            issuer: issuer.clone(),
            mcp_slug: mcp.clone(),
            request: req.clone(),
            code_verifier: verifier,
            created_at: Utc::now(),
        })
        .await?;

    let url = ExternalProvider::authorize_url(
        provider,
        &format!("{issuer}/callback"),
        &state_param,
        &req.scope,
        &challenge,
    )
    .map_err(|e| OAuthError::server_error(e.to_string()))?;
    info!(client_id = %req.client_id, provider = %provider.authorization_endpoint, "redirecting to external provider");
    Ok(found(&url))
}

/// Query of the provider's redirect.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CallbackParams {
    code: String,
    state: String,
    error: String,
}

async fn callback(
    State(service): State<Arc<OAuthService>>,
    Path(mcp): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Result<Response, OAuthError> {
    let provider = provider(&service, &mcp)?;
    let carried: ProviderState = serde_json::from_str(&params.state)
        .map_err(|e| OAuthError::invalid_request(format!("failed to decode state: {e}")))?;
    let stored = service
        .states
        .take(&carried.key)
        .await?
        .filter(|s| s.mcp_slug == mcp && s.mcp_slug == carried.mcp_slug)
        .ok_or_else(|| OAuthError::invalid_request("unknown or expired state"))?;
    let req = stored.request;

    if !params.error.is_empty() {
        let code = if params.error == "access_denied" { "access_denied" } else { "server_error" };
        let url = error_response(&req.redirect_uri, code, "the provider did not authorize the request", &req.state)?;
        return Ok(found(&url));
    }
    if params.code.is_empty() {
        return Err(OAuthError::invalid_request("code is required"));
    }

    let callback_url = format!("{}/callback", stored.issuer);
    let external = match service
        .provider
        .exchange_code(provider, &params.code, &callback_url, &stored.code_verifier)
        .await
    {
        Ok(token) => token,
        Err(err) => {
            error!(error = %err, "provider token exchange failed");
            let url = error_response(&req.redirect_uri, err.oauth_code(), "failed to authorize, please try again", &req.state)?;
            return Ok(found(&url));
        }
    };

    let secret = ExternalSecret {
        token: external.access_token,
        security_keys: provider.security_keys.clone(),
        expires_at: external.expires_at,
    };
    let grant = match service.grants.create(&stored.issuer, &req, &[secret]).await {
        Ok(grant) => grant,
        Err(err) => {
            error!(error = %err, "failed to create authorization grant");
            let url = error_response(&req.redirect_uri, "server_error", "failed to create authorization grant", &req.state)?;
            return Ok(found(&url));
        }
    };
    info!(client_id = %req.client_id, "authorization grant created after provider callback");
    Ok(found(&authorization_response(&grant)?))
}

/// `Authorization: Basic base64(id:secret)`
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = raw.get(..6).filter(|p| p.eq_ignore_ascii_case("basic ")).map(|_| &raw[6..])?;
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (id, secret) = decoded.split_once(':')?;
    Some((id.to_string(), secret.to_string()))
}

async fn token(
    State(service): State<Arc<OAuthService>>,
    Path(mcp): Path<String>,
    headers: HeaderMap,
    Form(mut req): Form<TokenRequest>,
) -> Result<Response, OAuthError> {
    provider(&service, &mcp)?;
    if req.client_id.is_empty()
        && let Some((id, secret)) = basic_credentials(&headers)
    {
        req.client_id = id;
        req.client_secret = secret;
    }
    let issued = service.tokens.exchange(&service.issuer(&mcp), &req).await?;
    Ok(([(header::CACHE_CONTROL, "no-store")], Json(issued)).into_response())
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn consent_page(mcp: &str, client_name: &str, req: &AuthorizationRequest) -> String {
    let fields = [
        ("response_type", &req.response_type),
        ("client_id", &req.client_id),
        ("redirect_uri", &req.redirect_uri),
        ("scope", &req.scope),
        ("state", &req.state),
        ("code_challenge", &req.code_challenge),
        ("code_challenge_method", &req.code_challenge_method),
        ("nonce", &req.nonce),
    ];
    let hidden: String = fields
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("<input type=\"hidden\" name=\"{k}\" value=\"{}\">\n", escape_html(v)))
        .collect();
    let scope = if req.scope.is_empty() {
        String::new()
    } else {
        format!("<p>Requested scope: <code>{}</code></p>\n", escape_html(&req.scope))
    };
    format!(
        "<!DOCTYPE html>
<html>
<head><meta charset=\"utf-8\"><title>Authorize {client}</title></head>
<body>
<h1>Authorize {client}</h1>
<p><strong>{client}</strong> wants to use tools from <strong>{mcp}</strong> on your behalf.</p>
{scope}<form method=\"post\" action=\"/oauth/{mcp}/complete\">
{hidden}<button type=\"submit\" name=\"action\" value=\"approve\">Approve</button>
<button type=\"submit\" name=\"action\" value=\"deny\">Deny</button>
</form>
</body>
</html>
",
        client = escape_html(client_name),
        mcp = escape_html(mcp),
    )
}
