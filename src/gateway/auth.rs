//! Bearer authentication for OAuth-protected toolsets
//!
//! Toolsets without an OAuth provider are open. For the others the caller
//! must present an access token issued by the OAuth proxy; the provider
//! tokens it carries are handed to the tool call, keyed by security scheme.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};

use super::router::AppState;
use crate::oauth::{TokenError, ValidToken};
use crate::secret::Secret;

/// Credentials established for a tool call
#[derive(Debug, Clone, Default)]
pub struct CallerAuth {
    /// Provider access tokens keyed by security scheme key
    pub oauth_tokens: BTreeMap<String, Secret<String>>,
}

impl CallerAuth {
    fn from_token(token: ValidToken) -> Self {
        let mut oauth_tokens = BTreeMap::new();
        for secret in token.external_secrets {
            for key in &secret.security_keys {
                oauth_tokens.insert(key.clone(), secret.token.clone());
            }
        }
        Self { oauth_tokens }
    }
}

/// Extract a bearer token, accepting any case of the scheme name
#[must_use]
pub fn bearer_token(value: &str) -> Option<&str> {
    let prefix = value.get(..7)?;
    prefix
        .eq_ignore_ascii_case("bearer ")
        .then(|| value[7..].trim())
        .filter(|t| !t.is_empty())
}

/// Authentication middleware for `/mcp/{mcp_slug}/...` routes
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    Path(params): Path<BTreeMap<String, String>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let Some(mcp) = params.get("mcp_slug") else {
        return next.run(request).await;
    };
    let protected = state.config.toolset(mcp).is_some_and(|t| t.oauth.is_some());
    let oauth = state.oauth.as_ref().filter(|_| protected);
    let Some(oauth) = oauth else {
        request.extensions_mut().insert(CallerAuth::default());
        return next.run(request).await;
    };

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);
    let Some(token) = token else {
        warn!(mcp = %mcp, "missing bearer token");
        return unauthorized_response(&oauth.issuer(mcp), "missing bearer token");
    };

    match oauth.validate_access_token(mcp, token).await {
        Ok(valid) => {
            debug!(mcp = %mcp, scope = %valid.scope, "authenticated request");
            request.extensions_mut().insert(CallerAuth::from_token(valid));
            next.run(request).await
        }
        Err(TokenError::Storage(e)) => e.into_response(),
        Err(e) => {
            warn!(mcp = %mcp, error = %e, "rejected bearer token");
            unauthorized_response(&oauth.issuer(mcp), &e.to_string())
        }
    }
}

/// Create a 401 Unauthorized response pointing at the issuer metadata
fn unauthorized_response(issuer: &str, message: &str) -> Response {
    let challenge = format!("Bearer error=\"invalid_token\", authorization_uri=\"{issuer}/authorize\"");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, challenge)],
        Json(json!({
            "error": "unauthorized",
            "message": message,
        })),
    )
        .into_response()
}
