//! OAuth 2.1 proxy
//!
//! Lets MCP clients authorize against an external identity provider while
//! the gateway issues its own codes and tokens:
//! - Dynamic client registration (RFC 7591)
//! - Consent page and external provider round trip
//! - Authorization codes with PKCE (RFC 7636), consumed exactly once
//! - Access tokens hashed at rest, carrying encrypted provider tokens
//! - Authorization server metadata (RFC 8414)

pub mod clients;
pub mod grants;
mod handlers;
pub mod metadata;
pub mod pkce;
pub mod provider;
pub mod state;
pub mod tokens;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use tracing::error;

pub use handlers::router;
pub use metadata::{AuthorizationServerMetadata, issuer_url};
pub use tokens::{TokenError, ValidToken};

use crate::cache::{CacheBackend, TypedCache};
use crate::config::{Config, OAuthProviderConfig, ToolsetConfig};
use crate::encryption::Encryption;
use clients::ClientRegistry;
use grants::GrantManager;
use provider::ExternalProvider;
use state::StateStore;
use tokens::TokenService;

/// OAuth error response `{error, error_description}`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}: {description}")]
pub struct OAuthError {
    /// RFC 6749 error code
    pub error: &'static str,
    /// Human readable description
    pub description: String,
    /// HTTP status
    pub status: StatusCode,
}

impl OAuthError {
    fn new(error: &'static str, status: StatusCode, description: impl Into<String>) -> Self {
        Self {
            error,
            description: description.into(),
            status,
        }
    }

    /// `invalid_request`
    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, description)
    }

    /// `invalid_client`
    pub fn invalid_client(description: impl Into<String>) -> Self {
        Self::new("invalid_client", StatusCode::BAD_REQUEST, description)
    }

    /// `invalid_grant`
    pub fn invalid_grant(description: impl Into<String>) -> Self {
        Self::new("invalid_grant", StatusCode::BAD_REQUEST, description)
    }

    /// `unsupported_grant_type`
    pub fn unsupported_grant_type(description: impl Into<String>) -> Self {
        Self::new("unsupported_grant_type", StatusCode::BAD_REQUEST, description)
    }

    /// `invalid_client_metadata`
    pub fn invalid_client_metadata(description: impl Into<String>) -> Self {
        Self::new("invalid_client_metadata", StatusCode::BAD_REQUEST, description)
    }

    /// `server_error`
    pub fn server_error(description: impl Into<String>) -> Self {
        Self::new("server_error", StatusCode::INTERNAL_SERVER_ERROR, description)
    }

    /// Unknown MCP slug or a toolset without OAuth
    pub fn not_found() -> Self {
        Self::new("invalid_request", StatusCode::NOT_FOUND, "mcp server not found")
    }
}

impl From<crate::Error> for OAuthError {
    fn from(err: crate::Error) -> Self {
        error!(error = %err, "oauth storage failure");
        let id = err.id().map(ToString::to_string).unwrap_or_default();
        Self::server_error(format!("internal error {id}").trim_end().to_string())
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        (
            self.status,
            [(header::CACHE_CONTROL, "no-store")],
            Json(json!({
                "error": self.error,
                "error_description": self.description,
            })),
        )
            .into_response()
    }
}

/// `now + ttl`, saturating on absurd lifetimes
pub(crate) fn expires_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// The OAuth proxy for every OAuth-enabled toolset.
pub struct OAuthService {
    base_url: String,
    toolsets: HashMap<String, ToolsetConfig>,
    clients: Arc<ClientRegistry>,
    grants: Arc<GrantManager>,
    tokens: TokenService,
    states: StateStore,
    provider: ExternalProvider,
}

impl OAuthService {
    /// Wire the proxy onto a cache backend
    #[must_use]
    pub fn new(config: &Config, backend: &Arc<dyn CacheBackend>, encryption: &Encryption, http: reqwest::Client) -> Self {
        let oauth = &config.oauth;
        let clients = Arc::new(ClientRegistry::new(
            TypedCache::new(Arc::clone(backend), "oauth_clients", oauth.client_secret_lifetime),
            encryption.clone(),
            oauth.client_secret_lifetime,
        ));
        let grants = Arc::new(GrantManager::new(
            TypedCache::new(Arc::clone(backend), "oauth_grants", oauth.grant_ttl),
            Arc::clone(&clients),
            encryption.clone(),
            oauth.grant_ttl,
        ));
        let tokens = TokenService::new(
            TypedCache::new(Arc::clone(backend), "oauth_tokens", oauth.token_ttl),
            Arc::clone(&clients),
            Arc::clone(&grants),
            encryption.clone(),
            oauth.token_ttl,
        );
        let states = StateStore::new(
            TypedCache::new(Arc::clone(backend), "oauth_state", oauth.state_ttl).with_encryption(encryption.clone()),
        );
        Self {
            base_url: config.server.base_url(),
            toolsets: config.toolsets.clone(),
            clients,
            grants,
            tokens,
            states,
            provider: ExternalProvider::new(http, config.proxy.client_credentials_timeout),
        }
    }

    /// Issuer for an MCP slug
    #[must_use]
    pub fn issuer(&self, mcp_slug: &str) -> String {
        issuer_url(&self.base_url, mcp_slug)
    }

    /// Provider config of an OAuth-enabled toolset
    #[must_use]
    pub fn provider_config(&self, mcp_slug: &str) -> Option<&OAuthProviderConfig> {
        self.toolsets.get(mcp_slug).and_then(|t| t.oauth.as_ref())
    }

    /// Validate a bearer token issued for `mcp_slug`.
    ///
    /// # Errors
    ///
    /// See [`TokenService::validate_access_token`].
    pub async fn validate_access_token(&self, mcp_slug: &str, access_token: &str) -> Result<ValidToken, TokenError> {
        self.tokens
            .validate_access_token(&self.issuer(mcp_slug), access_token)
            .await
    }
}
