//! External OAuth provider client

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, error};
use url::Url;

use crate::config::OAuthProviderConfig;
use crate::secret::Secret;

/// Token obtained from the provider.
#[derive(Debug, Clone)]
pub struct ProviderToken {
    /// Provider access token
    pub access_token: Secret<String>,
    /// Provider expiry, when reported
    pub expires_at: Option<DateTime<Utc>>,
}

/// Provider exchange failure.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider refused the user
    #[error("access denied by provider: {0}")]
    AccessDenied(String),
    /// Anything else
    #[error("provider token exchange failed: {0}")]
    Failed(String),
}

impl ProviderError {
    /// OAuth error code reported to the client
    #[must_use]
    pub fn oauth_code(&self) -> &'static str {
        match self {
            Self::AccessDenied(_) => "access_denied",
            Self::Failed(_) => "server_error",
        }
    }
}

/// Talks to the configured external authorization server.
#[derive(Clone)]
pub struct ExternalProvider {
    http: Client,
    timeout: Duration,
}

impl ExternalProvider {
    /// Create a client with a per-exchange timeout
    #[must_use]
    pub fn new(http: Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    /// Provider authorize URL for a consented request.
    ///
    /// Uses the provider's configured scopes when present, otherwise the
    /// scope the client asked for.
    ///
    /// # Errors
    ///
    /// Fails when the configured endpoint does not parse.
    pub fn authorize_url(
        config: &OAuthProviderConfig,
        callback_url: &str,
        state: &str,
        requested_scope: &str,
        code_challenge: &str,
    ) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&config.authorization_endpoint)
            .map_err(|e| ProviderError::Failed(format!("invalid authorization endpoint: {e}")))?;
        let scope = if config.scopes.is_empty() {
            requested_scope.to_string()
        } else {
            config.scopes.join(" ")
        };
        url.query_pairs_mut()
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", callback_url)
            .append_pair("response_type", "code")
            .append_pair("state", state)
            .append_pair("scope", &scope)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256");
        Ok(url)
    }

    /// Exchange the provider's code for its access token.
    ///
    /// # Errors
    ///
    /// [`ProviderError::AccessDenied`] when the provider answers 401/403 or
    /// `access_denied`, [`ProviderError::Failed`] otherwise.
    pub async fn exchange_code(
        &self,
        config: &OAuthProviderConfig,
        code: &str,
        callback_url: &str,
        code_verifier: &str,
    ) -> Result<ProviderToken, ProviderError> {
        if config.client_id.is_empty() {
            return Err(ProviderError::Failed("provider client_id not configured".into()));
        }
        let use_basic = config
            .token_endpoint_auth_methods_supported
            .iter()
            .any(|m| m == "client_secret_basic");

        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", callback_url),
            ("code_verifier", code_verifier),
        ];
        if !use_basic {
            form.push(("client_id", config.client_id.as_str()));
            form.push(("client_secret", config.client_secret.as_str()));
        }

        let mut request = self
            .http
            .post(&config.token_endpoint)
            .timeout(self.timeout)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form);
        if use_basic {
            request = request.basic_auth(&config.client_id, Some(&config.client_secret));
        }

        let response = request.send().await.map_err(|e| {
            error!(error = %e, endpoint = %config.token_endpoint, "provider token request failed");
            ProviderError::Failed(e.to_string())
        })?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        let denied = body.get("error").and_then(Value::as_str) == Some("access_denied");
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) || denied {
            return Err(ProviderError::AccessDenied(format!("status {status}")));
        }
        if status != StatusCode::OK {
            error!(status = status.as_u16(), "provider token exchange failed");
            return Err(ProviderError::Failed(format!("status {status}")));
        }

        // snake_case per RFC 6749, camelCase from lenient providers
        let field = |snake: &str, camel: &str| body.get(snake).or_else(|| body.get(camel)).cloned();
        let access_token = field("access_token", "accessToken")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| ProviderError::Failed("missing access_token in provider response".into()))?;
        let expires_at = field("expires_in", "expiresIn")
            .and_then(|v| v.as_f64())
            .map(|secs| Utc::now() + TimeDelta::milliseconds((secs * 1000.0) as i64));
        debug!(has_expiry = expires_at.is_some(), "provider token obtained");

        Ok(ProviderToken {
            access_token: Secret::new(access_token),
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use axum::routing::post;
    use axum::{Form, Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    use super::*;

    fn config(token_endpoint: String) -> OAuthProviderConfig {
        OAuthProviderConfig {
            authorization_endpoint: "https://idp.example.com/authorize?tenant=1".into(),
            token_endpoint,
            client_id: "gw".into(),
            client_secret: "s3cret".into(),
            ..OAuthProviderConfig::default()
        }
    }

    #[test]
    fn authorize_url_prefers_configured_scopes() {
        let mut cfg = config(String::new());
        let url = ExternalProvider::authorize_url(&cfg, "https://gw/cb", "{\"k\":1}", "read", "ch").unwrap();
        let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["tenant"], "1");
        assert_eq!(pairs["scope"], "read");
        assert_eq!(pairs["state"], "{\"k\":1}");
        assert_eq!(pairs["code_challenge_method"], "S256");

        cfg.scopes = vec!["a".into(), "b".into()];
        let url = ExternalProvider::authorize_url(&cfg, "https://gw/cb", "s", "read", "ch").unwrap();
        let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["scope"], "a b");
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/token")
    }

    #[tokio::test]
    async fn exchange_reads_camel_case_and_expiry() {
        let app = Router::new().route(
            "/token",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                assert_eq!(form["client_secret"], "s3cret");
                assert_eq!(form["code"], "ext-code");
                Json(json!({"accessToken": "provider-at", "expiresIn": 60}))
            }),
        );
        let endpoint = serve(app).await;
        let provider = ExternalProvider::new(Client::new(), Duration::from_secs(5));
        let token = provider
            .exchange_code(&config(endpoint), "ext-code", "https://gw/cb", "verifier")
            .await
            .unwrap();
        assert_eq!(token.access_token.reveal(), "provider-at");
        let left = token.expires_at.unwrap() - Utc::now();
        assert!(left.num_seconds() <= 60 && left.num_seconds() >= 58);
    }

    #[tokio::test]
    async fn forbidden_is_access_denied() {
        let app = Router::new().route(
            "/token",
            post(|| async { (StatusCode::FORBIDDEN, Json(json!({"error": "nope"}))) }),
        );
        let endpoint = serve(app).await;
        let provider = ExternalProvider::new(Client::new(), Duration::from_secs(5));
        let err = provider
            .exchange_code(&config(endpoint), "c", "https://gw/cb", "v")
            .await
            .unwrap_err();
        assert_eq!(err.oauth_code(), "access_denied");
    }
}
