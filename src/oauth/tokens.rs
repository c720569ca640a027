//! Access tokens
//!
//! Bearer tokens are only ever stored under their SHA-256 hash. External
//! provider tokens ride along encrypted, and the token's lifetime is clamped
//! to the earliest external expiry.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::clients::ClientRegistry;
use super::grants::{ExternalSecret, GrantManager, SealedExternalSecret};
use super::pkce::{ChallengeMethod, random_token, verify_code_challenge};
use super::{OAuthError, expires_after};
use crate::cache::{Cacheable, TypedCache};
use crate::encryption::Encryption;
use crate::secret::Secret;

/// Token endpoint form.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TokenRequest {
    /// Must be `authorization_code`
    pub grant_type: String,
    /// Authorization code
    pub code: String,
    /// Redirect URI used at authorization
    pub redirect_uri: String,
    /// Client id, may come from Basic auth instead
    pub client_id: String,
    /// Client secret, may come from Basic auth instead
    pub client_secret: String,
    /// PKCE verifier
    pub code_verifier: String,
}

/// A stored access token, keyed by the hash of the bearer value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// Issuer the token belongs to
    pub issuer: String,
    /// `base64url(sha256(access_token))`
    pub access_token_hash: String,
    /// Always `Bearer`
    pub token_type: String,
    /// Granted scope
    pub scope: String,
    /// Encrypted provider tokens
    pub external_secrets: Vec<SealedExternalSecret>,
    /// Issue time
    pub created_at: DateTime<Utc>,
    /// Expiry
    pub expires_at: DateTime<Utc>,
}

impl Cacheable for Token {
    fn cache_key(&self) -> String {
        token_key(&self.issuer, &self.access_token_hash)
    }

    fn ttl(&self) -> Option<Duration> {
        (self.expires_at - Utc::now()).to_std().ok()
    }
}

fn token_key(issuer: &str, hash: &str) -> String {
    format!("oauth_token:{issuer}:{hash}")
}

/// `base64url(sha256(token))`
#[must_use]
pub fn hash_token(token: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes()))
}

/// A freshly issued token, the only time the bearer value exists in clear.
#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    /// Bearer value
    #[serde(serialize_with = "reveal")]
    pub access_token: Secret<String>,
    /// `Bearer`
    pub token_type: String,
    /// Seconds until expiry
    pub expires_in: i64,
    /// Granted scope
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scope: String,
}

fn reveal<S: serde::Serializer>(value: &Secret<String>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(value.reveal())
}

/// A token that passed validation.
#[derive(Debug, Clone)]
pub struct ValidToken {
    /// Granted scope
    pub scope: String,
    /// Expiry
    pub expires_at: DateTime<Utc>,
    /// Decrypted provider tokens
    pub external_secrets: Vec<ExternalSecret>,
}

/// Why a bearer token was refused.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Unknown token
    #[error("invalid access token")]
    InvalidAccessToken,
    /// Token or one of its external secrets expired
    #[error("access token has expired")]
    ExpiredAccessToken,
    /// Storage failure
    #[error(transparent)]
    Storage(#[from] crate::Error),
}

/// Exchanges grants for tokens and validates tokens.
#[derive(Clone)]
pub struct TokenService {
    cache: TypedCache<Token>,
    clients: Arc<ClientRegistry>,
    grants: Arc<GrantManager>,
    encryption: Encryption,
    ttl: Duration,
}

impl TokenService {
    /// Create a service
    #[must_use]
    pub fn new(
        cache: TypedCache<Token>,
        clients: Arc<ClientRegistry>,
        grants: Arc<GrantManager>,
        encryption: Encryption,
        ttl: Duration,
    ) -> Self {
        Self {
            cache,
            clients,
            grants,
            encryption,
            ttl,
        }
    }

    /// Exchange an authorization code for an access token.
    ///
    /// # Errors
    ///
    /// `unsupported_grant_type`, `invalid_request`, `invalid_client` or
    /// `invalid_grant` per the failed check.
    pub async fn exchange(&self, issuer: &str, req: &TokenRequest) -> Result<TokenResponse, OAuthError> {
        if req.grant_type != "authorization_code" {
            return Err(OAuthError::unsupported_grant_type(format!(
                "unsupported grant_type: {}",
                req.grant_type
            )));
        }
        if req.code.is_empty() || req.client_id.is_empty() || req.redirect_uri.is_empty() {
            return Err(OAuthError::invalid_request("code, client_id and redirect_uri are required"));
        }

        self.clients
            .authenticate(issuer, &req.client_id, &req.client_secret)
            .await?;
        let grant = self
            .grants
            .consume(issuer, &req.code, &req.client_id, &req.redirect_uri)
            .await?;

        if !req.code_verifier.is_empty() || !grant.code_challenge.is_empty() {
            let method = ChallengeMethod::parse(Some(grant.code_challenge_method.as_str()))
                .ok_or_else(|| OAuthError::invalid_grant("unsupported code_challenge_method"))?;
            verify_code_challenge(&req.code_verifier, &grant.code_challenge, method)
                .map_err(|e| OAuthError::invalid_grant(format!("PKCE validation failed: {e}")))?;
        }

        let now = Utc::now();
        let mut expires_at = expires_after(now, self.ttl);
        if let Some(earliest) = grant.external_secrets.iter().filter_map(|s| s.expires_at).min() {
            expires_at = expires_at.min(earliest);
        }
        if expires_at <= now {
            return Err(OAuthError::invalid_grant("external credential has expired"));
        }

        let access_token = Secret::new(random_token::<32>());
        let token = Token {
            issuer: issuer.to_string(),
            access_token_hash: hash_token(access_token.reveal()),
            token_type: "Bearer".to_string(),
            scope: grant.scope,
            external_secrets: grant
                .external_secrets
                .iter()
                .map(|s| s.seal(&self.encryption))
                .collect::<crate::Result<_>>()?,
            created_at: now,
            expires_at,
        };
        self.cache.store(&token).await?;
        info!(client_id = %req.client_id, expires_at = %expires_at, "access token issued");

        Ok(TokenResponse {
            access_token,
            token_type: token.token_type,
            expires_in: (expires_at - now).num_seconds(),
            scope: token.scope,
        })
    }

    /// Validate a bearer token. Expired entries are deleted on read.
    ///
    /// # Errors
    ///
    /// [`TokenError::InvalidAccessToken`] on a miss,
    /// [`TokenError::ExpiredAccessToken`] when the token or any external
    /// secret has expired.
    pub async fn validate_access_token(&self, issuer: &str, access_token: &str) -> Result<ValidToken, TokenError> {
        let key = token_key(issuer, &hash_token(access_token));
        let Some(token) = self.cache.get(&key).await? else {
            return Err(TokenError::InvalidAccessToken);
        };

        let now = Utc::now();
        let external_expired = token
            .external_secrets
            .iter()
            .any(|s| s.expires_at.is_some_and(|at| at <= now));
        if token.expires_at <= now || external_expired {
            if let Err(e) = self.cache.delete(&token).await {
                warn!(error = %e, "failed to delete expired token");
            }
            return Err(TokenError::ExpiredAccessToken);
        }

        let external_secrets = token
            .external_secrets
            .iter()
            .map(|s| s.open(&self.encryption))
            .collect::<crate::Result<_>>()?;
        Ok(ValidToken {
            scope: token.scope,
            expires_at: token.expires_at,
            external_secrets,
        })
    }
}
