//! Authorization codes
//!
//! A grant is minted after the external provider calls back and is consumed
//! exactly once by the token endpoint. External provider tokens travel with
//! the grant, encrypted while stored.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use super::{OAuthError, expires_after};
use super::clients::{ClientInfo, ClientRegistry};
use super::pkce::{ChallengeMethod, random_token};
use crate::cache::{Cacheable, TypedCache};
use crate::encryption::Encryption;
use crate::secret::Secret;

/// Parameters of an authorization request, also carried through the
/// external provider round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationRequest {
    /// Must be `code`
    pub response_type: String,
    /// Registered client
    pub client_id: String,
    /// Registered redirect URI
    pub redirect_uri: String,
    /// Requested scope
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scope: String,
    /// Client state, echoed back
    #[serde(skip_serializing_if = "String::is_empty")]
    pub state: String,
    /// PKCE challenge
    #[serde(skip_serializing_if = "String::is_empty")]
    pub code_challenge: String,
    /// PKCE method
    #[serde(skip_serializing_if = "String::is_empty")]
    pub code_challenge_method: String,
    /// OpenID nonce
    #[serde(skip_serializing_if = "String::is_empty")]
    pub nonce: String,
}

/// An external credential in memory.
#[derive(Debug, Clone)]
pub struct ExternalSecret {
    /// Provider access token
    pub token: Secret<String>,
    /// Security scheme keys the token satisfies
    pub security_keys: Vec<String>,
    /// Provider expiry
    pub expires_at: Option<DateTime<Utc>>,
}

/// An external credential at rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedExternalSecret {
    /// Encrypted provider token
    pub token: String,
    /// Security scheme keys the token satisfies
    pub security_keys: Vec<String>,
    /// Provider expiry
    pub expires_at: Option<DateTime<Utc>>,
}

impl ExternalSecret {
    /// Encrypt for storage
    ///
    /// # Errors
    ///
    /// Fails when encryption fails.
    pub fn seal(&self, encryption: &Encryption) -> crate::Result<SealedExternalSecret> {
        Ok(SealedExternalSecret {
            token: encryption.encrypt_secret(&self.token)?,
            security_keys: self.security_keys.clone(),
            expires_at: self.expires_at,
        })
    }
}

impl SealedExternalSecret {
    /// Decrypt from storage
    ///
    /// # Errors
    ///
    /// Fails when the token does not decrypt.
    pub fn open(&self, encryption: &Encryption) -> crate::Result<ExternalSecret> {
        Ok(ExternalSecret {
            token: encryption.decrypt_secret(&self.token)?,
            security_keys: self.security_keys.clone(),
            expires_at: self.expires_at,
        })
    }
}

/// A stored authorization code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    /// Issuer the code belongs to
    pub issuer: String,
    /// The code
    pub code: String,
    /// Client the code was issued to
    pub client_id: String,
    /// Redirect URI used at authorization
    pub redirect_uri: String,
    /// Granted scope
    pub scope: String,
    /// Client state
    pub state: String,
    /// PKCE challenge
    pub code_challenge: String,
    /// PKCE method
    pub code_challenge_method: String,
    /// Extra properties (`nonce`)
    pub props: BTreeMap<String, String>,
    /// Encrypted provider tokens
    pub external_secrets: Vec<SealedExternalSecret>,
    /// Issue time
    pub created_at: DateTime<Utc>,
    /// Expiry
    pub expires_at: DateTime<Utc>,
}

impl Cacheable for Grant {
    fn cache_key(&self) -> String {
        grant_key(&self.issuer, &self.code)
    }

    fn ttl(&self) -> Option<Duration> {
        (self.expires_at - Utc::now()).to_std().ok()
    }
}

fn grant_key(issuer: &str, code: &str) -> String {
    format!("oauth_grant:{issuer}:{code}")
}

/// A consumed grant with its provider tokens decrypted.
#[derive(Debug, Clone)]
pub struct ConsumedGrant {
    /// Granted scope
    pub scope: String,
    /// PKCE challenge
    pub code_challenge: String,
    /// PKCE method
    pub code_challenge_method: String,
    /// Provider tokens
    pub external_secrets: Vec<ExternalSecret>,
}

/// Issues, validates and consumes authorization codes.
#[derive(Clone)]
pub struct GrantManager {
    cache: TypedCache<Grant>,
    clients: Arc<ClientRegistry>,
    encryption: Encryption,
    ttl: Duration,
}

impl GrantManager {
    /// Create a manager
    #[must_use]
    pub fn new(cache: TypedCache<Grant>, clients: Arc<ClientRegistry>, encryption: Encryption, ttl: Duration) -> Self {
        Self {
            cache,
            clients,
            encryption,
            ttl,
        }
    }

    /// Validate an authorization request against the registered client.
    ///
    /// `allowed_scopes`, when non-empty, further restricts the scope set.
    ///
    /// # Errors
    ///
    /// Returns `invalid_request` or `invalid_client` describing the failure.
    pub async fn validate_authorization_request(
        &self,
        issuer: &str,
        req: &AuthorizationRequest,
        allowed_scopes: &[String],
    ) -> Result<ClientInfo, OAuthError> {
        if req.response_type.is_empty() || req.client_id.is_empty() || req.redirect_uri.is_empty() {
            return Err(OAuthError::invalid_request(
                "response_type, client_id and redirect_uri are required",
            ));
        }
        if req.response_type != "code" {
            return Err(OAuthError::invalid_request(format!(
                "unsupported response_type: {}",
                req.response_type
            )));
        }
        let client = self
            .clients
            .get(issuer, &req.client_id)
            .await?
            .ok_or_else(|| OAuthError::invalid_client("invalid client_id"))?;
        if !client.has_redirect_uri(&req.redirect_uri) {
            return Err(OAuthError::invalid_client("invalid redirect_uri"));
        }

        if !req.code_challenge.is_empty() {
            let method = ChallengeMethod::parse(Some(req.code_challenge_method.as_str()))
                .ok_or_else(|| OAuthError::invalid_request("unsupported code_challenge_method"))?;
            if method == ChallengeMethod::Plain {
                warn!(client_id = %req.client_id, "client is using plain code challenge method");
            }
        }

        if !req.scope.is_empty() {
            let registered: Vec<&str> = client.scope.as_deref().map(|s| s.split_whitespace().collect()).unwrap_or_default();
            for scope in req.scope.split_whitespace() {
                let client_ok = registered.is_empty() || registered.contains(&scope);
                let server_ok = allowed_scopes.is_empty() || allowed_scopes.iter().any(|s| s == scope);
                if !client_ok || !server_ok {
                    return Err(OAuthError::invalid_request(format!(
                        "scope '{scope}' is not allowed for this client"
                    )));
                }
            }
        }
        Ok(client)
    }

    /// Mint and store a grant for a validated request
    ///
    /// # Errors
    ///
    /// Fails when encryption or storage fails.
    pub async fn create(
        &self,
        issuer: &str,
        req: &AuthorizationRequest,
        secrets: &[ExternalSecret],
    ) -> crate::Result<Grant> {
        let now = Utc::now();
        let mut props = BTreeMap::new();
        if !req.nonce.is_empty() {
            props.insert("nonce".to_string(), req.nonce.clone());
        }
        let grant = Grant {
            issuer: issuer.to_string(),
            code: random_token::<32>(),
            client_id: req.client_id.clone(),
            redirect_uri: req.redirect_uri.clone(),
            scope: req.scope.clone(),
            state: req.state.clone(),
            code_challenge: req.code_challenge.clone(),
            code_challenge_method: if req.code_challenge.is_empty() {
                String::new()
            } else if req.code_challenge_method.is_empty() {
                ChallengeMethod::Plain.as_str().to_string()
            } else {
                req.code_challenge_method.clone()
            },
            props,
            external_secrets: secrets
                .iter()
                .map(|s| s.seal(&self.encryption))
                .collect::<crate::Result<_>>()?,
            created_at: now,
            expires_at: expires_after(now, self.ttl),
        };
        self.cache.store(&grant).await?;
        info!(client_id = %grant.client_id, scope = %grant.scope, "authorization grant created");
        Ok(grant)
    }

    /// Validate a code and consume it so it can never be used again.
    ///
    /// Checks run in order: exists, not expired, client, redirect URI. The
    /// grant is deleted only after they pass; PKCE is left to the caller.
    ///
    /// # Errors
    ///
    /// Returns `invalid_grant` for every validation failure.
    pub async fn consume(
        &self,
        issuer: &str,
        code: &str,
        client_id: &str,
        redirect_uri: &str,
    ) -> Result<ConsumedGrant, OAuthError> {
        let key = grant_key(issuer, code);
        let grant = self
            .cache
            .get(&key)
            .await?
            .ok_or_else(|| OAuthError::invalid_grant("invalid authorization code"))?;

        if Utc::now() >= grant.expires_at {
            if let Err(e) = self.cache.delete(&grant).await {
                warn!(error = %e, "failed to delete expired grant");
            }
            return Err(OAuthError::invalid_grant("authorization code has expired"));
        }
        if grant.client_id != client_id {
            return Err(OAuthError::invalid_grant("invalid client"));
        }
        if grant.redirect_uri != redirect_uri {
            return Err(OAuthError::invalid_grant("invalid redirect URI"));
        }

        // a concurrent exchange may have won the race since the read above
        let grant = self
            .cache
            .take(&key)
            .await?
            .ok_or_else(|| OAuthError::invalid_grant("invalid authorization code"))?;
        info!(client_id, "grant validated and consumed");

        let external_secrets = grant
            .external_secrets
            .iter()
            .map(|s| s.open(&self.encryption))
            .collect::<crate::Result<_>>()?;
        Ok(ConsumedGrant {
            scope: grant.scope,
            code_challenge: grant.code_challenge,
            code_challenge_method: grant.code_challenge_method,
            external_secrets,
        })
    }
}

/// Redirect carrying a fresh code back to the client.
///
/// # Errors
///
/// Fails when the redirect URI does not parse.
pub fn authorization_response(grant: &Grant) -> Result<Url, OAuthError> {
    let mut url = Url::parse(&grant.redirect_uri)
        .map_err(|e| OAuthError::invalid_request(format!("invalid redirect URI: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("code", &grant.code);
        if !grant.state.is_empty() {
            query.append_pair("state", &grant.state);
        }
    }
    Ok(url)
}

/// Redirect carrying an error back to the client.
///
/// # Errors
///
/// Fails when the redirect URI does not parse.
pub fn error_response(redirect_uri: &str, error: &str, description: &str, state: &str) -> Result<Url, OAuthError> {
    let mut url =
        Url::parse(redirect_uri).map_err(|e| OAuthError::invalid_request(format!("invalid redirect URI: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("error", error);
        if !description.is_empty() {
            query.append_pair("error_description", description);
        }
        if !state.is_empty() {
            query.append_pair("state", state);
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cache::InMemoryCache;
    use crate::oauth::clients::RegistrationRequest;

    const ISSUER: &str = "https://gw/oauth/acme";

    async fn setup() -> (GrantManager, String) {
        let backend = Arc::new(InMemoryCache::new());
        let key = Encryption::new(&[3u8; 32]).unwrap();
        let clients = Arc::new(ClientRegistry::new(
            TypedCache::new(backend.clone(), "clients", Duration::from_secs(60)),
            key.clone(),
            Duration::from_secs(3600),
        ));
        let req: RegistrationRequest =
            serde_json::from_value(json!({"redirect_uris": ["https://app/cb"], "scope": "read write"})).unwrap();
        let client_id = clients.register(ISSUER, req).await.unwrap().client_id;
        let grants = GrantManager::new(
            TypedCache::new(backend, "grants", Duration::from_secs(600)),
            clients,
            key,
            Duration::from_secs(600),
        );
        (grants, client_id)
    }

    fn auth_request(client_id: &str) -> AuthorizationRequest {
        AuthorizationRequest {
            response_type: "code".into(),
            client_id: client_id.into(),
            redirect_uri: "https://app/cb".into(),
            scope: "read".into(),
            state: "xyz".into(),
            nonce: "n-1".into(),
            ..AuthorizationRequest::default()
        }
    }

    // =========================================================================
    // Authorization request validation
    // =========================================================================

    #[tokio::test]
    async fn validates_client_redirect_and_scope() {
        let (grants, client_id) = setup().await;
        let req = auth_request(&client_id);
        assert!(grants.validate_authorization_request(ISSUER, &req, &[]).await.is_ok());

        let mut bad = req.clone();
        bad.redirect_uri = "https://app/cb/".into();
        assert_eq!(
            grants.validate_authorization_request(ISSUER, &bad, &[]).await.unwrap_err().error,
            "invalid_client"
        );

        let mut bad = req.clone();
        bad.scope = "read admin".into();
        assert!(grants.validate_authorization_request(ISSUER, &bad, &[]).await.is_err());

        assert!(
            grants
                .validate_authorization_request(ISSUER, &req, &["write".to_string()])
                .await
                .is_err()
        );

        let mut bad = req;
        bad.code_challenge = "abc".into();
        bad.code_challenge_method = "S512".into();
        assert!(grants.validate_authorization_request(ISSUER, &bad, &[]).await.is_err());
    }

    // =========================================================================
    // Consumption
    // =========================================================================

    #[tokio::test]
    async fn grant_is_one_shot_and_carries_secrets() {
        let (grants, client_id) = setup().await;
        let secret = ExternalSecret {
            token: Secret::new("provider-token".into()),
            security_keys: vec!["oauth".into()],
            expires_at: None,
        };
        let grant = grants.create(ISSUER, &auth_request(&client_id), &[secret]).await.unwrap();
        assert_eq!(grant.code.len(), 43);
        assert_eq!(grant.props["nonce"], "n-1");
        assert_ne!(grant.external_secrets[0].token, "provider-token");

        let url = authorization_response(&grant).unwrap();
        assert_eq!(url.query(), Some(format!("code={}&state=xyz", grant.code).as_str()));

        let consumed = grants
            .consume(ISSUER, &grant.code, &client_id, "https://app/cb")
            .await
            .unwrap();
        assert_eq!(consumed.external_secrets[0].token.reveal(), "provider-token");

        let replay = grants
            .consume(ISSUER, &grant.code, &client_id, "https://app/cb")
            .await
            .unwrap_err();
        assert_eq!(replay.error, "invalid_grant");
        assert_eq!(replay.description, "invalid authorization code");
    }

    #[tokio::test]
    async fn failed_checks_do_not_consume() {
        let (grants, client_id) = setup().await;
        let grant = grants.create(ISSUER, &auth_request(&client_id), &[]).await.unwrap();

        let err = grants.consume(ISSUER, &grant.code, "client_other", "https://app/cb").await.unwrap_err();
        assert_eq!(err.description, "invalid client");
        let err = grants.consume(ISSUER, &grant.code, &client_id, "https://evil/cb").await.unwrap_err();
        assert_eq!(err.description, "invalid redirect URI");

        assert!(grants.consume(ISSUER, &grant.code, &client_id, "https://app/cb").await.is_ok());
    }

    #[test]
    fn error_redirect_carries_state() {
        let url = error_response("https://app/cb?x=1", "access_denied", "denied", "s1").unwrap();
        assert_eq!(
            url.as_str(),
            "https://app/cb?x=1&error=access_denied&error_description=denied&state=s1"
        );
    }
}
