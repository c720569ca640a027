//! Dynamic client registration (RFC 7591)

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use url::Url;

use super::OAuthError;
use super::pkce::random_token;
use crate::Result;
use crate::cache::{Cacheable, TypedCache};
use crate::encryption::Encryption;
use crate::secret::Secret;

/// Grant types a client may register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    /// `authorization_code`
    AuthorizationCode,
    /// `refresh_token`
    RefreshToken,
}

/// Response types a client may register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    /// `code`
    Code,
}

/// How a client authenticates at the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEndpointAuthMethod {
    /// HTTP Basic
    ClientSecretBasic,
    /// Form fields
    ClientSecretPost,
    /// Public client
    None,
}

/// Registered application type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationType {
    /// Web application
    Web,
    /// Native application
    Native,
}

/// Registration request body. Unknown enum values fail to deserialize.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistrationRequest {
    /// Redirect URIs
    pub redirect_uris: Vec<String>,
    /// Display name
    pub client_name: Option<String>,
    /// Requested grant types
    pub grant_types: Vec<GrantType>,
    /// Requested response types
    pub response_types: Vec<ResponseType>,
    /// Space separated scope set
    pub scope: Option<String>,
    /// Token endpoint authentication
    pub token_endpoint_auth_method: Option<TokenEndpointAuthMethod>,
    /// Application type
    pub application_type: Option<ApplicationType>,
}

/// A registered client as stored. The secret is encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Issuer the client belongs to
    pub issuer: String,
    /// Client id
    pub client_id: String,
    /// Encrypted client secret, absent for public clients
    pub client_secret: Option<String>,
    /// Secret expiry, Unix seconds
    pub client_secret_expires_at: i64,
    /// Display name
    pub client_name: Option<String>,
    /// Registered redirect URIs
    pub redirect_uris: Vec<String>,
    /// Grant types
    pub grant_types: Vec<GrantType>,
    /// Response types
    pub response_types: Vec<ResponseType>,
    /// Allowed scope set
    pub scope: Option<String>,
    /// Token endpoint authentication
    pub token_endpoint_auth_method: TokenEndpointAuthMethod,
    /// Application type
    pub application_type: ApplicationType,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

impl Cacheable for ClientInfo {
    fn cache_key(&self) -> String {
        client_key(&self.issuer, &self.client_id)
    }

    fn ttl(&self) -> Option<Duration> {
        let remaining = self.client_secret_expires_at - Utc::now().timestamp();
        u64::try_from(remaining).ok().map(Duration::from_secs)
    }
}

fn client_key(issuer: &str, client_id: &str) -> String {
    format!("oauth_client:{issuer}:{client_id}")
}

/// Registration response, the only place the plaintext secret is returned.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationResponse {
    /// Client id
    pub client_id: String,
    /// Plaintext secret
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "reveal")]
    pub client_secret: Option<Secret<String>>,
    /// Registration time, Unix seconds
    pub client_id_issued_at: i64,
    /// Secret expiry, Unix seconds
    pub client_secret_expires_at: i64,
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Redirect URIs
    pub redirect_uris: Vec<String>,
    /// Grant types
    pub grant_types: Vec<GrantType>,
    /// Response types
    pub response_types: Vec<ResponseType>,
    /// Scope set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Token endpoint authentication
    pub token_endpoint_auth_method: TokenEndpointAuthMethod,
    /// Application type
    pub application_type: ApplicationType,
}

#[allow(clippy::ref_option)]
fn reveal<S: serde::Serializer>(value: &Option<Secret<String>>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(secret) => serializer.serialize_str(secret.reveal()),
        None => serializer.serialize_none(),
    }
}

/// Registers and authenticates clients.
#[derive(Clone)]
pub struct ClientRegistry {
    cache: TypedCache<ClientInfo>,
    encryption: Encryption,
    secret_lifetime: Duration,
}

impl ClientRegistry {
    /// Create a registry
    #[must_use]
    pub fn new(cache: TypedCache<ClientInfo>, encryption: Encryption, secret_lifetime: Duration) -> Self {
        Self {
            cache,
            encryption,
            secret_lifetime,
        }
    }

    /// Register a client, applying defaults.
    ///
    /// # Errors
    ///
    /// Returns `invalid_client_metadata` when redirect URIs are missing or do
    /// not parse, and `server_error` when storage fails.
    pub async fn register(&self, issuer: &str, req: RegistrationRequest) -> std::result::Result<RegistrationResponse, OAuthError> {
        if req.redirect_uris.is_empty() {
            return Err(OAuthError::invalid_client_metadata("redirect_uris is required"));
        }
        if let Some(bad) = req.redirect_uris.iter().find(|uri| Url::parse(uri).is_err()) {
            return Err(OAuthError::invalid_client_metadata(format!("invalid redirect_uri: {bad}")));
        }

        let auth_method = req
            .token_endpoint_auth_method
            .unwrap_or(TokenEndpointAuthMethod::ClientSecretPost);
        let now = Utc::now();
        let lifetime = i64::try_from(self.secret_lifetime.as_secs()).unwrap_or(i64::MAX);
        let client_id = format!("client_{}", random_token::<16>());
        let secret = (auth_method != TokenEndpointAuthMethod::None).then(|| Secret::new(random_token::<32>()));

        let client = ClientInfo {
            issuer: issuer.to_string(),
            client_id: client_id.clone(),
            client_secret: secret
                .as_ref()
                .map(|s| self.encryption.encrypt_secret(s))
                .transpose()
                .map_err(|e| OAuthError::server_error(e.to_string()))?,
            client_secret_expires_at: now.timestamp().saturating_add(lifetime),
            client_name: req.client_name,
            redirect_uris: req.redirect_uris,
            grant_types: if req.grant_types.is_empty() {
                vec![GrantType::AuthorizationCode]
            } else {
                req.grant_types
            },
            response_types: if req.response_types.is_empty() {
                vec![ResponseType::Code]
            } else {
                req.response_types
            },
            scope: req.scope.filter(|s| !s.trim().is_empty()),
            token_endpoint_auth_method: auth_method,
            application_type: req.application_type.unwrap_or(ApplicationType::Web),
            created_at: now,
        };
        self.cache.store(&client).await?;
        info!(client_id = %client.client_id, issuer, "registered oauth client");

        Ok(RegistrationResponse {
            client_id,
            client_secret: secret,
            client_id_issued_at: now.timestamp(),
            client_secret_expires_at: client.client_secret_expires_at,
            client_name: client.client_name,
            redirect_uris: client.redirect_uris,
            grant_types: client.grant_types,
            response_types: client.response_types,
            scope: client.scope,
            token_endpoint_auth_method: client.token_endpoint_auth_method,
            application_type: client.application_type,
        })
    }

    /// Look up a client
    ///
    /// # Errors
    ///
    /// Propagates storage errors.
    pub async fn get(&self, issuer: &str, client_id: &str) -> Result<Option<ClientInfo>> {
        self.cache.get(&client_key(issuer, client_id)).await
    }

    /// Authenticate a client at the token endpoint.
    ///
    /// A client registered without a secret accepts an empty one.
    ///
    /// # Errors
    ///
    /// Returns `invalid_client` for unknown clients, expired or wrong secrets.
    pub async fn authenticate(
        &self,
        issuer: &str,
        client_id: &str,
        client_secret: &str,
    ) -> std::result::Result<ClientInfo, OAuthError> {
        let client = self
            .get(issuer, client_id)
            .await?
            .ok_or_else(|| OAuthError::invalid_client("invalid client credentials"))?;

        let Some(stored) = &client.client_secret else {
            return if client_secret.is_empty() {
                Ok(client)
            } else {
                Err(OAuthError::invalid_client("invalid client credentials"))
            };
        };
        if client.client_secret_expires_at <= Utc::now().timestamp() {
            return Err(OAuthError::invalid_client("client secret has expired"));
        }
        let expected = self.encryption.decrypt_secret(stored).map_err(|e| {
            warn!(client_id, error = %e, "stored client secret does not decrypt");
            OAuthError::invalid_client("invalid client credentials")
        })?;
        if bool::from(expected.reveal().as_bytes().ct_eq(client_secret.as_bytes())) {
            Ok(client)
        } else {
            Err(OAuthError::invalid_client("invalid client credentials"))
        }
    }
}

impl ClientInfo {
    /// Exact-match redirect URI check
    #[must_use]
    pub fn has_redirect_uri(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|u| u == redirect_uri)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::cache::InMemoryCache;

    fn registry() -> ClientRegistry {
        let cache = TypedCache::new(Arc::new(InMemoryCache::new()), "clients", Duration::from_secs(60));
        let key = Encryption::new(&[7u8; 32]).unwrap();
        ClientRegistry::new(cache, key, Duration::from_secs(15 * 24 * 3600))
    }

    fn request(value: serde_json::Value) -> RegistrationRequest {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn registration_applies_defaults() {
        let registry = registry();
        let resp = registry
            .register("https://gw/oauth/acme", request(json!({"redirect_uris": ["https://app/cb"]})))
            .await
            .unwrap();

        assert!(resp.client_id.starts_with("client_"));
        assert_eq!(resp.client_id.len(), "client_".len() + 22);
        assert_eq!(resp.client_secret.as_ref().unwrap().reveal().len(), 43);
        assert_eq!(resp.grant_types, vec![GrantType::AuthorizationCode]);
        assert_eq!(resp.token_endpoint_auth_method, TokenEndpointAuthMethod::ClientSecretPost);
        assert_eq!(resp.application_type, ApplicationType::Web);
        assert_eq!(resp.client_secret_expires_at - resp.client_id_issued_at, 15 * 24 * 3600);

        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["client_secret"], resp.client_secret.as_ref().unwrap().reveal().as_str());

        let stored = registry.get("https://gw/oauth/acme", &resp.client_id).await.unwrap().unwrap();
        assert_ne!(stored.client_secret.as_deref(), Some(resp.client_secret.unwrap().reveal().as_str()));
        assert!(registry.get("https://gw/oauth/other", &resp.client_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn registration_rejects_bad_metadata() {
        let registry = registry();
        let err = registry.register("i", request(json!({}))).await.unwrap_err();
        assert_eq!(err.error, "invalid_client_metadata");
        let err = registry
            .register("i", request(json!({"redirect_uris": ["not a url"]})))
            .await
            .unwrap_err();
        assert!(err.description.contains("not a url"));
        assert!(serde_json::from_value::<RegistrationRequest>(json!({"grant_types": ["implicit"]})).is_err());
    }

    #[tokio::test]
    async fn authentication() {
        let registry = registry();
        let resp = registry
            .register("i", request(json!({"redirect_uris": ["https://app/cb"]})))
            .await
            .unwrap();
        let secret = resp.client_secret.unwrap();
        assert!(registry.authenticate("i", &resp.client_id, secret.reveal()).await.is_ok());
        assert!(registry.authenticate("i", &resp.client_id, "wrong").await.is_err());
        assert!(registry.authenticate("i", "client_nope", secret.reveal()).await.is_err());

        let public = registry
            .register(
                "i",
                request(json!({"redirect_uris": ["https://app/cb"], "token_endpoint_auth_method": "none"})),
            )
            .await
            .unwrap();
        assert!(public.client_secret.is_none());
        assert!(registry.authenticate("i", &public.client_id, "").await.is_ok());
    }
}
