//! One-shot state for the external provider round trip

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::grants::AuthorizationRequest;
use crate::Result;
use crate::cache::{Cacheable, TypedCache};

/// Length of the cache key taken from the verifier.
const STATE_KEY_LEN: usize = 16;

/// What the gateway needs back when the provider redirects to the callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalOAuthState {
    /// Cache key, the verifier prefix
    pub key: String,
    /// Issuer the flow belongs to
    pub issuer: String,
    /// MCP slug of the toolset
    pub mcp_slug: String,
    /// The client's original request
    pub request: AuthorizationRequest,
    /// PKCE verifier for the provider exchange
    pub code_verifier: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Cacheable for ExternalOAuthState {
    fn cache_key(&self) -> String {
        format!("oauth_state:{}", self.key)
    }
}

/// Cache key for a verifier
#[must_use]
pub fn state_key(verifier: &str) -> String {
    verifier.chars().take(STATE_KEY_LEN).collect()
}

/// Encrypted, TTL-bounded store of external flow state.
#[derive(Clone)]
pub struct StateStore {
    cache: TypedCache<ExternalOAuthState>,
}

impl StateStore {
    /// Wrap a cache; its default TTL is the state lifetime
    #[must_use]
    pub fn new(cache: TypedCache<ExternalOAuthState>) -> Self {
        Self { cache }
    }

    /// Store a new state entry
    ///
    /// # Errors
    ///
    /// Propagates storage errors.
    pub async fn put(&self, state: &ExternalOAuthState) -> Result<()> {
        self.cache.store(state).await
    }

    /// Remove and return a state entry
    ///
    /// # Errors
    ///
    /// Propagates storage errors.
    pub async fn take(&self, key: &str) -> Result<Option<ExternalOAuthState>> {
        self.cache.take(&format!("oauth_state:{key}")).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::cache::InMemoryCache;
    use crate::encryption::Encryption;

    #[tokio::test]
    async fn state_is_single_use() {
        let cache = TypedCache::new(Arc::new(InMemoryCache::new()), "state", Duration::from_secs(600))
            .with_encryption(Encryption::new(&[1u8; 32]).unwrap());
        let store = StateStore::new(cache);
        let verifier = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG";
        let state = ExternalOAuthState {
            key: state_key(verifier),
            issuer: "https://gw/oauth/acme".into(),
            mcp_slug: "acme".into(),
            request: AuthorizationRequest::default(),
            code_verifier: verifier.into(),
            created_at: Utc::now(),
        };
        assert_eq!(state.key, "abcdefghijklmnop");
        store.put(&state).await.unwrap();

        let taken = store.take("abcdefghijklmnop").await.unwrap().unwrap();
        assert_eq!(taken.code_verifier, verifier);
        assert!(store.take("abcdefghijklmnop").await.unwrap().is_none());
    }
}
