//! OAuth Authorization Server Metadata (RFC 8414)

use serde::{Deserialize, Serialize};

/// Authorization server metadata served for each MCP slug
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// Issuer URL
    pub issuer: String,

    /// Authorization endpoint URL
    pub authorization_endpoint: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// Dynamic client registration endpoint
    pub registration_endpoint: String,

    /// Supported response types
    pub response_types_supported: Vec<String>,

    /// Supported grant types
    pub grant_types_supported: Vec<String>,

    /// Supported token endpoint auth methods
    pub token_endpoint_auth_methods_supported: Vec<String>,

    /// Supported PKCE code challenge methods
    pub code_challenge_methods_supported: Vec<String>,

    /// Supported scopes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,
}

impl AuthorizationServerMetadata {
    /// Metadata for an issuer of the form `{base}/oauth/{mcp}`
    #[must_use]
    pub fn for_issuer(issuer: &str, scopes_supported: &[String]) -> Self {
        let owned = |v: &[&str]| v.iter().map(ToString::to_string).collect();
        Self {
            issuer: issuer.to_string(),
            authorization_endpoint: format!("{issuer}/authorize"),
            token_endpoint: format!("{issuer}/token"),
            registration_endpoint: format!("{issuer}/register"),
            response_types_supported: owned(&["code"]),
            grant_types_supported: owned(&["authorization_code"]),
            token_endpoint_auth_methods_supported: owned(&["client_secret_post", "client_secret_basic", "none"]),
            code_challenge_methods_supported: owned(&["plain", "S256"]),
            scopes_supported: scopes_supported.to_vec(),
        }
    }
}

/// Issuer URL for an MCP slug
#[must_use]
pub fn issuer_url(base_url: &str, mcp_slug: &str) -> String {
    format!("{}/oauth/{mcp_slug}", base_url.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issuer_strips_trailing_slash() {
        assert_eq!(issuer_url("https://gw.example.com/", "acme"), "https://gw.example.com/oauth/acme");
    }

    #[test]
    fn endpoints_hang_off_issuer() {
        let meta = AuthorizationServerMetadata::for_issuer("https://gw/oauth/acme", &[]);
        assert_eq!(meta.authorization_endpoint, "https://gw/oauth/acme/authorize");
        assert_eq!(meta.token_endpoint, "https://gw/oauth/acme/token");
        assert_eq!(meta.registration_endpoint, "https://gw/oauth/acme/register");
        assert_eq!(meta.code_challenge_methods_supported, vec!["plain", "S256"]);

        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("scopes_supported").is_none());
        assert_eq!(json["grant_types_supported"][0], "authorization_code");
    }
}
