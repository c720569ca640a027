//! Configuration management

use std::{
    collections::{BTreeMap, HashMap},
    env,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::secret::Secret;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Encryption key for data at rest
    pub encryption: EncryptionConfig,
    /// Cache configuration
    pub cache: CacheConfig,
    /// Upstream proxy configuration
    pub proxy: ProxyConfig,
    /// OAuth proxy lifetimes
    pub oauth: OAuthConfig,
    /// Function tool configuration
    pub functions: FunctionsConfig,
    /// Toolsets keyed by MCP slug
    pub toolsets: HashMap<String, ToolsetConfig>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!("Config file not found: {}", p.display())));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // GRAM_GATEWAY_SERVER__PORT=8080 -> server.port
        figment = figment.merge(Env::prefixed("GRAM_GATEWAY_").split("__"));

        let mut config: Self = figment.extract().map_err(|e| Error::Config(e.to_string()))?;
        config.expand_env_vars();
        Ok(config)
    }

    /// Expand `${VAR}` and `${VAR:-default}` in secrets and toolset environments
    fn expand_env_vars(&mut self) {
        for toolset in self.toolsets.values_mut() {
            for value in toolset.environment.values_mut() {
                *value = expand_string(value);
            }
            if let Some(oauth) = toolset.oauth.as_mut() {
                oauth.client_secret = expand_string(&oauth.client_secret);
            }
        }
    }

    /// The toolset served under `mcp_slug`
    #[must_use]
    pub fn toolset(&self, mcp_slug: &str) -> Option<&ToolsetConfig> {
        self.toolsets.get(mcp_slug)
    }
}

fn env_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").expect("static regex"))
}

/// Expand environment variables in a string
fn expand_string(value: &str) -> String {
    env_pattern()
        .replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
}

/// Resolve a key reference: `env:VAR` reads the variable, anything else is
/// the literal value.
///
/// # Errors
///
/// Returns a config error when the value is empty or the variable is unset.
pub fn resolve_key(what: &str, value: Option<&str>) -> Result<Secret<String>> {
    let value = value.filter(|v| !v.is_empty()).ok_or_else(|| Error::Config(format!("{what} is not configured")))?;
    match value.strip_prefix("env:") {
        Some(var) => env::var(var)
            .ok()
            .filter(|v| !v.is_empty())
            .map(Secret::new)
            .ok_or_else(|| Error::Config(format!("{what}: environment variable {var} is not set"))),
        None => Ok(Secret::new(value.to_string())),
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// Externally visible base URL, used as the OAuth issuer
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(10),
            max_body_size: 10 * 1024 * 1024,
            public_url: None,
        }
    }
}

impl ServerConfig {
    /// `public_url` without a trailing slash, else `http://{host}:{port}`
    #[must_use]
    pub fn base_url(&self) -> String {
        self.public_url.as_deref().map_or_else(
            || format!("http://{}:{}", self.host, self.port),
            |u| u.trim_end_matches('/').to_string(),
        )
    }
}

/// Encryption configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Base64 32-byte key, or `env:VAR`
    pub key: Option<String>,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL used when an object does not carry its own
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// How often expired entries are swept
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
    /// Redis URL, or `env:VAR`. Unset keeps the cache in process.
    pub redis_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            reap_interval: Duration::from_secs(60),
            redis_url: None,
        }
    }
}

/// Upstream proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Timeout for one upstream request
    #[serde(with = "humantime_serde")]
    pub upstream_timeout: Duration,
    /// Timeout for client-credentials token requests
    #[serde(with = "humantime_serde")]
    pub client_credentials_timeout: Duration,
    /// Retry policy for idempotent requests
    pub retry: RetryConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(60),
            client_credentials_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries
    pub enabled: bool,
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Initial backoff duration
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

/// OAuth proxy lifetimes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Authorization code lifetime
    #[serde(with = "humantime_serde")]
    pub grant_ttl: Duration,
    /// Access token lifetime before clamping
    #[serde(with = "humantime_serde")]
    pub token_ttl: Duration,
    /// Lifetime of DCR client secrets
    #[serde(with = "humantime_serde")]
    pub client_secret_lifetime: Duration,
    /// Lifetime of external-provider state
    #[serde(with = "humantime_serde")]
    pub state_ttl: Duration,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            grant_ttl: Duration::from_secs(10 * 60),
            token_ttl: Duration::from_secs(30 * 24 * 3600),
            client_secret_lifetime: Duration::from_secs(15 * 24 * 3600),
            state_ttl: Duration::from_secs(10 * 60),
        }
    }
}

/// Function tool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionsConfig {
    /// Key shared with runners (`GRAM_FUNCTION_AUTH_SECRET`), or `env:VAR`
    pub auth_secret: Option<String>,
}

/// One toolset, served under its MCP slug
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsetConfig {
    /// Owning project
    pub project_id: String,
    /// OpenAPI documents to extract at startup
    pub documents: Vec<DocumentConfig>,
    /// Project environment (system env for the credential resolver)
    pub environment: BTreeMap<String, String>,
    /// Function tools
    pub functions: Vec<FunctionToolConfig>,
    /// External OAuth provider; when set, tool calls need an access token
    pub oauth: Option<OAuthProviderConfig>,
}

/// One OpenAPI document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    /// Document slug, the env-var and tool-name prefix
    pub slug: String,
    /// Path to the JSON or YAML file
    pub path: PathBuf,
}

/// One function tool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionToolConfig {
    /// Tool name
    pub name: String,
    /// Description
    pub description: String,
    /// Base URL of the runner
    pub runner_url: String,
    /// Variables passed from the caller's environment
    pub variables: Vec<String>,
    /// Input JSON schema
    pub input_schema: Value,
}

/// External OAuth provider bridged by the proxy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthProviderConfig {
    /// Provider authorize endpoint
    pub authorization_endpoint: String,
    /// Provider token endpoint
    pub token_endpoint: String,
    /// Client id registered with the provider
    pub client_id: String,
    /// Client secret registered with the provider (supports `${VAR}`)
    pub client_secret: String,
    /// Scopes requested from the provider; empty means the client's scope
    pub scopes: Vec<String>,
    /// Security scheme keys the provider token satisfies
    pub security_keys: Vec<String>,
    /// Scopes a client may request; empty means any
    pub allowed_scopes: Vec<String>,
    /// Provider token endpoint auth methods; `client_secret_basic` selects Basic
    pub token_endpoint_auth_methods_supported: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_lifetimes() {
        let config = Config::default();
        assert_eq!(config.oauth.grant_ttl, Duration::from_secs(600));
        assert_eq!(config.oauth.token_ttl, Duration::from_secs(30 * 24 * 3600));
        assert_eq!(config.proxy.client_credentials_timeout, Duration::from_secs(10));
        assert_eq!(config.proxy.retry.max_attempts, 3);
        assert_eq!(config.server.base_url(), "http://127.0.0.1:8080");
        assert!(config.cache.redis_url.is_none());
    }

    #[test]
    fn yaml_toolsets_deserialize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gram.yaml");
        std::fs::write(
            &path,
            r"
server:
  port: 9000
  public_url: https://gram.example.com/
cache:
  redis_url: env:GRAM_REDIS_URL
proxy:
  retry:
    initial_backoff: 250ms
toolsets:
  petstore:
    project_id: proj-1
    documents:
      - slug: pets
        path: pets.yaml
    environment:
      PETS_API_KEY: ${GRAM_CONFIG_TEST_UNSET:-fallback}
    oauth:
      authorization_endpoint: https://idp.example.com/authorize
      token_endpoint: https://idp.example.com/token
      client_id: abc
      security_keys: [oauth]
",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.base_url(), "https://gram.example.com");
        assert_eq!(config.proxy.retry.initial_backoff, Duration::from_millis(250));
        assert_eq!(config.cache.redis_url.as_deref(), Some("env:GRAM_REDIS_URL"));
        let toolset = config.toolset("petstore").unwrap();
        assert_eq!(toolset.documents[0].slug, "pets");
        assert_eq!(toolset.environment["PETS_API_KEY"], "fallback");
        assert_eq!(toolset.oauth.as_ref().unwrap().security_keys, vec!["oauth"]);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/gram.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn key_references() {
        assert_eq!(resolve_key("key", Some("abc")).unwrap().reveal(), "abc");
        assert!(resolve_key("key", None).is_err());
        assert!(resolve_key("key", Some("env:GRAM_CONFIG_TEST_UNSET")).is_err());
    }
}
