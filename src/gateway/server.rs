//! Gateway server

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::proxy::{RetryPolicy, ToolProxy};
use super::router::{AppState, create_router};
use super::security::CredentialResolver;
use crate::cache::{CacheBackend, InMemoryCache, RedisCache, TypedCache};
use crate::config::{Config, resolve_key};
use crate::encryption::Encryption;
use crate::oauth::OAuthService;
use crate::openapi::extract::{ExtractTask, ToolExtractor};
use crate::openapi::security::DocumentScope;
use crate::tools::{FunctionToolDefinition, InMemoryToolRepository, ToolRepository};
use crate::{Error, Result};

/// Gram gateway server
pub struct Gateway {
    /// Configuration
    config: Arc<Config>,
    /// Shared handler state
    state: Arc<AppState>,
    /// Sweeps expired entries of the in-process cache
    reaper: Option<JoinHandle<()>>,
}

impl Gateway {
    /// Create a new gateway: extract every configured document and wire
    /// the proxy, credential resolver and OAuth proxy.
    ///
    /// # Errors
    ///
    /// Fails on an invalid encryption key or a document that cannot be read
    /// or extracted.
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let (backend, reaper) = cache_backend(&config).await?;

        let encryption = match config.encryption.key.as_deref() {
            Some(key) => Encryption::from_base64(&resolve_key("encryption.key", Some(key))?)?,
            None => {
                warn!("No encryption key configured, using an ephemeral key; OAuth state will not survive restarts");
                Encryption::from_base64(&Encryption::generate_key().into())?
            }
        };

        let http = reqwest::Client::builder()
            .user_agent(concat!("gram-gateway/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let repository: Arc<dyn ToolRepository> = Arc::new(InMemoryToolRepository::new());
        load_documents(&config, &repository).await?;

        let resolver = CredentialResolver::new(
            http.clone(),
            TypedCache::new(Arc::clone(&backend), "client_credentials", config.cache.default_ttl)
                .with_encryption(encryption.clone()),
            config.proxy.client_credentials_timeout,
        );
        let mut proxy = ToolProxy::new(
            http.clone(),
            resolver,
            Arc::clone(&repository),
            RetryPolicy::new(&config.proxy.retry),
            config.proxy.upstream_timeout,
        );

        let functions = function_tools(&config);
        if let Some(secret) = config.functions.auth_secret.as_deref() {
            let key = resolve_key("functions.auth_secret", Some(secret))?;
            proxy = proxy.with_function_auth(Encryption::from_base64(&key)?);
        } else if functions.values().any(|f| !f.is_empty()) {
            warn!("Function tools are configured but functions.auth_secret is not; calls will fail");
        }

        let oauth = config
            .toolsets
            .values()
            .any(|t| t.oauth.is_some())
            .then(|| Arc::new(OAuthService::new(&config, &backend, &encryption, http)));

        let state = Arc::new(AppState {
            config: Arc::clone(&config),
            repository,
            proxy,
            oauth,
            functions,
        });

        Ok(Self { config, state, reaper })
    }

    /// The HTTP application
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }

    /// Run the gateway until a shutdown signal arrives
    ///
    /// # Errors
    ///
    /// Fails when the address is invalid or cannot be bound.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("GRAM GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!("Toolsets:");
        let base = self.config.server.base_url();
        for (slug, toolset) in &self.config.toolsets {
            let auth = if toolset.oauth.is_some() { "oauth" } else { "open" };
            let tools = self
                .state
                .repository
                .list_tools(&toolset.project_id)
                .await
                .map_or(0, |t| t.len());
            info!("  {base}/mcp/{slug}/tools  ({auth}, {tools} http tools)");
        }
        if self.state.oauth.is_some() {
            info!("OAUTH proxy enabled, issuers at {base}/oauth/{{mcp}}");
        }
        info!("============================================================");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()));

        if let Some(reaper) = self.reaper {
            reaper.abort();
        }
        info!("Gateway stopped");
        result
    }
}

/// Redis when `cache.redis_url` is set, otherwise an in-process cache with
/// its reaper.
async fn cache_backend(config: &Config) -> Result<(Arc<dyn CacheBackend>, Option<JoinHandle<()>>)> {
    if let Some(url) = config.cache.redis_url.as_deref() {
        let url = resolve_key("cache.redis_url", Some(url))?;
        let redis = RedisCache::connect(url.reveal()).await?;
        info!("Using redis cache backend");
        let backend: Arc<dyn CacheBackend> = Arc::new(redis);
        return Ok((backend, None));
    }
    let cache = Arc::new(InMemoryCache::new());
    let reaper = cache.spawn_reaper(config.cache.reap_interval);
    let backend: Arc<dyn CacheBackend> = cache;
    Ok((backend, Some(reaper)))
}

/// Extract every configured OpenAPI document into `repository`.
async fn load_documents(config: &Config, repository: &Arc<dyn ToolRepository>) -> Result<()> {
    let extractor = ToolExtractor::new(Arc::clone(repository));
    let deployment_id = Uuid::new_v4().to_string();

    for (slug, toolset) in &config.toolsets {
        for doc in &toolset.documents {
            let content = tokio::fs::read(&doc.path).await.map_err(|e| {
                Error::Config(format!("toolset {slug}: cannot read {}: {e}", doc.path.display()))
            })?;
            let task = ExtractTask {
                scope: DocumentScope {
                    project_id: toolset.project_id.clone(),
                    deployment_id: deployment_id.clone(),
                    document_id: Uuid::new_v4(),
                    slug: doc.slug.clone(),
                },
                name: doc.path.display().to_string(),
                content,
            };
            let outcome = extractor.process(&task).await?;
            info!(
                toolset = %slug,
                document = %doc.slug,
                tools = outcome.tools.len(),
                security = outcome.security.len(),
                events = outcome.events.len(),
                "Loaded OpenAPI document"
            );
        }
    }
    Ok(())
}

/// Function tools of every toolset, keyed by MCP slug.
fn function_tools(config: &Config) -> HashMap<String, Vec<FunctionToolDefinition>> {
    config
        .toolsets
        .iter()
        .map(|(slug, toolset)| {
            let tools = toolset
                .functions
                .iter()
                .map(|f| FunctionToolDefinition {
                    id: Uuid::new_v4(),
                    project_id: toolset.project_id.clone(),
                    name: f.name.clone(),
                    description: f.description.clone(),
                    runner_url: f.runner_url.clone(),
                    variables: f.variables.clone(),
                    input_schema: f.input_schema.clone(),
                })
                .collect();
            (slug.clone(), tools)
        })
        .collect()
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
