//! HTTP router and handlers

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, info};

use super::auth::{CallerAuth, auth_middleware};
use super::proxy::{HttpToolCall, ToolCallBody, ToolProxy};
use crate::config::Config;
use crate::oauth::OAuthService;
use crate::tools::{FunctionToolDefinition, ToolRepository};
use crate::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Configuration, including the toolsets
    pub config: Arc<Config>,
    /// Extracted HTTP tools
    pub repository: Arc<dyn ToolRepository>,
    /// Upstream proxy
    pub proxy: ToolProxy,
    /// OAuth proxy, when any toolset has a provider
    pub oauth: Option<Arc<OAuthService>>,
    /// Function tools keyed by MCP slug
    pub functions: HashMap<String, Vec<FunctionToolDefinition>>,
}

impl AppState {
    fn function(&self, mcp_slug: &str, name: &str) -> Option<&FunctionToolDefinition> {
        self.functions.get(mcp_slug)?.iter().find(|f| f.name == name)
    }
}

/// Input of a function tool call
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct FunctionCallBody {
    input: Value,
    environment_variables: BTreeMap<String, String>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let max_body = state.config.server.max_body_size;
    let oauth = state.oauth.clone();

    let tools = Router::new()
        .route("/mcp/{mcp_slug}/tools", get(list_tools))
        .route("/mcp/{mcp_slug}/tools/{tool}", post(call_tool))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), auth_middleware));

    let mut app = Router::new()
        .route("/health", get(health_handler))
        .merge(tools)
        .with_state(state);
    if let Some(oauth) = oauth {
        app = app.merge(crate::oauth::router(oauth));
    }

    app.layer(DefaultBodyLimit::max(max_body))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// GET /health
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /mcp/{mcp_slug}/tools
async fn list_tools(State(state): State<Arc<AppState>>, Path(mcp): Path<String>) -> Result<Json<Value>> {
    let toolset = state
        .config
        .toolset(&mcp)
        .ok_or_else(|| Error::not_found(format!("toolset {mcp} not found")))?;

    let mut tools: Vec<Value> = state
        .repository
        .list_tools(&toolset.project_id)
        .await?
        .into_iter()
        .map(|t| {
            json!({
                "name": t.name,
                "kind": "http",
                "description": t.description,
                "method": t.http_method,
                "path": t.path,
                "inputSchema": t.schema,
                "confirm": t.confirm,
            })
        })
        .collect();
    for f in state.functions.get(&mcp).into_iter().flatten() {
        tools.push(json!({
            "name": f.name,
            "kind": "function",
            "description": f.description,
            "inputSchema": f.input_schema,
        }));
    }

    debug!(mcp = %mcp, count = tools.len(), "listed tools");
    Ok(Json(json!({ "tools": tools })))
}

/// POST /mcp/{mcp_slug}/tools/{tool}
async fn call_tool(
    State(state): State<Arc<AppState>>,
    Path((mcp, name)): Path<(String, String)>,
    Extension(auth): Extension<CallerAuth>,
    body: Bytes,
) -> Result<Response> {
    let toolset = state
        .config
        .toolset(&mcp)
        .ok_or_else(|| Error::not_found(format!("toolset {mcp} not found")))?;

    if let Some(tool) = state.repository.find_tool(&toolset.project_id, &name).await? {
        let call: ToolCallBody = decode(&body)?;
        info!(mcp = %mcp, tool = %name, method = %tool.http_method, "calling http tool");
        return state
            .proxy
            .call_http(HttpToolCall {
                project_id: &toolset.project_id,
                tool: &tool,
                body: call,
                system_env: &toolset.environment,
                oauth_tokens: auth.oauth_tokens,
            })
            .await;
    }

    if let Some(function) = state.function(&mcp, &name) {
        let call: FunctionCallBody = decode(&body)?;
        info!(mcp = %mcp, tool = %name, "calling function tool");
        return state
            .proxy
            .call_function(function, &call.input, &toolset.environment, &call.environment_variables)
            .await;
    }

    Err(Error::not_found(format!("tool {name} not found")))
}

fn decode<T: for<'de> Deserialize<'de> + Default>(body: &[u8]) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| Error::bad_request(format!("decode tool call request: {e}")))
}
