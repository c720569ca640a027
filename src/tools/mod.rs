//! Tool definitions and their storage
//!
//! One [`HttpToolDefinition`] is produced per OpenAPI operation and one
//! [`HttpSecurity`] per security scheme of a document. Writes go through a
//! [`ToolTransaction`] so that a deployment's rows land together or not at
//! all.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Error, ErrorKind, Result};

/// Hard upper bound on a tool's path.
pub const MAX_PATH_LEN: usize = 2000;

/// Whether a client should ask the user before calling a tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confirm {
    /// Always ask
    #[default]
    Always,
    /// Never ask
    Never,
    /// Let the client decide
    Auto,
}

impl Confirm {
    /// Parse a vendor extension value
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "always" => Some(Self::Always),
            "never" => Some(Self::Never),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

/// Serialization metadata for one parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSettings {
    /// Location (`path`, `query`, `header`, `cookie`)
    #[serde(rename = "in")]
    pub location: String,
    /// Parameter name
    pub name: String,
    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Required flag
    #[serde(default)]
    pub required: bool,
    /// Deprecated flag
    #[serde(default)]
    pub deprecated: bool,
    /// Empty values allowed
    #[serde(default)]
    pub allow_empty_value: bool,
    /// Serialization style
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    /// Explode flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explode: Option<bool>,
}

/// Response filter flavour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    /// No filtering
    #[default]
    None,
    /// jq expression supplied by the caller
    Jq,
}

/// Response filter attached to a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFilter {
    /// Filter flavour
    #[serde(rename = "type")]
    pub filter_type: FilterType,
    /// Response schema the filter applies to
    pub schema: Value,
    /// Status codes sharing that schema
    pub status_codes: Vec<String>,
    /// Content types sharing that schema
    pub content_types: Vec<String>,
}

/// One security scheme of a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpSecurity {
    /// Row id
    pub id: Uuid,
    /// Scheme key under `components.securitySchemes`
    pub key: String,
    /// Owning project
    pub project_id: String,
    /// Owning deployment
    pub deployment_id: String,
    /// Owning document
    pub openapi_document_id: Uuid,
    /// `apiKey`, `http`, `oauth2`, `openIdConnect`
    #[serde(rename = "type")]
    pub scheme_type: String,
    /// `bearer`, `basic`, ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    /// Header or query name for `apiKey`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// `header` or `query` for `apiKey`
    #[serde(rename = "in", default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<String>,
    /// Environment variables the scheme reads
    pub env_variables: Vec<String>,
    /// Recognised OAuth flows
    #[serde(default)]
    pub oauth_types: Vec<String>,
    /// Raw OAuth flows object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_flows: Option<Value>,
}

/// One operation turned into a callable tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpToolDefinition {
    /// Row id
    pub id: Uuid,
    /// Owning project
    pub project_id: String,
    /// Owning deployment
    pub deployment_id: String,
    /// Source document
    pub openapi_document_id: Uuid,
    /// Tool name, unique per project
    pub name: String,
    /// Name before truncation, when it was truncated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub untruncated_name: Option<String>,
    /// Operation id (or the `{METHOD}_{path}` fallback)
    pub openapi_operation_id: String,
    /// Upper-case HTTP method
    pub http_method: String,
    /// Path template
    pub path: String,
    /// Summary
    #[serde(default)]
    pub summary: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Operation tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Confirmation policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm: Option<Confirm>,
    /// Confirmation prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_prompt: Option<String>,
    /// Pre-override name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    /// Pre-override summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_summary: Option<String>,
    /// Pre-override description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_description: Option<String>,
    /// A vendor extension was present
    #[serde(default)]
    pub x_gram: bool,
    /// Security requirement sets: `[{scheme: [scopes]}]`
    pub security: Value,
    /// Scopes requested per scheme key
    #[serde(default)]
    pub security_scopes: BTreeMap<String, Vec<String>>,
    /// Input JSON schema
    pub schema: Value,
    /// Environment variable overriding the server URL
    pub server_env_var: String,
    /// HTTPS server URL from the document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_server_url: Option<String>,
    /// Header parameter settings
    #[serde(default)]
    pub header_settings: BTreeMap<String, ParameterSettings>,
    /// Query parameter settings
    #[serde(default)]
    pub query_settings: BTreeMap<String, ParameterSettings>,
    /// Path parameter settings
    #[serde(default)]
    pub path_settings: BTreeMap<String, ParameterSettings>,
    /// Chosen request content type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_content_type: Option<String>,
    /// Response filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_filter: Option<ResponseFilter>,
}

impl HttpToolDefinition {
    /// Scheme keys referenced by the requirement sets, in first-seen order.
    #[must_use]
    pub fn security_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for requirement in self.security.as_array().into_iter().flatten() {
            for key in requirement.as_object().into_iter().flat_map(|m| m.keys()) {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
        keys
    }
}

/// A tool backed by user code running in a function runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionToolDefinition {
    /// Row id
    pub id: Uuid,
    /// Owning project
    pub project_id: String,
    /// Tool name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Base URL of the runner serving this function
    pub runner_url: String,
    /// Variables copied from the caller's environment into the child
    #[serde(default)]
    pub variables: Vec<String>,
    /// Input JSON schema
    #[serde(default)]
    pub input_schema: Value,
}

/// Writes for one deployment.
#[async_trait::async_trait]
pub trait ToolTransaction: Send {
    /// Stage a security row
    async fn insert_security(&mut self, security: HttpSecurity) -> Result<()>;

    /// Stage a tool row
    async fn insert_tool(&mut self, tool: HttpToolDefinition) -> Result<()>;

    /// Make every staged row visible
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Storage for tool definitions.
#[async_trait::async_trait]
pub trait ToolRepository: Send + Sync + 'static {
    /// Start a transaction
    async fn begin(&self) -> Result<Box<dyn ToolTransaction>>;

    /// Find an HTTP tool by project and name
    async fn find_tool(&self, project_id: &str, name: &str) -> Result<Option<HttpToolDefinition>>;

    /// All HTTP tools of a project
    async fn list_tools(&self, project_id: &str) -> Result<Vec<HttpToolDefinition>>;

    /// Security rows of a document, restricted to `keys`, in `keys` order
    async fn find_security(&self, document_id: Uuid, keys: &[String]) -> Result<Vec<HttpSecurity>>;
}

#[derive(Default)]
struct Tables {
    tools: Vec<HttpToolDefinition>,
    security: Vec<HttpSecurity>,
}

/// Process-local repository.
#[derive(Default, Clone)]
pub struct InMemoryToolRepository {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryToolRepository {
    /// Create an empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed tool rows
    #[must_use]
    pub fn tool_count(&self) -> usize {
        self.tables.read().tools.len()
    }
}

struct InMemoryTransaction {
    tables: Arc<RwLock<Tables>>,
    tools: Vec<HttpToolDefinition>,
    security: Vec<HttpSecurity>,
}

fn check_tool(tool: &HttpToolDefinition) -> Result<()> {
    if tool.path.len() > MAX_PATH_LEN {
        return Err(Error::new(
            ErrorKind::InvariantViolated,
            format!("tool path exceeds {MAX_PATH_LEN} characters"),
        ));
    }
    Ok(())
}

#[async_trait::async_trait]
impl ToolTransaction for InMemoryTransaction {
    async fn insert_security(&mut self, security: HttpSecurity) -> Result<()> {
        self.security.push(security);
        Ok(())
    }

    async fn insert_tool(&mut self, tool: HttpToolDefinition) -> Result<()> {
        check_tool(&tool)?;
        let clash = |t: &HttpToolDefinition| t.project_id == tool.project_id && t.name == tool.name;
        if self.tools.iter().any(clash) || self.tables.read().tools.iter().any(clash) {
            return Err(Error::new(
                ErrorKind::Conflict,
                format!("tool {} already exists in project", tool.name),
            ));
        }
        self.tools.push(tool);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut tables = self.tables.write();
        tables.tools.extend(self.tools);
        tables.security.extend(self.security);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ToolRepository for InMemoryToolRepository {
    async fn begin(&self) -> Result<Box<dyn ToolTransaction>> {
        Ok(Box::new(InMemoryTransaction {
            tables: Arc::clone(&self.tables),
            tools: Vec::new(),
            security: Vec::new(),
        }))
    }

    async fn find_tool(&self, project_id: &str, name: &str) -> Result<Option<HttpToolDefinition>> {
        Ok(self
            .tables
            .read()
            .tools
            .iter()
            .find(|t| t.project_id == project_id && t.name == name)
            .cloned())
    }

    async fn list_tools(&self, project_id: &str) -> Result<Vec<HttpToolDefinition>> {
        Ok(self
            .tables
            .read()
            .tools
            .iter()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn find_security(&self, document_id: Uuid, keys: &[String]) -> Result<Vec<HttpSecurity>> {
        let tables = self.tables.read();
        Ok(keys
            .iter()
            .filter_map(|key| {
                tables
                    .security
                    .iter()
                    .find(|s| s.openapi_document_id == document_id && &s.key == key)
                    .cloned()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn tool(name: &str, path: &str) -> HttpToolDefinition {
        HttpToolDefinition {
            id: Uuid::new_v4(),
            project_id: "p1".into(),
            name: name.into(),
            path: path.into(),
            http_method: "GET".into(),
            security: json!([]),
            schema: json!({"type": "object"}),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn rows_are_invisible_until_commit() {
        let repo = InMemoryToolRepository::new();
        let mut tx = repo.begin().await.unwrap();
        tx.insert_tool(tool("a", "/a")).await.unwrap();
        assert_eq!(repo.tool_count(), 0);
        tx.commit().await.unwrap();
        assert!(repo.find_tool("p1", "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dropped_transaction_discards_rows() {
        let repo = InMemoryToolRepository::new();
        let mut tx = repo.begin().await.unwrap();
        tx.insert_tool(tool("a", "/a")).await.unwrap();
        drop(tx);
        assert_eq!(repo.tool_count(), 0);
    }

    #[tokio::test]
    async fn long_paths_and_duplicates_are_rejected() {
        let repo = InMemoryToolRepository::new();
        let mut tx = repo.begin().await.unwrap();
        let err = tx
            .insert_tool(tool("long", &"/x".repeat(1001)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvariantViolated);

        tx.insert_tool(tool("dup", "/a")).await.unwrap();
        let err = tx.insert_tool(tool("dup", "/b")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn security_keys_are_flattened_in_order() {
        let mut t = tool("a", "/a");
        t.security = json!([{"oauth": ["read"]}, {"apiKey": [], "oauth": []}, {}]);
        assert_eq!(t.security_keys(), vec!["oauth".to_string(), "apiKey".to_string()]);
    }

    #[tokio::test]
    async fn security_lookup_follows_key_order() {
        let repo = InMemoryToolRepository::new();
        let doc = Uuid::new_v4();
        let mut tx = repo.begin().await.unwrap();
        for key in ["a", "b"] {
            tx.insert_security(HttpSecurity {
                key: key.into(),
                openapi_document_id: doc,
                scheme_type: "apiKey".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();

        let found = repo
            .find_security(doc, &["b".to_string(), "missing".to_string(), "a".to_string()])
            .await
            .unwrap();
        let keys: Vec<_> = found.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }
}
