//! Security scheme synthesis
//!
//! Turns `components.securitySchemes` into [`HttpSecurity`] rows and decides
//! which environment variables each scheme reads at call time.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::naming::env_var;
use crate::tools::HttpSecurity;

/// Identity shared by every row of one document.
#[derive(Debug, Clone, Default)]
pub struct DocumentScope {
    /// Owning project
    pub project_id: String,
    /// Owning deployment
    pub deployment_id: String,
    /// Source document
    pub document_id: Uuid,
    /// Document slug, used as the env-var prefix
    pub slug: String,
}

/// Build one row per supported scheme. Unsupported schemes are reported and
/// skipped.
pub fn extract_security_schemes(doc: &Value, scope: &DocumentScope) -> (Vec<HttpSecurity>, Vec<String>) {
    let mut rows = Vec::new();
    let mut errors = Vec::new();

    let Some(schemes) = doc
        .pointer("/components/securitySchemes")
        .and_then(Value::as_object)
    else {
        return (rows, errors);
    };

    for (key, scheme) in schemes {
        match synthesize(key, scheme, scope) {
            Ok(row) => rows.push(row),
            Err(reason) => errors.push(format!("{key}: {reason}")),
        }
    }
    (rows, errors)
}

fn str_field(obj: &Map<String, Value>, name: &str) -> Option<String> {
    obj.get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn synthesize(key: &str, scheme: &Value, scope: &DocumentScope) -> Result<HttpSecurity, String> {
    let obj = scheme
        .as_object()
        .ok_or_else(|| "security scheme is not an object".to_string())?;
    if obj.contains_key("$ref") {
        return Err("referenced security schemes are not supported".into());
    }

    let slug = scope.slug.as_str();
    let scheme_type = str_field(obj, "type").unwrap_or_default();
    let http_scheme = str_field(obj, "scheme").map(|s| s.to_ascii_lowercase());
    let mut env_variables = Vec::new();
    let mut oauth_types = Vec::new();
    let mut oauth_flows = None;

    match scheme_type.as_str() {
        "apiKey" => env_variables.push(env_var(&[slug, key])),
        "http" => match http_scheme.as_deref() {
            Some("bearer") => env_variables.push(env_var(&[slug, key])),
            Some("basic") => {
                env_variables.push(env_var(&[slug, key, "USERNAME"]));
                env_variables.push(env_var(&[slug, key, "PASSWORD"]));
            }
            other => {
                return Err(format!("unsupported http security scheme: {}", other.unwrap_or("")));
            }
        },
        "openIdConnect" => env_variables.push(env_var(&[slug, key, "ACCESS_TOKEN"])),
        "oauth2" => {
            let flows = obj.get("flows").and_then(Value::as_object);
            let has = |flow: &str| flows.is_some_and(|f| f.contains_key(flow));

            if has("authorizationCode") || has("clientCredentials") || has("implicit") {
                env_variables.push(env_var(&[slug, key, "ACCESS_TOKEN"]));
            }
            if has("clientCredentials") {
                oauth_types.push("client_credentials".to_string());
                env_variables.push(env_var(&[slug, key, "CLIENT_SECRET"]));
                env_variables.push(env_var(&[slug, key, "CLIENT_ID"]));
                env_variables.push(env_var(&[slug, key, "TOKEN_URL"]));
            }
            if has("implicit") {
                oauth_types.push("implicit".to_string());
            }
            if has("authorizationCode") {
                oauth_types.push("authorization_code".to_string());
            }
            if oauth_types.is_empty() {
                return Err("unsupported oauth2 security scheme: no supported flows found".into());
            }
            oauth_flows = flows.map(|f| Value::Object(f.clone()));
        }
        other => return Err(format!("unsupported security scheme type: {other}")),
    }

    Ok(HttpSecurity {
        id: Uuid::new_v4(),
        key: key.to_string(),
        project_id: scope.project_id.clone(),
        deployment_id: scope.deployment_id.clone(),
        openapi_document_id: scope.document_id,
        scheme_type,
        scheme: http_scheme,
        name: str_field(obj, "name"),
        placement: str_field(obj, "in"),
        env_variables,
        oauth_types,
        oauth_flows,
    })
}

/// Normalise a requirement list: each set becomes an object of
/// `scheme -> scopes`, an empty set becomes `{}`.
#[must_use]
pub fn serialize_security(requirements: &[Value]) -> (Value, BTreeMap<String, Vec<String>>) {
    let mut scopes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let sets: Vec<Value> = requirements
        .iter()
        .map(|set| {
            let mut out = Map::new();
            for (key, value) in set.as_object().into_iter().flatten() {
                let requested: Vec<String> = value
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect();
                let entry = scopes.entry(key.clone()).or_default();
                for scope in &requested {
                    if !entry.contains(scope) {
                        entry.push(scope.clone());
                    }
                }
                out.insert(key.clone(), json!(requested));
            }
            Value::Object(out)
        })
        .collect();
    (Value::Array(sets), scopes)
}

/// Operation security when it lists requirements, else the document's.
#[must_use]
pub fn effective_security<'a>(operation: &'a Value, doc: &'a Value) -> &'a [Value] {
    let declared = |v: &'a Value| v.get("security").and_then(Value::as_array);
    match declared(operation) {
        Some(list) if !list.is_empty() => list.as_slice(),
        _ => declared(doc).map_or(&[][..], Vec::as_slice),
    }
}
