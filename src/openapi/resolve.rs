//! Local `$ref` inlining
//!
//! References are resolved against the document root as JSON pointers.
//! Anything that does not start with `#` is rejected. A stack of refs that
//! are currently being expanded detects cycles. Each ref is expanded once
//! and reused, and the size of one expanded schema is capped.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

const SCHEMA_PREFIX: &str = "#/components/schemas/";

/// Keys whose values are literal data, never schemas.
const LITERAL_KEYS: [&str; 5] = ["const", "default", "enum", "example", "examples"];

const MAX_DEPTH: usize = 64;

/// Upper bound on nodes produced by one [`Resolver::resolve`] call.
pub const MAX_NODES: usize = 100_000;

/// Reference resolution failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// Ref points outside the document
    #[error("external references are not supported: {0}")]
    External(String),
    /// Ref re-enters itself
    #[error("circular reference detected: {0}")]
    Circular(String),
    /// Pointer does not resolve
    #[error("reference not found: {0}")]
    Missing(String),
    /// Expansion is nested too deeply
    #[error("schema nesting exceeds {MAX_DEPTH} levels")]
    TooDeep,
    /// Expansion produces too many nodes
    #[error("expanded schema exceeds {MAX_NODES} nodes")]
    TooLarge,
}

impl ResolveError {
    /// Event tag for the deployment log
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Circular(_) => "circular-ref",
            Self::External(_) => "external-ref",
            Self::Missing(_) => "missing-ref",
            Self::TooDeep => "too-deep",
            Self::TooLarge => "schema-too-large",
        }
    }
}

/// A ref expanded once, reused at every later site.
struct Expanded {
    value: Value,
    nodes: usize,
    height: usize,
    defs: BTreeMap<String, String>,
}

/// Inlines refs against one document, collecting the component schemas
/// seen along the way.
pub struct Resolver<'a> {
    root: &'a Value,
    stack: Vec<String>,
    defs: BTreeMap<String, String>,
    expanded: HashMap<String, Expanded>,
    nodes: usize,
}

impl<'a> Resolver<'a> {
    /// Create a resolver for `root`
    #[must_use]
    pub fn new(root: &'a Value) -> Self {
        Self {
            root,
            stack: Vec::new(),
            defs: BTreeMap::new(),
            expanded: HashMap::new(),
            nodes: 0,
        }
    }

    /// Return a copy of `value` with every local `$ref` inlined.
    pub fn resolve(&mut self, value: &Value) -> Result<Value, ResolveError> {
        self.stack.clear();
        self.nodes = 0;
        let resolved = self.walk(value, 0)?;
        if contains_ref(&resolved) {
            return Err(ResolveError::Circular("unresolved $ref after inlining".into()));
        }
        Ok(resolved)
    }

    /// Component schemas seen so far, as `name -> content hash`.
    pub fn take_defs(&mut self) -> BTreeMap<String, String> {
        std::mem::take(&mut self.defs)
    }

    fn charge(&mut self, nodes: usize) -> Result<(), ResolveError> {
        self.nodes = self.nodes.saturating_add(nodes);
        if self.nodes > MAX_NODES {
            return Err(ResolveError::TooLarge);
        }
        Ok(())
    }

    fn walk(&mut self, value: &Value, depth: usize) -> Result<Value, ResolveError> {
        if depth > MAX_DEPTH {
            return Err(ResolveError::TooDeep);
        }
        self.charge(1)?;
        match value {
            Value::Object(obj) => match obj.get("$ref").and_then(Value::as_str) {
                Some(reference) => self.inline(reference, obj, depth),
                None => {
                    let mut out = Map::with_capacity(obj.len());
                    for (key, child) in obj {
                        let child = if LITERAL_KEYS.contains(&key.as_str()) {
                            child.clone()
                        } else {
                            self.walk(child, depth + 1)?
                        };
                        out.insert(key.clone(), child);
                    }
                    Ok(Value::Object(out))
                }
            },
            Value::Array(items) => items
                .iter()
                .map(|item| self.walk(item, depth + 1))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }

    fn inline(&mut self, reference: &str, holder: &Map<String, Value>, depth: usize) -> Result<Value, ResolveError> {
        let Some(pointer) = reference.strip_prefix('#') else {
            return Err(ResolveError::External(reference.to_string()));
        };
        if self.stack.iter().any(|r| r == reference) {
            return Err(ResolveError::Circular(reference.to_string()));
        }
        let cached = self.expanded.get(reference).map(|hit| (hit.nodes, hit.height));
        let mut resolved = match cached {
            Some((nodes, height)) => {
                if depth + 1 + height > MAX_DEPTH {
                    return Err(ResolveError::TooDeep);
                }
                self.charge(nodes)?;
                let hit = &self.expanded[reference];
                self.defs
                    .extend(hit.defs.iter().map(|(name, hash)| (name.clone(), hash.clone())));
                hit.value.clone()
            }
            None => self.expand(reference, pointer, depth)?,
        };

        // Siblings next to `$ref` are allowed in 3.1 and override the target.
        if holder.len() > 1
            && let Value::Object(out) = &mut resolved
        {
            for (key, sibling) in holder.iter().filter(|(k, _)| k.as_str() != "$ref") {
                let sibling = self.walk(sibling, depth + 1)?;
                out.insert(key.clone(), sibling);
            }
        }
        Ok(resolved)
    }

    /// Expand `reference` for the first time and remember the result.
    fn expand(&mut self, reference: &str, pointer: &str, depth: usize) -> Result<Value, ResolveError> {
        let root: &'a Value = self.root;
        let target = root
            .pointer(pointer)
            .ok_or_else(|| ResolveError::Missing(reference.to_string()))?;

        let outer_defs = std::mem::take(&mut self.defs);
        if let Some(name) = reference.strip_prefix(SCHEMA_PREFIX) {
            self.defs.insert(name.to_string(), content_hash(target));
        }

        let nodes_before = self.nodes;
        self.stack.push(reference.to_string());
        let resolved = self.walk(target, depth + 1);
        self.stack.pop();
        let defs = std::mem::replace(&mut self.defs, outer_defs);
        let resolved = resolved?;

        self.defs.extend(defs.clone());
        self.expanded.insert(
            reference.to_string(),
            Expanded {
                value: resolved.clone(),
                nodes: self.nodes - nodes_before,
                height: height(&resolved),
                defs,
            },
        );
        Ok(resolved)
    }
}

fn height(value: &Value) -> usize {
    match value {
        Value::Object(obj) => 1 + obj.values().map(height).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(height).max().unwrap_or(0),
        _ => 0,
    }
}

fn content_hash(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// `true` when the rendered value still contains a `"$ref":` key.
#[must_use]
pub fn contains_ref(value: &Value) -> bool {
    serde_json::to_string(value).is_ok_and(|s| s.contains("\"$ref\":"))
}

/// Merge per-operation defs into a document-wide pool. Returns one warning
/// per name whose content differs from what the pool already holds.
pub fn merge_defs(pool: &mut BTreeMap<String, String>, defs: BTreeMap<String, String>) -> Vec<String> {
    let mut warnings = Vec::new();
    for (name, hash) in defs {
        match pool.get(&name) {
            Some(existing) if *existing != hash => {
                warnings.push(format!("hash mismatch for definition {name}"));
            }
            Some(_) => {}
            None => {
                pool.insert(name, hash);
            }
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn doc() -> Value {
        json!({
            "components": {
                "schemas": {
                    "Pet": {"type": "object", "properties": {"tag": {"$ref": "#/components/schemas/Tag"}}},
                    "Tag": {"type": "string", "enum": ["a", "b"]},
                    "Node": {"type": "object", "properties": {"next": {"$ref": "#/components/schemas/Node"}}},
                    "a/b": {"type": "integer"}
                },
                "parameters": {"Limit": {"name": "limit", "in": "query", "schema": {"type": "integer"}}}
            }
        })
    }

    #[test]
    fn inlines_nested_refs() {
        let root = doc();
        let mut resolver = Resolver::new(&root);
        let out = resolver.resolve(&json!({"$ref": "#/components/schemas/Pet"})).unwrap();
        assert_eq!(out["properties"]["tag"], json!({"type": "string", "enum": ["a", "b"]}));
        let defs = resolver.take_defs();
        assert_eq!(defs.keys().collect::<Vec<_>>(), vec!["Pet", "Tag"]);
    }

    #[test]
    fn escaped_pointer_segments() {
        let root = doc();
        let out = Resolver::new(&root)
            .resolve(&json!({"$ref": "#/components/schemas/a~1b"}))
            .unwrap();
        assert_eq!(out, json!({"type": "integer"}));
    }

    #[test]
    fn siblings_override_target() {
        let root = doc();
        let out = Resolver::new(&root)
            .resolve(&json!({"$ref": "#/components/schemas/Tag", "description": "pet tag"}))
            .unwrap();
        assert_eq!(out["description"], "pet tag");
        assert_eq!(out["type"], "string");
    }

    #[test]
    fn cycles_are_circular_ref() {
        let root = doc();
        let err = Resolver::new(&root)
            .resolve(&json!({"$ref": "#/components/schemas/Node"}))
            .unwrap_err();
        assert_eq!(err.tag(), "circular-ref");
    }

    #[test]
    fn external_and_missing_refs_fail() {
        let root = doc();
        let mut resolver = Resolver::new(&root);
        let err = resolver.resolve(&json!({"$ref": "other.yaml#/Pet"})).unwrap_err();
        assert!(matches!(err, ResolveError::External(_)));
        let err = resolver.resolve(&json!({"$ref": "#/components/schemas/Nope"})).unwrap_err();
        assert!(matches!(err, ResolveError::Missing(_)));
    }

    #[test]
    fn literal_ref_text_trips_sentinel() {
        let root = doc();
        let input = json!({"type": "object", "default": {"$ref": "kept-as-data"}});
        let out = Resolver::new(&root).resolve(&input);
        // the literal still renders a "$ref": key, so the sentinel trips
        assert!(matches!(out, Err(ResolveError::Circular(_))));
    }

    /// `S0..S{n}`, each with two properties pointing at the next schema
    fn fan_out(n: usize) -> Value {
        let mut schemas = Map::new();
        for i in 0..n {
            let next = json!({"$ref": format!("#/components/schemas/S{}", i + 1)});
            schemas.insert(
                format!("S{i}"),
                json!({"type": "object", "properties": {"left": next.clone(), "right": next}}),
            );
        }
        schemas.insert(format!("S{n}"), json!({"type": "string"}));
        json!({"components": {"schemas": schemas}})
    }

    #[test]
    fn fan_out_expansion_is_capped() {
        let root = fan_out(18);
        let started = std::time::Instant::now();
        let err = Resolver::new(&root)
            .resolve(&json!({"$ref": "#/components/schemas/S0"}))
            .unwrap_err();
        assert_eq!(err, ResolveError::TooLarge);
        assert_eq!(err.tag(), "schema-too-large");
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[test]
    fn small_fan_out_still_resolves() {
        let root = fan_out(4);
        let out = Resolver::new(&root)
            .resolve(&json!({"$ref": "#/components/schemas/S0"}))
            .unwrap();
        let leaf = &out["properties"]["right"]["properties"]["left"]["properties"]["right"]["properties"]["left"];
        assert_eq!(leaf, &json!({"type": "string"}));
    }

    #[test]
    fn reused_refs_still_report_their_defs() {
        let root = doc();
        let mut resolver = Resolver::new(&root);
        let first = resolver.resolve(&json!({"$ref": "#/components/schemas/Pet"})).unwrap();
        resolver.take_defs();

        let second = resolver.resolve(&json!({"$ref": "#/components/schemas/Pet"})).unwrap();
        assert_eq!(first, second);
        let defs = resolver.take_defs();
        assert_eq!(defs.keys().collect::<Vec<_>>(), vec!["Pet", "Tag"]);
    }

    #[test]
    fn merge_reports_hash_mismatch() {
        let mut pool = BTreeMap::new();
        let first = BTreeMap::from([("Pet".to_string(), "aaa".to_string())]);
        let second = BTreeMap::from([
            ("Pet".to_string(), "bbb".to_string()),
            ("Tag".to_string(), "ccc".to_string()),
        ]);
        assert!(merge_defs(&mut pool, first).is_empty());
        let warnings = merge_defs(&mut pool, second);
        assert_eq!(warnings, vec!["hash mismatch for definition Pet".to_string()]);
        assert_eq!(pool.len(), 2);
    }
}
