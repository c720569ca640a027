//! OpenAPI 3.0 to 3.1 upgrade
//!
//! Works directly on the parsed document value. Every site that cannot be
//! upgraded is recorded as an issue and left as it was; the rest of the
//! document is still upgraded.

use std::collections::BTreeSet;

use serde_json::{Map, Value, json};

const METHODS: [&str; 8] = ["get", "put", "post", "delete", "options", "head", "patch", "trace"];

const OBJECT_HINTS: [&str; 7] = [
    "properties",
    "patternProperties",
    "propertyNames",
    "additionalProperties",
    "unevaluatedProperties",
    "minProperties",
    "maxProperties",
];

const ARRAY_HINTS: [&str; 6] = ["items", "prefixItems", "contains", "minItems", "maxItems", "unevaluatedItems"];

/// Result of [`upgrade_document`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpgradeOutcome {
    /// The document was 3.0 and has been rewritten to 3.1
    pub upgraded: bool,
    /// Per-site failures, as `"{location}: {reason}"`
    pub issues: Vec<String>,
}

/// Upgrade a 3.0.x document to 3.1.0 in place. Other versions are untouched.
pub fn upgrade_document(doc: &mut Value) -> UpgradeOutcome {
    let mut outcome = UpgradeOutcome::default();
    let is_30 = doc
        .get("openapi")
        .and_then(Value::as_str)
        .is_some_and(|v| v.starts_with("3.0"));
    if !is_30 {
        return outcome;
    }

    let mut issues = Vec::new();

    if let Some(components) = doc.get_mut("components").and_then(Value::as_object_mut) {
        if let Some(Value::Object(schemas)) = components.get_mut("schemas") {
            for (name, schema) in schemas.iter_mut() {
                upgrade_schema(schema, &format!("#/components/schemas/{name}"), &mut issues);
            }
        }
        if let Some(Value::Object(params)) = components.get_mut("parameters") {
            for (name, param) in params.iter_mut() {
                upgrade_parameter(param, &format!("#/components/parameters/{name}"), &mut issues);
            }
        }
        for section in ["requestBodies", "responses"] {
            if let Some(Value::Object(entries)) = components.get_mut(section) {
                for (name, entry) in entries.iter_mut() {
                    upgrade_content(entry, &format!("#/components/{section}/{name}"), &mut issues);
                }
            }
        }
    }

    if let Some(Value::Object(paths)) = doc.get_mut("paths") {
        for (path, item) in paths.iter_mut() {
            let Value::Object(item) = item else { continue };
            if let Some(Value::Array(params)) = item.get_mut("parameters") {
                for (i, param) in params.iter_mut().enumerate() {
                    upgrade_parameter(param, &format!("{path}: shared parameter {i}"), &mut issues);
                }
            }
            for method in METHODS {
                if let Some(Value::Object(op)) = item.get_mut(method) {
                    let loc = format!("{} {path}", method.to_uppercase());
                    upgrade_operation(op, &loc, &mut issues);
                }
            }
        }
    }

    doc["openapi"] = json!("3.1.0");
    outcome.upgraded = true;
    outcome.issues = issues;
    outcome
}

fn upgrade_operation(op: &mut Map<String, Value>, loc: &str, issues: &mut Vec<String>) {
    if let Some(Value::Array(params)) = op.get_mut("parameters") {
        for (i, param) in params.iter_mut().enumerate() {
            upgrade_parameter(param, &format!("{loc}: parameter {i}"), issues);
        }
    }
    if let Some(body) = op.get_mut("requestBody") {
        upgrade_content(body, &format!("{loc}: request body"), issues);
    }
    if let Some(Value::Object(responses)) = op.get_mut("responses") {
        for (code, response) in responses.iter_mut() {
            upgrade_content(response, &format!("{loc}: response {code}"), issues);
        }
    }
}

fn upgrade_parameter(param: &mut Value, loc: &str, issues: &mut Vec<String>) {
    if let Some(schema) = param.get_mut("schema") {
        upgrade_schema(schema, loc, issues);
    }
    upgrade_content(param, loc, issues);
}

/// Upgrade the schemas under a `content` map (request bodies, responses and
/// content-style parameters).
fn upgrade_content(holder: &mut Value, loc: &str, issues: &mut Vec<String>) {
    let Some(Value::Object(content)) = holder.get_mut("content") else {
        return;
    };
    for (media, entry) in content.iter_mut() {
        if let Some(schema) = entry.get_mut("schema") {
            upgrade_schema(schema, &format!("{loc} ({media})"), issues);
        }
    }
}

/// Upgrade one schema and everything nested inside it.
pub fn upgrade_schema(schema: &mut Value, loc: &str, issues: &mut Vec<String>) {
    let Value::Object(obj) = schema else {
        return;
    };
    if obj.contains_key("$ref") {
        return;
    }

    upgrade_exclusive_bound(obj, "exclusiveMinimum", "minimum");
    upgrade_exclusive_bound(obj, "exclusiveMaximum", "maximum");
    if let Err(reason) = upgrade_nullable(obj) {
        issues.push(format!("{loc}: error upgrading nullable schema: {reason}"));
    }
    if let Some(example) = obj.remove("example") {
        obj.entry("examples").or_insert_with(|| json!([example]));
    }

    for key in ["allOf", "anyOf", "oneOf"] {
        if let Some(Value::Array(children)) = obj.get_mut(key) {
            for child in children {
                upgrade_schema(child, loc, issues);
            }
        }
    }
    for key in ["items", "not", "additionalProperties"] {
        if let Some(child) = obj.get_mut(key) {
            upgrade_schema(child, loc, issues);
        }
    }
    if let Some(Value::Object(props)) = obj.get_mut("properties") {
        for (name, prop) in props.iter_mut() {
            upgrade_schema(prop, &format!("{loc}.{name}"), issues);
        }
    }
}

/// 3.0 uses a boolean flag next to `minimum`/`maximum`; 3.1 carries the bound
/// itself.
fn upgrade_exclusive_bound(obj: &mut Map<String, Value>, exclusive: &str, bound: &str) {
    let Some(flag) = obj.get(exclusive).and_then(Value::as_bool) else {
        return;
    };
    if flag && let Some(value) = obj.remove(bound) {
        obj.insert(exclusive.to_string(), value);
    } else {
        obj.remove(exclusive);
    }
}

fn upgrade_nullable(obj: &mut Map<String, Value>) -> Result<(), &'static str> {
    match obj.remove("nullable") {
        Some(Value::Bool(true)) => {}
        _ => return Ok(()),
    }

    let mut types = infer_types(obj);
    if !types.is_empty() {
        if !types.iter().any(|t| t == "null") {
            types.push("null".into());
        }
        obj.insert("type".into(), json!(types));
        if let Some(Value::Array(members)) = obj.get_mut("enum")
            && !members.iter().any(Value::is_null)
        {
            members.push(Value::Null);
        }
        return Ok(());
    }

    for key in ["anyOf", "oneOf"] {
        if let Some(Value::Array(branches)) = obj.get_mut(key)
            && !branches.is_empty()
        {
            branches.push(json!({"type": "null"}));
            return Ok(());
        }
    }

    if let Some(Value::Array(all_of)) = obj.get("allOf")
        && !all_of.is_empty()
    {
        let all_of = obj.remove("allOf").unwrap_or_default();
        obj.insert("oneOf".into(), json!([{"type": "null"}, {"allOf": all_of}]));
        return Ok(());
    }

    obj.insert("nullable".into(), Value::Bool(true));
    Err("unable to infer type for schema")
}

fn infer_types(obj: &Map<String, Value>) -> Vec<String> {
    match obj.get("type") {
        Some(Value::String(t)) => return vec![t.clone()],
        Some(Value::Array(ts)) if !ts.is_empty() => {
            return ts.iter().filter_map(Value::as_str).map(String::from).collect();
        }
        _ => {}
    }

    if let Some(Value::Array(members)) = obj.get("enum")
        && !members.is_empty()
    {
        let set: BTreeSet<&str> = members.iter().filter_map(value_type).collect();
        return set.into_iter().map(String::from).collect();
    }

    if OBJECT_HINTS.iter().any(|k| obj.contains_key(*k)) {
        return vec!["object".into()];
    }

    if ARRAY_HINTS.iter().any(|k| obj.contains_key(*k)) {
        return vec!["array".into()];
    }

    for key in ["const", "default"] {
        if let Some(value) = obj.get(key) {
            return value_type(value).map(|t| vec![t.to_string()]).unwrap_or_default();
        }
    }

    Vec::new()
}

fn value_type(value: &Value) -> Option<&'static str> {
    match value {
        Value::Number(_) => Some("number"),
        Value::Bool(_) => Some("boolean"),
        Value::String(_) => Some("string"),
        Value::Null => Some("null"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn upgraded(schema: Value) -> (Value, Vec<String>) {
        let mut schema = schema;
        let mut issues = Vec::new();
        upgrade_schema(&mut schema, "test", &mut issues);
        (schema, issues)
    }

    // ========================================================================
    // Schema rules
    // ========================================================================

    #[test]
    fn nullable_with_type_becomes_type_array() {
        let (schema, issues) = upgraded(json!({"type": "string", "nullable": true}));
        assert!(issues.is_empty());
        assert_eq!(schema, json!({"type": ["string", "null"]}));
    }

    #[test]
    fn nullable_false_is_dropped() {
        let (schema, _) = upgraded(json!({"type": "string", "nullable": false}));
        assert_eq!(schema, json!({"type": "string"}));
    }

    #[test]
    fn nullable_enum_gains_null_member() {
        let (schema, _) = upgraded(json!({"enum": ["a", 1], "nullable": true}));
        assert_eq!(schema["type"], json!(["number", "string", "null"]));
        assert_eq!(schema["enum"], json!(["a", 1, null]));
    }

    #[test]
    fn nullable_infers_object_and_array() {
        let (obj, _) = upgraded(json!({"properties": {"a": {}}, "nullable": true}));
        assert_eq!(obj["type"], json!(["object", "null"]));
        let (arr, _) = upgraded(json!({"items": {"type": "string"}, "nullable": true}));
        assert_eq!(arr["type"], json!(["array", "null"]));
    }

    #[test]
    fn nullable_composition_gets_null_branch() {
        let (any, _) = upgraded(json!({"anyOf": [{"type": "string"}], "nullable": true}));
        assert_eq!(any["anyOf"][1], json!({"type": "null"}));

        let (all, _) = upgraded(json!({"allOf": [{"type": "string"}], "nullable": true}));
        assert_eq!(
            all,
            json!({"oneOf": [{"type": "null"}, {"allOf": [{"type": "string"}]}]})
        );
    }

    #[test]
    fn nullable_without_hints_is_reported() {
        let (schema, issues) = upgraded(json!({"nullable": true, "description": "?"}));
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("unable to infer type for schema"));
        assert_eq!(schema["nullable"], true);
    }

    #[test]
    fn exclusive_bounds_take_numeric_form() {
        let (schema, _) = upgraded(json!({
            "type": "integer",
            "minimum": 1,
            "exclusiveMinimum": true,
            "maximum": 10,
            "exclusiveMaximum": false
        }));
        assert_eq!(
            schema,
            json!({"type": "integer", "exclusiveMinimum": 1, "maximum": 10})
        );
    }

    #[test]
    fn example_moves_to_examples() {
        let (schema, _) = upgraded(json!({"type": "string", "example": "abc"}));
        assert_eq!(schema, json!({"type": "string", "examples": ["abc"]}));
    }

    #[test]
    fn nested_properties_are_upgraded() {
        let (schema, _) = upgraded(json!({
            "type": "object",
            "properties": {"tags": {"type": "array", "items": {"type": "string", "nullable": true}}}
        }));
        assert_eq!(
            schema["properties"]["tags"]["items"]["type"],
            json!(["string", "null"])
        );
    }

    // ========================================================================
    // Document walk
    // ========================================================================

    #[test]
    fn document_walk_covers_components_and_operations() {
        let mut doc = json!({
            "openapi": "3.0.3",
            "components": {"schemas": {"Pet": {"type": "string", "nullable": true}}},
            "paths": {"/pets": {"post": {
                "parameters": [{"name": "q", "in": "query", "schema": {"type": "integer", "example": 3}}],
                "requestBody": {"content": {"application/json": {"schema": {"type": "object", "nullable": true}}}}
            }}}
        });
        let outcome = upgrade_document(&mut doc);
        assert!(outcome.upgraded);
        assert_eq!(doc["openapi"], "3.1.0");
        assert_eq!(doc["components"]["schemas"]["Pet"]["type"], json!(["string", "null"]));
        let op = &doc["paths"]["/pets"]["post"];
        assert_eq!(op["parameters"][0]["schema"]["examples"], json!([3]));
        assert_eq!(
            op["requestBody"]["content"]["application/json"]["schema"]["type"],
            json!(["object", "null"])
        );
    }

    #[test]
    fn non_30_documents_are_untouched() {
        let mut doc = json!({"openapi": "3.1.0", "components": {"schemas": {"A": {"nullable": true}}}});
        let before = doc.clone();
        let outcome = upgrade_document(&mut doc);
        assert!(!outcome.upgraded);
        assert_eq!(doc, before);
    }
}
