//! Numeric enum rewrite
//!
//! Several LLM clients reject `enum` on `integer`/`number` schemas. Numeric
//! enumerations are rewritten into `anyOf` branches of `{type, const}`.

use serde_json::{Map, Value, json};

const NUMERIC: [&str; 2] = ["integer", "number"];

fn numeric_type(schema: &Map<String, Value>) -> Option<String> {
    match schema.get("type")? {
        Value::String(t) if NUMERIC.contains(&t.as_str()) => Some(t.clone()),
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| NUMERIC.contains(t))
            .map(ToString::to_string),
        _ => None,
    }
}

/// Type of one enum member. Numbers take the declared numeric type that
/// fits them; other members are typed by their own JSON kind.
fn member_type(member: &Value, declared: &[&str]) -> &'static str {
    match member {
        Value::Number(n) => {
            let integral = n.is_i64() || n.is_u64();
            if integral && (declared.contains(&"integer") || !declared.contains(&"number")) {
                "integer"
            } else {
                "number"
            }
        }
        Value::String(_) => "string",
        Value::Bool(_) => "boolean",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::Null => "null",
    }
}

fn rewrite_node(schema: &mut Map<String, Value>) {
    if numeric_type(schema).is_none() {
        return;
    }
    let Some(Value::Array(members)) = schema.remove("enum") else {
        return;
    };
    let declared = schema.remove("type").unwrap_or(Value::Null);
    let declared: Vec<&str> = match &declared {
        Value::String(t) => vec![t.as_str()],
        Value::Array(types) => types.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };

    let branches: Vec<Value> = members
        .into_iter()
        .map(|member| match member_type(&member, &declared) {
            "null" => json!({"type": "null"}),
            ty => json!({"type": ty, "const": member}),
        })
        .collect();

    match schema.remove("anyOf") {
        Some(existing) => {
            let mut all_of = match schema.remove("allOf") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            all_of.push(json!({"anyOf": existing}));
            all_of.push(json!({"anyOf": branches}));
            schema.insert("allOf".into(), Value::Array(all_of));
        }
        None => {
            schema.insert("anyOf".into(), Value::Array(branches));
        }
    }
}

/// Rewrite numeric enums recursively through `properties`, `items`,
/// `additionalProperties` and the composition keywords.
pub fn rewrite_numeric_enums(schema: &mut Value) {
    let Value::Object(obj) = schema else {
        return;
    };

    rewrite_node(obj);

    if let Some(Value::Object(props)) = obj.get_mut("properties") {
        for prop in props.values_mut() {
            rewrite_numeric_enums(prop);
        }
    }
    for key in ["items", "additionalProperties", "not"] {
        if let Some(child) = obj.get_mut(key) {
            rewrite_numeric_enums(child);
        }
    }
    for key in ["oneOf", "anyOf", "allOf", "prefixItems"] {
        if let Some(Value::Array(children)) = obj.get_mut(key) {
            for child in children {
                rewrite_numeric_enums(child);
            }
        }
    }
}

/// Returns `true` if any node still has a numeric type together with `enum`.
#[must_use]
pub fn has_numeric_enum(schema: &Value) -> bool {
    match schema {
        Value::Object(obj) => {
            (numeric_type(obj).is_some() && obj.contains_key("enum"))
                || obj.values().any(has_numeric_enum)
        }
        Value::Array(items) => items.iter().any(has_numeric_enum),
        _ => false,
    }
}
