//! Response selection for jq response filters

use std::collections::HashMap;

use serde_json::{Value, json};
use sha2::{Digest, Sha256};

const FILTER_DESCRIPTION: &str = "Response filter configuration for MCP tool calls. If you want the full response data, do not use this filter. However, use this filter to reduce the size of API responses when you only need certain data - this improves performance and reduces bandwidth usage by extracting only specific fields or transforming the response structure. The 'filter' field should contain a jq filter expression that will be applied to the API response. Study the response schema carefully and use appropriate jq operations: use 'map()' for transforming arrays, 'select()' for filtering, '[]' for array iteration, and object construction '{}' for reshaping data. The response schema available for filtering can be found within the <ResponseSchema> XML tags below, which you can reference to construct appropriate filter expressions.";

const FILTER_EXAMPLES: [&str; 8] = [
    ".data",
    ".items | map({id, name})",
    ".items[] | select(.status == \"active\")",
    "{total: .count, results: .items | map(.name)}",
    ".users | map(select(.role == \"admin\")) | length",
    ".[] | {key: .id, value: .attributes}",
    "if .items then .items else [.] end",
    ".data | group_by(.category) | map({category: .[0].category, count: length})",
];

/// Media type essence, lower-cased and without parameters.
fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// `application/json`, `application/vnd.api+json`, `text/json`, ...
#[must_use]
pub fn is_json(content_type: &str) -> bool {
    essence(content_type).contains("json")
}

/// `application/yaml`, `text/x-yaml`, `application/vnd.foo+yaml`, ...
#[must_use]
pub fn is_yaml(content_type: &str) -> bool {
    let ct = essence(content_type);
    ct.contains("yaml") || ct.ends_with("/yml")
}

/// Lower is more generic and preferred.
#[must_use]
pub fn content_type_specificity(content_type: &str) -> u32 {
    let ct = essence(content_type);
    match ct.as_str() {
        "application/json" => 1,
        "application/yaml" | "text/yaml" => 2,
        _ if is_json(&ct) => 10,
        _ if is_yaml(&ct) => 11,
        _ => 100,
    }
}

/// The response a filter is built for.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedResponse {
    /// Response body schema
    pub schema: Value,
    /// Every JSON/YAML content type using that schema
    pub content_types: Vec<String>,
    /// Every status code using that schema
    pub status_codes: Vec<String>,
}

#[derive(Default)]
struct SchemaGroup {
    codes: Vec<String>,
    content_types: Vec<String>,
    best_content_type: String,
    best_schema: Value,
}

fn hash(schema: &Value) -> String {
    hex::encode(Sha256::digest(serde_json::to_vec(schema).unwrap_or_default()))
}

/// `"200"` -> 200, `"2XX"` -> 299. `None` for `default` and garbage.
fn status_rank(code: &str) -> Option<u16> {
    let lower = code.to_ascii_lowercase();
    let normalised = lower.strip_suffix("xx").map_or(lower.clone(), |p| format!("{p}99"));
    normalised.parse().ok()
}

/// Pick the lowest 2xx status with a JSON or YAML body. `responses` must
/// already have its refs inlined.
#[must_use]
pub fn select_response(responses: &Value) -> Option<SelectedResponse> {
    let responses = responses.as_object()?;
    let mut groups: HashMap<String, SchemaGroup> = HashMap::new();
    let mut code_hash: Vec<(u16, String, String)> = Vec::new();

    for (code, response) in responses {
        let Some(content) = response.get("content").and_then(Value::as_object) else {
            continue;
        };
        let mut first_hash = None;
        for (content_type, media) in content {
            if !is_json(content_type) && !is_yaml(content_type) {
                continue;
            }
            let schema = media.get("schema").cloned().unwrap_or_else(|| json!({}));
            let key = hash(&schema);
            let group = groups.entry(key.clone()).or_default();
            if !group.codes.contains(code) {
                group.codes.push(code.clone());
            }
            if !group.content_types.contains(content_type) {
                group.content_types.push(content_type.clone());
            }
            if group.best_content_type.is_empty()
                || content_type_specificity(content_type) < content_type_specificity(&group.best_content_type)
            {
                group.best_content_type.clone_from(content_type);
                group.best_schema = schema;
            }
            first_hash.get_or_insert(key);
        }
        if let (Some(rank), Some(key)) = (status_rank(code), first_hash) {
            code_hash.push((rank, code.clone(), key));
        }
    }

    // Equal ranks prefer the more generic content type.
    code_hash.sort_by(|a, b| {
        a.0.cmp(&b.0).then_with(|| {
            let spec = |h: &str| groups.get(h).map_or(u32::MAX, |g| content_type_specificity(&g.best_content_type));
            spec(&a.2).cmp(&spec(&b.2))
        })
    });

    let (_, _, key) = code_hash.into_iter().find(|(rank, _, _)| (200..300).contains(rank))?;
    let group = groups.remove(&key)?;
    Some(SelectedResponse {
        schema: group.best_schema,
        content_types: group.content_types,
        status_codes: group.codes,
    })
}

/// The `responseFilter` input property embedding `response_schema` in its
/// description.
#[must_use]
pub fn response_filter_property(response_schema: &Value) -> Value {
    let rendered = serde_json::to_string(response_schema).unwrap_or_default();
    json!({
        "type": "object",
        "description": format!("{FILTER_DESCRIPTION} <ResponseSchema>{rendered}</ResponseSchema>"),
        "properties": {
            "filter": {"type": "string", "examples": FILTER_EXAMPLES},
            "type": {"type": "string", "enum": ["jq"]}
        },
        "required": ["filter", "type"]
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn specificity_order() {
        assert!(content_type_specificity("application/json") < content_type_specificity("application/yaml"));
        assert!(content_type_specificity("text/yaml") < content_type_specificity("application/vnd.api+json"));
        assert!(
            content_type_specificity("application/vnd.api+json")
                < content_type_specificity("application/vnd.foo+yaml")
        );
        assert_eq!(content_type_specificity("text/plain"), 100);
        assert_eq!(content_type_specificity("application/json; charset=utf-8"), 1);
    }

    #[test]
    fn lowest_2xx_wins_and_groups_codes() {
        let pet = json!({"type": "object", "properties": {"id": {"type": "integer"}}});
        let responses = json!({
            "201": {"content": {"application/json": {"schema": pet}}},
            "200": {"content": {
                "application/vnd.api+json": {"schema": pet},
                "application/json": {"schema": pet}
            }},
            "404": {"content": {"application/json": {"schema": {"type": "string"}}}},
            "default": {"content": {"application/json": {"schema": {}}}}
        });
        let selected = select_response(&responses).unwrap();
        assert_eq!(selected.schema, pet);
        assert_eq!(selected.status_codes, vec!["201", "200"]);
        assert_eq!(selected.content_types, vec!["application/json", "application/vnd.api+json"]);
    }

    #[test]
    fn range_codes_rank_after_exact_codes() {
        let responses = json!({
            "2XX": {"content": {"application/json": {"schema": {"type": "array"}}}},
            "204": {"content": {"application/json": {"schema": {"type": "null"}}}}
        });
        let selected = select_response(&responses).unwrap();
        assert_eq!(selected.status_codes, vec!["204"]);
    }

    #[test]
    fn no_json_body_means_no_filter() {
        let responses = json!({"200": {"content": {"text/plain": {"schema": {"type": "string"}}}}});
        assert!(select_response(&responses).is_none());
        assert!(select_response(&json!({"400": {"content": {"application/json": {}}}})).is_none());
    }

    #[test]
    fn filter_property_embeds_schema() {
        let prop = response_filter_property(&json!({"type": "string", "description": "a \"quoted\"\tvalue"}));
        let description = prop["description"].as_str().unwrap();
        assert!(description.starts_with("Response filter configuration for MCP tool calls."));
        assert!(description.ends_with(r#"<ResponseSchema>{"type":"string","description":"a \"quoted\"\tvalue"}</ResponseSchema>"#));
        assert_eq!(prop["required"], json!(["filter", "type"]));
        assert_eq!(prop["properties"]["type"]["enum"], json!(["jq"]));

        // The serialized form carries the escapes
        let rendered = serde_json::to_string(&prop).unwrap();
        assert!(rendered.contains(r#"\\\"quoted\\\"\\t"#));
    }
}
