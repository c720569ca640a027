//! Extraction of tool definitions from whole documents

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use uuid::Uuid;

use gram_gateway::openapi::enums::{has_numeric_enum, rewrite_numeric_enums};
use gram_gateway::openapi::{DocumentScope, EventLevel, ExtractTask, ToolExtractor, extract_document};
use gram_gateway::tools::{InMemoryToolRepository, MAX_PATH_LEN, ToolRepository};

const INVENTORY: &str = r##"{
  "openapi": "3.1.0",
  "info": {"title": "Inventory", "version": "2"},
  "servers": [{"url": "https://inventory.example.com"}],
  "components": {
    "securitySchemes": {
      "token": {"type": "http", "scheme": "bearer"}
    },
    "schemas": {
      "Item": {
        "type": "object",
        "required": ["sku"],
        "properties": {
          "sku": {"type": "string"},
          "size": {"type": "integer", "enum": [1, 5, 15], "description": "Pack size", "default": 5}
        }
      }
    }
  },
  "security": [{"token": []}],
  "paths": {
    "/warehouses/{warehouseId}/items/{sku}": {
      "get": {
        "operationId": "getItem",
        "parameters": [
          {"name": "warehouseId", "in": "path", "required": true, "schema": {"type": "string"}},
          {"name": "sku", "in": "path", "schema": {"type": "string"}},
          {"name": "expand", "in": "query", "schema": {"type": "boolean"}}
        ],
        "responses": {
          "200": {"description": "ok", "content": {"application/json": {"schema": {"$ref": "#/components/schemas/Item"}}}}
        }
      },
      "put": {
        "operationId": "putItem",
        "parameters": [
          {"name": "warehouseId", "in": "path", "schema": {"type": "string"}},
          {"name": "sku", "in": "path", "schema": {"type": "string"}}
        ],
        "requestBody": {
          "required": true,
          "content": {"application/json": {"schema": {"$ref": "#/components/schemas/Item"}}}
        },
        "responses": {"204": {"description": "stored"}}
      }
    },
    "/items": {
      "get": {
        "parameters": [
          {"name": "size", "in": "query", "schema": {"type": "integer", "enum": [1, 5, 15]}}
        ],
        "responses": {"200": {"description": "ok"}}
      }
    }
  }
}"##;

fn task(content: impl Into<Vec<u8>>) -> ExtractTask {
    ExtractTask {
        scope: DocumentScope {
            project_id: "proj".into(),
            deployment_id: "dep".into(),
            document_id: Uuid::new_v4(),
            slug: "inventory".into(),
        },
        name: "inventory.json".into(),
        content: content.into(),
    }
}

const TOP_LEVEL_KEYS: [&str; 5] = [
    "pathParameters",
    "headerParameters",
    "queryParameters",
    "body",
    "responseFilter",
];

#[test]
fn every_tool_schema_has_the_canonical_shape() {
    let outcome = extract_document(&task(INVENTORY)).unwrap();
    assert_eq!(outcome.tools.len(), 3);

    for tool in &outcome.tools {
        assert!(tool.path.len() <= MAX_PATH_LEN);

        let schema = &tool.schema;
        assert_eq!(schema["type"], "object", "{}", tool.name);
        assert_eq!(schema["additionalProperties"], false, "{}", tool.name);

        let properties = schema["properties"].as_object().unwrap();
        for key in properties.keys() {
            assert!(TOP_LEVEL_KEYS.contains(&key.as_str()), "{}: unexpected {key}", tool.name);
        }
        for required in schema["required"].as_array().into_iter().flatten() {
            assert!(properties.contains_key(required.as_str().unwrap()));
        }

        if let Some(path) = properties.get("pathParameters") {
            let declared: Vec<&String> = path["properties"].as_object().unwrap().keys().collect();
            let required: Vec<&str> = path["required"]
                .as_array()
                .unwrap()
                .iter()
                .filter_map(Value::as_str)
                .collect();
            for name in declared {
                assert!(required.contains(&name.as_str()), "{}: {name} not required", tool.name);
            }
        }

        assert!(!has_numeric_enum(schema), "{}", tool.name);
        assert!(!serde_json::to_string(schema).unwrap().contains("\"$ref\":"));
    }
}

#[test]
fn operations_without_id_fall_back_to_method_and_path() {
    let outcome = extract_document(&task(INVENTORY)).unwrap();
    let names: Vec<&str> = outcome.tools.iter().map(|t| t.name.as_str()).collect();
    assert!(names.contains(&"inventory_get_item"));
    assert!(names.contains(&"inventory_put_item"));
    assert!(names.contains(&"inventory_get_items"), "{names:?}");
}

#[test]
fn security_and_server_are_carried_on_the_tool() {
    let outcome = extract_document(&task(INVENTORY)).unwrap();
    let tool = outcome.tools.iter().find(|t| t.name == "inventory_get_item").unwrap();

    assert_eq!(tool.security, json!([{"token": []}]));
    assert_eq!(tool.default_server_url.as_deref(), Some("https://inventory.example.com"));
    assert_eq!(tool.server_env_var, "INVENTORY_SERVER_URL");

    assert_eq!(outcome.security.len(), 1);
    assert_eq!(outcome.security[0].env_variables, vec!["INVENTORY_TOKEN"]);
}

#[test]
fn numeric_enum_in_body_is_rewritten_and_siblings_kept() {
    let outcome = extract_document(&task(INVENTORY)).unwrap();
    let tool = outcome.tools.iter().find(|t| t.name == "inventory_put_item").unwrap();
    let size = &tool.schema["properties"]["body"]["properties"]["size"];

    assert_eq!(
        size["anyOf"],
        json!([
            {"type": "integer", "const": 1},
            {"type": "integer", "const": 5},
            {"type": "integer", "const": 15}
        ])
    );
    assert_eq!(size["description"], "Pack size");
    assert_eq!(size["default"], 5);
}

#[test]
fn integer_enum_rewrite_literal() {
    let mut schema = json!({"type": "integer", "enum": [1, 5, 15]});
    rewrite_numeric_enums(&mut schema);
    assert_eq!(
        schema,
        json!({"anyOf": [
            {"type": "integer", "const": 1},
            {"type": "integer", "const": 5},
            {"type": "integer", "const": 15}
        ]})
    );
}

#[test]
fn long_operation_ids_are_truncated_with_a_hash() {
    let op_id = "x".repeat(300);
    let doc = json!({
        "openapi": "3.1.0",
        "paths": {"/long": {"get": {"operationId": op_id, "responses": {"200": {"description": "ok"}}}}}
    });
    let mut task = task(serde_json::to_vec(&doc).unwrap());
    task.scope.slug = "acme".into();

    let outcome = extract_document(&task).unwrap();
    let tool = &outcome.tools[0];
    assert!(tool.name.len() <= 255);
    assert!(tool.name[tool.name.len() - 8..].chars().all(|c| c.is_ascii_hexdigit()));
    assert!(tool.original_name.is_none());
}

#[test]
fn yaml_and_json_documents_agree() {
    let json_doc: Value = serde_json::from_str(INVENTORY).unwrap();
    let yaml_doc = serde_yaml::to_string(&json_doc).unwrap();

    let from_json = extract_document(&task(INVENTORY)).unwrap();
    let mut yaml_task = task(yaml_doc);
    yaml_task.name = "inventory.yaml".into();
    let from_yaml = extract_document(&yaml_task).unwrap();

    let schemas = |o: &gram_gateway::openapi::ExtractOutcome| {
        o.tools
            .iter()
            .map(|t| (t.name.clone(), t.schema.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(schemas(&from_json), schemas(&from_yaml));
}

#[tokio::test]
async fn extractor_persists_tools_and_security() {
    let repo = Arc::new(InMemoryToolRepository::new());
    let task = task(INVENTORY);
    let outcome = ToolExtractor::new(repo.clone()).process(&task).await.unwrap();
    assert_eq!(outcome.tools.len(), 3);

    let tools = repo.list_tools("proj").await.unwrap();
    assert_eq!(tools.len(), 3);
    let found = repo.find_tool("proj", "inventory_get_item").await.unwrap();
    assert!(found.is_some());
    assert!(repo.find_tool("other", "inventory_get_item").await.unwrap().is_none());

    let security = repo
        .find_security(task.scope.document_id, &["token".to_string()])
        .await
        .unwrap();
    assert_eq!(security.len(), 1);
    assert_eq!(security[0].scheme.as_deref(), Some("bearer"));
}

#[test]
fn unparseable_document_is_a_bad_request() {
    let err = extract_document(&task("openapi: [unterminated")).unwrap_err();
    assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
}

#[test]
fn fanned_out_refs_skip_the_operation_instead_of_exploding() {
    let mut schemas = serde_json::Map::new();
    for i in 0..20 {
        let next = json!({"$ref": format!("#/components/schemas/S{}", i + 1)});
        schemas.insert(
            format!("S{i}"),
            json!({"type": "object", "properties": {"left": next.clone(), "right": next}}),
        );
    }
    schemas.insert("S20".into(), json!({"type": "string"}));
    let doc = json!({
        "openapi": "3.1.0",
        "components": {"schemas": schemas},
        "paths": {
            "/tree": {"post": {
                "operationId": "plantTree",
                "requestBody": {"content": {"application/json": {"schema": {"$ref": "#/components/schemas/S0"}}}},
                "responses": {"204": {"description": "ok"}}
            }},
            "/health": {"get": {"operationId": "health", "responses": {"200": {"description": "ok"}}}}
        }
    });

    let started = std::time::Instant::now();
    let outcome = extract_document(&task(serde_json::to_vec(&doc).unwrap())).unwrap();
    assert!(started.elapsed() < std::time::Duration::from_secs(5));

    let names: Vec<&str> = outcome.tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["inventory_health"]);
    let event = outcome
        .events
        .iter()
        .find(|e| e.event == "schema-too-large")
        .expect("oversized schema event");
    assert_eq!(event.level, EventLevel::Error);
    assert!(event.message.contains("POST /tree"));
}
