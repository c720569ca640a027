//! Tool and environment variable naming

use sha2::{Digest, Sha256};

/// Maximum tool name length.
pub const MAX_TOOL_NAME_LEN: usize = 255;

const HASH_SUFFIX_LEN: usize = 8;

/// Replace characters outside `[A-Za-z0-9_]` with `_`.
#[must_use]
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Split an identifier into words on separators and case boundaries.
///
/// `getHTTPResponse_v2` splits into `get`, `HTTP`, `Response`, `v2`.
fn words(raw: &str) -> Vec<String> {
    let chars: Vec<char> = raw.chars().collect();
    let mut words = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_ascii_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }

        if c.is_ascii_uppercase() && !current.is_empty() {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(char::is_ascii_lowercase);
            let boundary = prev.is_ascii_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_ascii_uppercase() && next_is_lower);
            if boundary {
                words.push(std::mem::take(&mut current));
            }
        }
        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// `snake_case` with repeated separators collapsed.
#[must_use]
pub fn snake_case(raw: &str) -> String {
    words(raw)
        .iter()
        .map(|w| w.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

/// `SCREAMING_SNAKE_CASE`, used for environment variable names.
#[must_use]
pub fn screaming_snake_case(raw: &str) -> String {
    words(raw)
        .iter()
        .map(|w| w.to_ascii_uppercase())
        .collect::<Vec<_>>()
        .join("_")
}

/// Truncate to `max` bytes, replacing the tail with the first 8 hex chars of
/// the SHA-256 of the full string.
#[must_use]
pub fn truncate_with_hash(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let digest = hex::encode(Sha256::digest(s.as_bytes()));
    let hash = &digest[..HASH_SUFFIX_LEN];
    if max <= HASH_SUFFIX_LEN {
        return hash[..max.min(HASH_SUFFIX_LEN)].to_string();
    }
    let mut cut = max - HASH_SUFFIX_LEN;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{hash}", &s[..cut])
}

/// Tool name for an operation: `snake_case(sanitize("{slug}_{op_id}"))`.
///
/// Returns `(name, untruncated_name)`.
#[must_use]
pub fn tool_name(doc_slug: &str, operation_id: &str) -> (String, String) {
    let untruncated = snake_case(&sanitize(&format!("{doc_slug}_{operation_id}")));
    (truncate_with_hash(&untruncated, MAX_TOOL_NAME_LEN), untruncated)
}

/// Environment variable name built from parts, e.g. `("petstore", "api_key")`
/// gives `PETSTORE_API_KEY`.
#[must_use]
pub fn env_var(parts: &[&str]) -> String {
    screaming_snake_case(&parts.join("_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_splits_camel_and_acronyms() {
        assert_eq!(snake_case("listPets"), "list_pets");
        assert_eq!(snake_case("getHTTPResponse"), "get_http_response");
        assert_eq!(snake_case("acme__Find--Pet"), "acme_find_pet");
        assert_eq!(snake_case("_leading_"), "leading");
        assert_eq!(snake_case("v2Items"), "v2_items");
    }

    #[test]
    fn sanitize_replaces_invalid_chars() {
        assert_eq!(sanitize("GET_/pets/{id}"), "GET__pets__id_");
        assert_eq!(snake_case(&sanitize("petstore_GET_/pets/{id}")), "petstore_get_pets_id");
    }

    #[test]
    fn env_var_is_screaming_snake() {
        assert_eq!(env_var(&["petstore", "apiKey"]), "PETSTORE_API_KEY");
        assert_eq!(env_var(&["my-docs", "SERVER_URL"]), "MY_DOCS_SERVER_URL");
    }

    #[test]
    fn long_names_get_hash_suffix() {
        // GIVEN: an operation id of 300 characters
        let op_id = "x".repeat(300);

        // WHEN: naming the tool
        let (name, untruncated) = tool_name("acme", &op_id);

        // THEN: the name fits and ends with 8 hex chars
        assert_eq!(name.len(), MAX_TOOL_NAME_LEN);
        assert_eq!(untruncated.len(), 305);
        let suffix = &name[name.len() - 8..];
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(name.starts_with("acme_xxx"));
    }

    #[test]
    fn truncation_is_deterministic() {
        let s = "a".repeat(400);
        assert_eq!(truncate_with_hash(&s, 100), truncate_with_hash(&s, 100));
        assert_eq!(truncate_with_hash("short", 100), "short");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "é".repeat(200);
        let out = truncate_with_hash(&s, 21);
        assert!(out.len() <= 21);
    }
}
