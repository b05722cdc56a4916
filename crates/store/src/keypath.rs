//! JSON key-path extractor for dynamically-defined indexes.
//!
//! Paths address fields of a JSON tree: `.field`, `.a.b`, and `.arr[]`
//! (terminal `[]` fans out over array elements, one index key per element).
//! Scalars stringify as the key; `null`, objects, and non-terminal arrays
//! yield no key.

use serde_json::Value;

use crate::error::{Result, StoreError};

/// A parsed key path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath {
    fields: Vec<String>,
    /// Terminal `[]`: extract one key per array element.
    each: bool,
}

impl KeyPath {
    /// Parses a path like `.email`, `.profile.city`, or `.tags[]`.
    pub fn parse(path: &str) -> Result<KeyPath> {
        let rest = path
            .strip_prefix('.')
            .ok_or_else(|| StoreError::NotFound(format!("key path must start with '.': {path:?}")))?;

        let (rest, each) = match rest.strip_suffix("[]") {
            Some(stripped) => (stripped, true),
            None => (rest, false),
        };

        let fields: Vec<String> = rest.split('.').map(str::to_string).collect();
        if fields.iter().any(String::is_empty) {
            return Err(StoreError::NotFound(format!("empty key path segment: {path:?}")));
        }
        Ok(KeyPath { fields, each })
    }

    /// Extracts the index keys this path selects from `value`.
    #[must_use]
    pub fn extract(&self, value: &Value) -> Vec<String> {
        let mut node = value;
        for field in &self.fields {
            match node.get(field) {
                Some(next) => node = next,
                None => return Vec::new(),
            }
        }

        if self.each {
            match node {
                Value::Array(items) => items.iter().filter_map(scalar_key).collect(),
                _ => Vec::new(),
            }
        } else {
            scalar_key(node).into_iter().collect()
        }
    }
}

/// Stringifies a scalar as an index key.
fn scalar_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Object(_) | Value::Array(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_field() {
        let path = KeyPath::parse(".email").unwrap();
        let doc = json!({"email": "a@example.com", "name": "A"});
        assert_eq!(path.extract(&doc), vec!["a@example.com"]);
    }

    #[test]
    fn nested_field() {
        let path = KeyPath::parse(".profile.city").unwrap();
        let doc = json!({"profile": {"city": "Kigali"}});
        assert_eq!(path.extract(&doc), vec!["Kigali"]);
        assert!(path.extract(&json!({"profile": {}})).is_empty());
        assert!(path.extract(&json!({})).is_empty());
    }

    #[test]
    fn array_fanout() {
        let path = KeyPath::parse(".tags[]").unwrap();
        let doc = json!({"tags": ["red", "blue", 3]});
        assert_eq!(path.extract(&doc), vec!["red", "blue", "3"]);
        assert!(path.extract(&json!({"tags": "not-an-array"})).is_empty());
    }

    #[test]
    fn scalars_stringify() {
        let path = KeyPath::parse(".n").unwrap();
        assert_eq!(path.extract(&json!({"n": 42})), vec!["42"]);
        assert_eq!(path.extract(&json!({"n": true})), vec!["true"]);
        assert!(path.extract(&json!({"n": null})).is_empty());
        assert!(path.extract(&json!({"n": {"x": 1}})).is_empty());
    }

    #[test]
    fn malformed_paths_are_rejected() {
        assert!(KeyPath::parse("email").is_err());
        assert!(KeyPath::parse(".").is_err());
        assert!(KeyPath::parse(".a..b").is_err());
    }
}
