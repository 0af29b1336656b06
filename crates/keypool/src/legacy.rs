//! Migration from the single-key config format
//!
//! Older configs stored keys as a top-level `gemini_api_key` string and/or an
//! `api.keys` array. Entries may be plain strings or `{"key": "..."}` objects.

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Outcome of [`crate::Pool::import_legacy`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    /// Already in the pool, or repeated within the legacy config
    pub duplicates: usize,
    /// Failed key validation
    pub invalid: usize,
    /// Valid but the pool was full
    pub skipped_full: usize,
}

impl ImportReport {
    pub fn total_seen(&self) -> usize {
        self.imported + self.duplicates + self.invalid + self.skipped_full
    }
}

/// Extract candidate keys from a legacy config document, in file order.
pub fn legacy_keys(json: &str) -> Result<Vec<String>> {
    let root: Value = serde_json::from_str(json)
        .map_err(|e| Error::Validation(format!("legacy config is not valid JSON: {e}")))?;
    if !root.is_object() {
        return Err(Error::Validation(
            "legacy config must be a JSON object".into(),
        ));
    }

    let mut keys = Vec::new();
    if let Some(single) = root.get("gemini_api_key").and_then(Value::as_str) {
        keys.push(single.to_string());
    }
    if let Some(list) = root.pointer("/api/keys").and_then(Value::as_array) {
        for entry in list {
            let key = match entry {
                Value::String(s) => Some(s.as_str()),
                Value::Object(map) => map.get("key").and_then(Value::as_str),
                _ => None,
            };
            if let Some(key) = key {
                keys.push(key.to_string());
            }
        }
    }

    keys.retain(|k| !k.trim().is_empty());
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_single_and_list_forms() {
        let json = r#"{
            "gemini_api_key": "single",
            "api": {"keys": ["one", {"key": "two"}, 3, "", {"other": "x"}]}
        }"#;
        assert_eq!(legacy_keys(json).unwrap(), vec!["single", "one", "two"]);
    }

    #[test]
    fn missing_sections_yield_nothing() {
        assert!(legacy_keys(r#"{"model": "gemini"}"#).unwrap().is_empty());
        assert!(legacy_keys(r#"{"gemini_api_key": ""}"#).unwrap().is_empty());
    }

    #[test]
    fn rejects_non_object_and_bad_json() {
        assert!(matches!(legacy_keys("[1,2]"), Err(Error::Validation(_))));
        assert!(matches!(legacy_keys("{oops"), Err(Error::Validation(_))));
    }
}
