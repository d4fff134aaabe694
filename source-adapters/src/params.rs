use common::storage::types::document::{JsonMap, SourceKind};
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

/// Opaque submission arguments forwarded to an adapter.
///
/// The HTTP layer does not know which keys a given source needs; each
/// adapter validates what it requires through the typed getters here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SourceParams(JsonMap);

impl SourceParams {
    pub fn new(map: JsonMap) -> Self {
        Self(map)
    }

    pub fn as_map(&self) -> &JsonMap {
        &self.0
    }

    pub fn into_map(self) -> JsonMap {
        self.0
    }

    pub fn set(&mut self, key: &str, value: serde_json::Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(serde_json::Value::as_u64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(serde_json::Value::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(serde_json::Value::as_bool)
    }

    pub fn get_object(&self, key: &str) -> Option<&JsonMap> {
        self.0.get(key).and_then(|v| v.as_object())
    }

    pub fn require_str(&self, key: &str, source_kind: SourceKind) -> Result<&str, SourceError> {
        self.get_str(key).ok_or_else(|| {
            SourceError::validation(source_kind, format!("'{key}' parameter is required"))
        })
    }
}

impl From<JsonMap> for SourceParams {
    fn from(map: JsonMap) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params() -> SourceParams {
        let mut p = SourceParams::default();
        p.set("url", json!("https://example.com"));
        p.set("max_pages", json!(5));
        p.set("respect_robots", json!(false));
        p
    }

    #[test]
    fn typed_getters() {
        let p = params();
        assert_eq!(p.get_str("url"), Some("https://example.com"));
        assert_eq!(p.get_u64("max_pages"), Some(5));
        assert_eq!(p.get_bool("respect_robots"), Some(false));
        assert_eq!(p.get_str("missing"), None);
    }

    #[test]
    fn require_str_reports_missing_key() {
        let p = params();
        let err = p.require_str("file_path", SourceKind::FileUpload).unwrap_err();
        assert!(err.to_string().contains("file_path"));
    }
}
