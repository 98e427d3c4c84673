//! Location tasks and the task list loader

use crate::error::TaskLoadError;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

/// Field used as the task key when none is configured
pub const DEFAULT_KEY_FIELD: &str = "city_code";

/// One unit of work: a location key plus the parameters its fetch needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationTask {
    key: String,
    params: BTreeMap<String, String>,
}

impl LocationTask {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }
}

impl fmt::Display for LocationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Load tasks from a JSON array of objects.
///
/// Every scalar field becomes a string parameter; the `key_field` value is
/// also the task key and must be present and unique.
pub fn load_tasks<P: AsRef<Path>>(path: P, key_field: &str) -> Result<Vec<LocationTask>, TaskLoadError> {
    let content = std::fs::read_to_string(path)?;
    parse_tasks(&content, key_field)
}

pub fn parse_tasks(content: &str, key_field: &str) -> Result<Vec<LocationTask>, TaskLoadError> {
    let records: Vec<Map<String, Value>> = serde_json::from_str(content)?;
    let mut seen = HashSet::with_capacity(records.len());

    records
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            let params: BTreeMap<String, String> = record
                .into_iter()
                .filter_map(|(name, value)| scalar_to_string(value).map(|v| (name, v)))
                .collect();

            let key = params
                .get(key_field)
                .filter(|key| !key.trim().is_empty())
                .cloned()
                .ok_or_else(|| TaskLoadError::MissingKey {
                    index,
                    field: key_field.to_string(),
                })?;

            if !seen.insert(key.clone()) {
                return Err(TaskLoadError::DuplicateKey(key));
            }

            Ok(LocationTask { key, params })
        })
        .collect()
}

fn scalar_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_city_records() {
        let content = r#"[
            {"city_code": "MUMBAI", "region_code": "MUMBAI", "sub_region_code": "MUMBAI",
             "region_slug": "mumbai", "latitude": "19.076", "longitude": 72.8777},
            {"city_code": "NCR", "region_code": "NCR", "sub_region_code": "NCR",
             "region_slug": "national-capital-region-ncr", "latitude": "28.6", "longitude": "77.2",
             "aliases": ["Delhi"]}
        ]"#;

        let tasks = parse_tasks(content, DEFAULT_KEY_FIELD).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].key(), "MUMBAI");
        assert_eq!(tasks[0].param("longitude"), Some("72.8777"));
        assert_eq!(tasks[1].param("region_slug"), Some("national-capital-region-ncr"));
        assert_eq!(tasks[1].param("aliases"), None);
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let content = r#"[{"city_code": "A"}, {"region_code": "B"}]"#;
        let err = parse_tasks(content, DEFAULT_KEY_FIELD).unwrap_err();
        assert!(matches!(err, TaskLoadError::MissingKey { index: 1, .. }));
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let content = r#"[{"id": 7}, {"id": 7}]"#;
        let err = parse_tasks(content, "id").unwrap_err();
        assert!(matches!(err, TaskLoadError::DuplicateKey(key) if key == "7"));
    }

    #[test]
    fn test_not_an_array() {
        let err = parse_tasks(r#"{"city_code": "A"}"#, DEFAULT_KEY_FIELD).unwrap_err();
        assert!(matches!(err, TaskLoadError::Json(_)));
    }

    #[test]
    fn test_builder() {
        let task = LocationTask::new("BANG").with_param("region_code", "BANG");
        assert_eq!(task.to_string(), "BANG");
        assert_eq!(task.params().len(), 1);
    }
}
