//! Device property normalization

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::models::DeviceProperty;

/// A property group's value: one entry, or every entry in first-seen order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Single(String),
    Multiple(Vec<String>),
}

impl PropertyValue {
    fn push(&mut self, value: String) {
        match self {
            PropertyValue::Single(first) => {
                let first = std::mem::take(first);
                *self = PropertyValue::Multiple(vec![first, value]);
            }
            PropertyValue::Multiple(values) => values.push(value),
        }
    }
}

/// Normalized property mapping keyed by group name, in first-seen order
pub type DeviceProperties = IndexMap<String, PropertyValue>;

/// `"Build version"` → `"build_version"`
pub fn normalize_group_name(group: &str) -> String {
    group.to_lowercase().replace(' ', "_")
}

/// Fold raw records into a lookup keyed by normalized group name.
pub fn normalize_properties(records: impl IntoIterator<Item = DeviceProperty>) -> DeviceProperties {
    let mut properties = DeviceProperties::new();
    for record in records {
        let key = normalize_group_name(&record.group_name);
        match properties.get_mut(&key) {
            Some(existing) => existing.push(record.display_value),
            None => {
                properties.insert(key, PropertyValue::Single(record.display_value));
            }
        }
    }
    properties
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_single_property_is_scalar() {
        let props = normalize_properties(vec![DeviceProperty::new("Build version", "v1")]);
        assert_eq!(
            props.get("build_version"),
            Some(&PropertyValue::Single("v1".to_string()))
        );
    }

    #[test]
    fn test_repeated_group_becomes_ordered_list() {
        let props = normalize_properties(vec![
            DeviceProperty::new("Build version", "v2"),
            DeviceProperty::new("Memory", "512"),
            DeviceProperty::new("build Version", "v1"),
            DeviceProperty::new("Build version", "v3"),
        ]);
        assert_eq!(
            props.get("build_version"),
            Some(&PropertyValue::Multiple(vec![
                "v2".to_string(),
                "v1".to_string(),
                "v3".to_string()
            ]))
        );
        assert_eq!(
            props.get("memory"),
            Some(&PropertyValue::Single("512".to_string()))
        );
    }

    #[test]
    fn test_groups_keep_first_seen_order() {
        let props = normalize_properties(vec![
            DeviceProperty::new("Sdk", "19"),
            DeviceProperty::new("Build version", "v1"),
            DeviceProperty::new("Memory", "512"),
            DeviceProperty::new("Sdk", "20"),
        ]);
        let keys: Vec<&str> = props.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["sdk", "build_version", "memory"]);
        assert_eq!(
            serde_json::to_string(&props).unwrap(),
            r#"{"sdk":["19","20"],"build_version":"v1","memory":"512"}"#
        );
    }

    #[test]
    fn test_serializes_scalars_and_lists() {
        let props = normalize_properties(vec![
            DeviceProperty::new("A b", "1"),
            DeviceProperty::new("C", "x"),
            DeviceProperty::new("C", "y"),
        ]);
        let json = serde_json::to_value(&props).unwrap();
        assert_eq!(json, serde_json::json!({"a_b": "1", "c": ["x", "y"]}));
    }
}
