//! Capability filters and inventory queries

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved filter key holding the build reference
pub const BUILD_KEY: &str = "build";
/// Reserved filter key holding the memory requirement
pub const MEMORY_KEY: &str = "memory";

/// Caller-supplied capability requirements.
///
/// Keys are opaque except [`BUILD_KEY`] and [`MEMORY_KEY`], which feed the
/// flashing job and never reach an inventory search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(BTreeMap<String, Value>);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Value of `key` rendered as a plain string (strings unquoted)
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.0.get(key).and_then(value_to_string)
    }

    pub fn build(&self) -> Option<String> {
        self.get_str(BUILD_KEY)
    }

    pub fn memory(&self) -> Option<String> {
        self.get_str(MEMORY_KEY)
    }

    /// Copy of this filter without the reserved keys
    pub fn search_criteria(&self) -> Filter {
        Filter(
            self.0
                .iter()
                .filter(|(k, _)| k.as_str() != BUILD_KEY && k.as_str() != MEMORY_KEY)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Copy of this filter with the build replaced
    pub fn with_build(&self, build: impl Into<String>) -> Filter {
        let mut copy = self.clone();
        copy.0.insert(BUILD_KEY.to_string(), Value::String(build.into()));
        copy
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<BTreeMap<String, Value>> for Filter {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Filter(map)
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

/// Render a filter value as a string. Only strings and primitives qualify.
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// What the orchestrator asks the cloud for when searching inventory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceQuery {
    /// Capability criteria, reserved keys already removed
    pub criteria: Filter,
    /// Only devices labelled as already running this (unsigned) build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_label: Option<String>,
}

impl DeviceQuery {
    /// Query on the non-reserved keys of `filter`
    pub fn from_filter(filter: &Filter) -> Self {
        Self {
            criteria: filter.search_criteria(),
            build_label: None,
        }
    }

    pub fn with_build_label(mut self, build: impl Into<String>) -> Self {
        self.build_label = Some(build.into());
        self
    }
}
