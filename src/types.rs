use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One unit of collected data flowing from a collector through filters into aggregators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    fingerprint: String,
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    fields: HashMap<String, f64>,
}

impl Record {
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            labels: HashMap::new(),
            fields: HashMap::new(),
        }
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Dedup identity; never changes after construction.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    pub fn field(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    pub fn fields(&self) -> &HashMap<String, f64> {
        &self.fields
    }

    pub fn set_label(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(name.into(), value.into());
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: f64) {
        self.fields.insert(name.into(), value);
    }
}

/// Aggregated result for one key in one cycle window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricOutput {
    pub key: String,
    pub values: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl MetricOutput {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}
