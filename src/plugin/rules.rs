//! Label predicates shared by the builtin aggregators.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Label value equals the rule value.
    Equal,
    /// Label value equals the aggregation key.
    EqualKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub field: String,
    #[serde(default)]
    pub value: String,
    pub operator: Operator,
}

impl Rule {
    /// Missing labels compare as the empty string.
    pub fn matches(&self, key: &str, labels: &HashMap<String, String>) -> bool {
        let actual = labels.get(&self.field).map(String::as_str).unwrap_or("");
        match self.operator {
            Operator::Equal => actual == self.value,
            Operator::EqualKey => actual == key,
        }
    }
}

/// All rules must match; an empty set matches everything.
pub fn matches_all(rules: &[Rule], key: &str, labels: &HashMap<String, String>) -> bool {
    rules.iter().all(|r| r.matches(key, labels))
}
