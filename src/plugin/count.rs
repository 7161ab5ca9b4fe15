use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::rules::{self, Rule};
use super::{parse_config, Aggregator};
use crate::task::CycleWindow;
use crate::types::Record;

pub const NAME: &str = "count";

#[derive(Debug, Clone, Deserialize)]
pub struct ExtraRule {
    pub field: String,
    #[serde(default)]
    pub output_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CountConfig {
    pub output_key: String,
    pub rules: Vec<Rule>,
    pub extra_rule: Option<ExtraRule>,
}

impl Default for CountConfig {
    fn default() -> Self {
        Self {
            output_key: NAME.to_string(),
            rules: Vec::new(),
            extra_rule: None,
        }
    }
}

/// Counts records whose labels satisfy every rule.
///
/// With an `extra_rule`, the named label of each counted record is kept and
/// emitted as the extra value (missing labels are kept as empty strings).
#[derive(Debug, Default)]
pub struct CountAggregator {
    config: CountConfig,
    window: Option<CycleWindow>,
    value: f64,
    extra: Vec<Value>,
}

#[async_trait]
impl Aggregator for CountAggregator {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "counts records matching all rules; config {output_key, rules:[{field,value,operator}], extra_rule:{field,output_key}}"
    }

    fn set_config(&mut self, raw: &[u8]) -> Result<()> {
        self.config = parse_config(raw)?;
        Ok(())
    }

    fn set_window(&mut self, window: &CycleWindow) -> Result<()> {
        self.window = Some(window.clone());
        Ok(())
    }

    async fn run(&mut self, key: &str, record: &Record) -> Result<()> {
        if !rules::matches_all(&self.config.rules, key, record.labels()) {
            return Ok(());
        }
        if let Some(extra) = &self.config.extra_rule {
            let v = record.label(&extra.field).unwrap_or_default();
            self.extra.push(Value::String(v.to_string()));
        }
        self.value += 1.0;
        Ok(())
    }

    fn metric(&self) -> (String, f64) {
        (self.config.output_key.clone(), self.value)
    }

    fn metric_extra(&self) -> Option<(String, Value)> {
        let extra = self.config.extra_rule.as_ref()?;
        let key = if extra.output_key.is_empty() {
            self.config.output_key.clone()
        } else {
            extra.output_key.clone()
        };
        Some((key, Value::Array(self.extra.clone())))
    }
}
