use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::{parse_config, Collector, RecordSender};
use crate::task::CycleWindow;
use crate::types::Record;

pub const NAME: &str = "json_rows";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JsonRowsConfig {
    /// Label naming the aggregation key of a row.
    pub key_field: String,
    /// Label used as the record fingerprint; rows without it use their JSON text.
    pub fingerprint_field: String,
    /// Optional numeric unix-second column restricting rows to the window.
    pub time_field: Option<String>,
    /// Explicit key list; defaults to the distinct `key_field` values.
    pub keys: Option<Vec<String>>,
    pub rows: Vec<Map<String, Value>>,
    /// JSON array file read at configuration time, appended to `rows`.
    pub path: Option<PathBuf>,
}

impl Default for JsonRowsConfig {
    fn default() -> Self {
        Self {
            key_field: "user".to_string(),
            fingerprint_field: "id".to_string(),
            time_field: None,
            keys: None,
            rows: Vec::new(),
            path: None,
        }
    }
}

/// Serves records from static JSON rows.
///
/// String values become labels; numbers become fields and also labels in
/// their text form, so rules can compare them.
#[derive(Debug, Default)]
pub struct JsonRowsCollector {
    config: JsonRowsConfig,
}

impl JsonRowsCollector {
    fn key_of(&self, row: &Map<String, Value>) -> Option<String> {
        row.get(&self.config.key_field).map(value_text)
    }

    fn in_window(&self, row: &Map<String, Value>, window: &CycleWindow) -> bool {
        let Some(field) = &self.config.time_field else {
            return true;
        };
        match row.get(field).and_then(Value::as_i64) {
            Some(ts) => window.begin <= ts && ts < window.end,
            None => false,
        }
    }

    fn to_record(&self, row: &Map<String, Value>) -> Record {
        let fingerprint = row
            .get(&self.config.fingerprint_field)
            .map(value_text)
            .unwrap_or_else(|| Value::Object(row.clone()).to_string());
        let mut record = Record::new(fingerprint);
        for (name, value) in row {
            match value {
                Value::Number(n) => {
                    if let Some(f) = n.as_f64() {
                        record.set_field(name.clone(), f);
                    }
                    record.set_label(name.clone(), n.to_string());
                }
                Value::Null => {}
                other => record.set_label(name.clone(), value_text(other)),
            }
        }
        record
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Collector for JsonRowsCollector {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "records from inline or file JSON rows; config {key_field, fingerprint_field, time_field, keys, rows, path}"
    }

    fn set_config(&mut self, raw: &[u8]) -> Result<()> {
        let mut config: JsonRowsConfig = parse_config(raw)?;
        if let Some(path) = &config.path {
            let data = fs::read(path).with_context(|| format!("reading rows from {}", path.display()))?;
            let mut rows: Vec<Map<String, Value>> =
                serde_json::from_slice(&data).context("parsing rows file")?;
            config.rows.append(&mut rows);
        }
        self.config = config;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        if let Some(keys) = &self.config.keys {
            return Ok(keys.clone());
        }
        let mut seen = BTreeSet::new();
        let mut keys = Vec::new();
        for key in self.config.rows.iter().filter_map(|r| self.key_of(r)) {
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn run(&self, key: &str, window: &CycleWindow, out: &RecordSender) -> Result<()> {
        let mut sent = 0usize;
        for row in &self.config.rows {
            if self.key_of(row).as_deref() != Some(key) || !self.in_window(row, window) {
                continue;
            }
            out.send(self.to_record(row)).await?;
            sent += 1;
        }
        debug!(key, sent, "json_rows: key collected");
        Ok(())
    }
}
