use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use super::{parse_config, Filter};
use crate::types::Record;

pub const DEFAULT_NAME: &str = "label_default";
pub const REQUIRE_NAME: &str = "require_labels";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LabelDefaultConfig {
    pub defaults: BTreeMap<String, String>,
}

/// Fills labels a record does not carry.
#[derive(Debug, Default)]
pub struct LabelDefault {
    config: LabelDefaultConfig,
}

#[async_trait]
impl Filter for LabelDefault {
    fn name(&self) -> &str {
        DEFAULT_NAME
    }

    fn description(&self) -> &str {
        "sets missing labels; config {defaults: {label: value}}"
    }

    fn set_config(&mut self, raw: &[u8]) -> Result<()> {
        self.config = parse_config(raw)?;
        Ok(())
    }

    async fn run(&self, _key: &str, record: &mut Record) -> Result<()> {
        for (name, value) in &self.config.defaults {
            if record.label(name).is_none() {
                record.set_label(name.clone(), value.clone());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RequireLabelsConfig {
    pub labels: Vec<String>,
}

/// Rejects records missing any of the configured labels.
#[derive(Debug, Default)]
pub struct RequireLabels {
    config: RequireLabelsConfig,
}

#[async_trait]
impl Filter for RequireLabels {
    fn name(&self) -> &str {
        REQUIRE_NAME
    }

    fn description(&self) -> &str {
        "fails the key when a record lacks a label; config {labels: [..]}"
    }

    fn set_config(&mut self, raw: &[u8]) -> Result<()> {
        self.config = parse_config(raw)?;
        Ok(())
    }

    async fn run(&self, key: &str, record: &mut Record) -> Result<()> {
        if let Some(missing) = self
            .config
            .labels
            .iter()
            .find(|l| record.label(l).is_none())
        {
            anyhow::bail!(
                "record {} of key {key} has no label {missing}",
                record.fingerprint()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_do_not_overwrite() {
        let mut f = LabelDefault::default();
        f.set_config(br#"{"defaults":{"region":"eu","tier":"free"}}"#)
            .unwrap();
        let mut rec = Record::new("1").with_label("tier", "gold");
        f.run("k", &mut rec).await.unwrap();
        assert_eq!(rec.label("region"), Some("eu"));
        assert_eq!(rec.label("tier"), Some("gold"));
    }

    #[tokio::test]
    async fn missing_label_is_an_error() {
        let mut f = RequireLabels::default();
        f.set_config(br#"{"labels":["user"]}"#).unwrap();
        assert!(f.run("k", &mut Record::new("1")).await.is_err());
        assert!(f
            .run("k", &mut Record::new("2").with_label("user", "u"))
            .await
            .is_ok());
    }
}
