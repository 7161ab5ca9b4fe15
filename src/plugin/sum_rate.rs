use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::rules::{self, Rule};
use super::{parse_config, Aggregator};
use crate::task::CycleWindow;
use crate::types::Record;

pub const NAME: &str = "two_field_sum_rate";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateFields {
    pub molecular: String,
    pub denominator: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateExtra {
    pub field: String,
    #[serde(default)]
    pub output_key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    pub field: RateFields,
    pub rules: Vec<Rule>,
    pub output_key: String,
    pub extra: Option<RateExtra>,
    /// Numerator is scaled by `10^power` (2 gives a percentage).
    pub power: i32,
}

/// `sum(molecular) * 10^power / sum(denominator)` over matching records.
#[derive(Debug, Default)]
pub struct TwoFieldSumRate {
    config: RateConfig,
    window: Option<CycleWindow>,
    molecular: f64,
    denominator: f64,
    extra: Vec<String>,
}

#[async_trait]
impl Aggregator for TwoFieldSumRate {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "ratio of two summed fields; config {field:{molecular,denominator}, rules, output_key, extra:{field,output_key}, power}"
    }

    fn set_config(&mut self, raw: &[u8]) -> Result<()> {
        let config: RateConfig = parse_config(raw)?;
        if config.field.molecular.is_empty() || config.field.denominator.is_empty() {
            anyhow::bail!("{NAME}: field.molecular and field.denominator are required");
        }
        self.config = config;
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
        if let Some(extra) = &self.config.extra {
            match record.label(&extra.field) {
                Some(v) if !v.is_empty() && v != "nil" && v != "null" => {
                    self.extra.push(v.to_string())
                }
                _ => {}
            }
        }
        self.molecular += record.field(&self.config.field.molecular).unwrap_or(0.0);
        self.denominator += record.field(&self.config.field.denominator).unwrap_or(0.0);
        Ok(())
    }

    fn metric(&self) -> (String, f64) {
        let denominator = if self.denominator == 0.0 {
            1.0
        } else {
            self.denominator
        };
        let value = self.molecular * 10f64.powi(self.config.power) / denominator;
        debug!(
            metric = ?self.window.as_ref().map(|w| &w.metric_name),
            molecular = self.molecular,
            denominator,
            value,
            "two_field_sum_rate computed"
        );
        (self.config.output_key.clone(), value)
    }

    fn metric_extra(&self) -> Option<(String, Value)> {
        let extra = self.config.extra.as_ref()?;
        let values = self.extra.iter().cloned().map(Value::String).collect();
        Some((extra.output_key.clone(), Value::Array(values)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn configured(cfg: Value) -> TwoFieldSumRate {
        let mut agg = TwoFieldSumRate::default();
        agg.set_config(&serde_json::to_vec(&cfg).unwrap()).unwrap();
        agg
    }

    #[tokio::test]
    async fn percentage_of_matching_rows() {
        let mut agg = configured(json!({
            "field": {"molecular": "ok", "denominator": "total"},
            "rules": [{"field": "region", "value": "eu", "operator": "equal"}],
            "output_key": "success_rate",
            "extra": {"field": "order", "output_key": "orders"},
            "power": 2
        }));
        let eu = |id: &str, ok: f64, order: &str| {
            Record::new(id)
                .with_label("region", "eu")
                .with_label("order", order)
                .with_field("ok", ok)
                .with_field("total", 4.0)
        };
        agg.run("k", &eu("1", 3.0, "a")).await.unwrap();
        agg.run("k", &eu("2", 1.0, "null")).await.unwrap();
        agg.run("k", &Record::new("3").with_label("region", "us").with_field("ok", 9.0))
            .await
            .unwrap();

        assert_eq!(agg.metric(), ("success_rate".to_string(), 50.0));
        assert_eq!(agg.metric_extra(), Some(("orders".to_string(), json!(["a"]))));
    }

    #[tokio::test]
    async fn zero_denominator_counts_as_one() {
        let agg = configured(json!({
            "field": {"molecular": "ok", "denominator": "total"},
            "output_key": "r"
        }));
        assert_eq!(agg.metric(), ("r".to_string(), 0.0));
        assert!(agg.metric_extra().is_none());
    }

    #[test]
    fn fields_are_required() {
        let mut agg = TwoFieldSumRate::default();
        assert!(agg.set_config(br#"{"output_key":"r"}"#).is_err());
    }
}
