//! Elasticsearch output: one index per metric, one document per key and window.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::debug;

use super::Output;
use crate::es_http::EsHttp;
use crate::task::CycleWindow;
use crate::time_windows::day_start;
use crate::types::MetricOutput;

pub const NAME: &str = "elasticsearch";

#[derive(Debug, Clone)]
pub struct EsOutputConfig {
    pub url: Arc<str>,
    pub user: Arc<str>,
    pub pass: Arc<str>,
    pub index_prefix: Arc<str>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct EsOutput {
    http: EsHttp,
    index_prefix: Arc<str>,
    window: Option<CycleWindow>,
}

impl EsOutput {
    pub fn new(http: EsHttp, index_prefix: impl Into<Arc<str>>) -> Self {
        Self {
            http,
            index_prefix: index_prefix.into(),
            window: None,
        }
    }

    pub fn connect(cfg: &EsOutputConfig) -> Result<Self> {
        let http = EsHttp::new(
            cfg.url.clone(),
            cfg.user.clone(),
            cfg.pass.clone(),
            cfg.timeout,
        )?;
        Ok(Self::new(http, cfg.index_prefix.clone()))
    }

    fn window(&self) -> Result<&CycleWindow> {
        self.window
            .as_ref()
            .context("elasticsearch output used before a window was set")
    }

    fn doc_path(&self, key: &str) -> Result<String> {
        let window = self.window()?;
        Ok(format!(
            "{}/_doc/{}",
            index_for(&self.index_prefix, &window.metric_name),
            doc_id(window.begin, key)
        ))
    }
}

/// Lowercase index name; characters Elasticsearch rejects become `-`.
pub fn index_for(prefix: &str, metric_name: &str) -> String {
    let name: String = metric_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("{}-metric-{}", prefix.to_ascii_lowercase(), name)
}

/// Deterministic id, so rewriting a key in the same window replaces its document.
pub fn doc_id(begin: i64, key: &str) -> String {
    let hex: String = key.bytes().map(|b| format!("{b:02x}")).collect();
    format!("{begin}-{hex}")
}

#[async_trait]
impl Output for EsOutput {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "stores metric results as elasticsearch documents"
    }

    fn set_window(&mut self, window: &CycleWindow) -> Result<()> {
        self.window = Some(window.clone());
        Ok(())
    }

    async fn index_name(&self) -> Result<String> {
        Ok(index_for(&self.index_prefix, &self.window()?.metric_name))
    }

    /// Only results written today, after the last finished run, count.
    async fn exists(&self, key: &str) -> Result<bool> {
        let window = self.window()?;
        if window.last_finish_time < day_start(Utc::now().timestamp())? {
            return Ok(false);
        }
        let Some(doc) = self
            .http
            .get_optional(&self.doc_path(key)?, "es metric lookup")
            .await?
        else {
            return Ok(false);
        };
        let mtime = doc
            .pointer("/_source/mtime")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        Ok(mtime > window.last_finish_time)
    }

    async fn write(&self, metric: &MetricOutput) -> Result<()> {
        let window = self.window()?;
        let body = json!({
            "metric_name": window.metric_name,
            "metric_key": metric.key,
            "cycle": window.cycle,
            "start_time": window.begin,
            "end_time": window.end,
            "values": metric.values,
            "extra": metric.extra,
            "mtime": Utc::now().timestamp(),
        });
        let path = self.doc_path(&metric.key)?;
        self.http.put_value(&path, &body, "es metric write").await?;
        debug!(path = %path, "metric document written");
        Ok(())
    }
}
