use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::Output;
use crate::task::CycleWindow;
use crate::types::MetricOutput;

pub const NAME: &str = "log";

/// Emits results as structured log lines; never reports existing keys.
#[derive(Debug, Default)]
pub struct LogOutput {
    window: Option<CycleWindow>,
}

impl LogOutput {
    fn window(&self) -> Result<&CycleWindow> {
        self.window.as_ref().context("log output used before a window was set")
    }
}

#[async_trait]
impl Output for LogOutput {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "writes metric results to the log"
    }

    fn set_window(&mut self, window: &CycleWindow) -> Result<()> {
        self.window = Some(window.clone());
        Ok(())
    }

    async fn index_name(&self) -> Result<String> {
        Ok(format!("log-{}", self.window()?.metric_name))
    }

    async fn exists(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }

    async fn write(&self, metric: &MetricOutput) -> Result<()> {
        let window = self.window()?;
        info!(
            metric = %window.metric_name,
            begin = window.begin,
            end = window.end,
            key = %metric.key,
            values = ?metric.values,
            extra = ?metric.extra,
            "metric result"
        );
        Ok(())
    }
}
