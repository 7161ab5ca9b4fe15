use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;

use super::Output;
use crate::task::CycleWindow;
use crate::types::MetricOutput;

pub const NAME: &str = "memory";

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMetric {
    pub window: CycleWindow,
    pub metric: MetricOutput,
    pub written_at: i64,
}

/// In-process result store shared by every [`MemoryOutput`] it hands out.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<StoredMetric>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(&self) -> MemoryOutput {
        MemoryOutput {
            sink: self.clone(),
            window: None,
        }
    }

    pub fn factory(&self) -> impl Fn() -> Box<dyn Output> + Send + Sync + 'static {
        let sink = self.clone();
        move || Box::new(sink.output())
    }

    /// Upserts by metric name, window begin and key.
    pub fn insert(&self, window: &CycleWindow, metric: MetricOutput, written_at: i64) -> Result<()> {
        let mut entries = self.lock()?;
        entries.retain(|e| {
            !(e.window.metric_name == window.metric_name
                && e.window.begin == window.begin
                && e.metric.key == metric.key)
        });
        entries.push(StoredMetric {
            window: window.clone(),
            metric,
            written_at,
        });
        Ok(())
    }

    pub fn entries(&self) -> Vec<StoredMetric> {
        self.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn find(&self, metric_name: &str, begin: i64, key: &str) -> Option<StoredMetric> {
        self.entries().into_iter().find(|e| {
            e.window.metric_name == metric_name && e.window.begin == begin && e.metric.key == key
        })
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<StoredMetric>>> {
        self.entries.lock().map_err(|_| anyhow!("memory sink poisoned"))
    }
}

#[derive(Debug)]
pub struct MemoryOutput {
    sink: MemorySink,
    window: Option<CycleWindow>,
}

impl MemoryOutput {
    fn window(&self) -> Result<&CycleWindow> {
        self.window
            .as_ref()
            .context("memory output used before a window was set")
    }
}

#[async_trait]
impl Output for MemoryOutput {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "keeps metric results in process memory"
    }

    fn set_window(&mut self, window: &CycleWindow) -> Result<()> {
        self.window = Some(window.clone());
        Ok(())
    }

    async fn index_name(&self) -> Result<String> {
        Ok(format!("memory-{}", self.window()?.metric_name))
    }

    /// A key exists once written after the window's last finish time.
    async fn exists(&self, key: &str) -> Result<bool> {
        let window = self.window()?;
        Ok(self
            .sink
            .find(&window.metric_name, window.begin, key)
            .is_some_and(|e| e.written_at > window.last_finish_time))
    }

    async fn write(&self, metric: &MetricOutput) -> Result<()> {
        let window = self.window()?;
        self.sink
            .insert(window, metric.clone(), Utc::now().timestamp())
    }
}
