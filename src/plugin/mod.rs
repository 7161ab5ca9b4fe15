//! Plugin contracts for the four pipeline stages and the registry that builds them.

pub mod count;
pub mod elasticsearch;
pub mod json_rows;
pub mod labels;
pub mod log_output;
pub mod memory;
pub mod rules;
pub mod sum_rate;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::task::{CycleWindow, PluginConfig};
use crate::types::{MetricOutput, Record};

// ============================================================================
// Stage contracts
// ============================================================================

/// Lists aggregation keys and streams the records of one key.
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn set_config(&mut self, raw: &[u8]) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;
    /// Sends every record of `key` inside `[window.begin, window.end)`.
    async fn run(&self, key: &str, window: &CycleWindow, out: &RecordSender) -> Result<()>;
}

/// Inspects or rewrites a record in place. Instances are shared by all keys.
#[async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn set_config(&mut self, raw: &[u8]) -> Result<()>;
    async fn run(&self, key: &str, record: &mut Record) -> Result<()>;
}

/// Folds the records of one key into a value. A fresh instance serves each key.
#[async_trait]
pub trait Aggregator: Send {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn set_config(&mut self, raw: &[u8]) -> Result<()>;
    fn set_window(&mut self, window: &CycleWindow) -> Result<()>;
    async fn run(&mut self, key: &str, record: &Record) -> Result<()>;
    fn metric(&self) -> (String, f64);
    fn metric_extra(&self) -> Option<(String, Value)> {
        None
    }
}

/// Persists metric results for one cycle window.
#[async_trait]
pub trait Output: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn set_window(&mut self, window: &CycleWindow) -> Result<()>;
    async fn index_name(&self) -> Result<String>;
    /// True when `key` already has a result for the current window.
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn write(&self, metric: &MetricOutput) -> Result<()>;
}

/// Parses plugin config bytes; empty input yields the default config.
pub fn parse_config<T: DeserializeOwned + Default>(raw: &[u8]) -> Result<T> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(raw).context("parsing plugin config")
}

// ============================================================================
// Record channel
// ============================================================================

/// Sending half of a collector's record stream.
///
/// Owned by the pipeline; the stream closes when the collector call returns
/// and the pipeline drops it. Sends fail once the key is cancelled.
#[derive(Debug)]
pub struct RecordSender {
    tx: mpsc::Sender<Record>,
    cancel: CancellationToken,
}

impl RecordSender {
    pub fn new(tx: mpsc::Sender<Record>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    pub async fn send(&self, record: Record) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(anyhow!("record stream cancelled")),
            res = self.tx.send(record) => res.map_err(|_| anyhow!("record stream closed")),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ============================================================================
// Registry
// ============================================================================

pub type CollectorFactory = Arc<dyn Fn() -> Box<dyn Collector> + Send + Sync>;
pub type FilterFactory = Arc<dyn Fn() -> Box<dyn Filter> + Send + Sync>;
pub type AggregatorFactory = Arc<dyn Fn() -> Box<dyn Aggregator> + Send + Sync>;
pub type OutputFactory = Arc<dyn Fn() -> Box<dyn Output> + Send + Sync>;

/// Name-to-factory tables. Every lookup yields a fresh instance.
#[derive(Default, Clone)]
pub struct Registry {
    collectors: BTreeMap<String, CollectorFactory>,
    filters: BTreeMap<String, FilterFactory>,
    aggregators: BTreeMap<String, AggregatorFactory>,
    outputs: BTreeMap<String, OutputFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with every plugin that needs no external service.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register_collector(json_rows::NAME, || Box::new(json_rows::JsonRowsCollector::default()));
        reg.register_filter(labels::DEFAULT_NAME, || Box::new(labels::LabelDefault::default()));
        reg.register_filter(labels::REQUIRE_NAME, || Box::new(labels::RequireLabels::default()));
        reg.register_aggregator(count::NAME, || Box::new(count::CountAggregator::default()));
        reg.register_aggregator(sum_rate::NAME, || {
            Box::new(sum_rate::TwoFieldSumRate::default())
        });
        reg.register_output(log_output::NAME, || Box::new(log_output::LogOutput::default()));
        reg
    }

    pub fn register_collector<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Collector> + Send + Sync + 'static,
    {
        self.collectors.insert(name.into(), Arc::new(factory));
    }

    pub fn register_filter<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Filter> + Send + Sync + 'static,
    {
        self.filters.insert(name.into(), Arc::new(factory));
    }

    pub fn register_aggregator<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Aggregator> + Send + Sync + 'static,
    {
        self.aggregators.insert(name.into(), Arc::new(factory));
    }

    pub fn register_output<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Output> + Send + Sync + 'static,
    {
        self.outputs.insert(name.into(), Arc::new(factory));
    }

    /// Fresh, configured collector.
    pub fn collector(&self, cfg: &PluginConfig) -> Result<Box<dyn Collector>> {
        let factory = self
            .collectors
            .get(&cfg.name)
            .ok_or_else(|| anyhow!("collector plugin {} is not registered", cfg.name))?;
        let mut plugin = factory();
        plugin
            .set_config(&cfg.raw_config())
            .with_context(|| format!("configuring collector {}", cfg.name))?;
        Ok(plugin)
    }

    pub fn filter(&self, cfg: &PluginConfig) -> Result<Box<dyn Filter>> {
        let factory = self
            .filters
            .get(&cfg.name)
            .ok_or_else(|| anyhow!("filter plugin {} is not registered", cfg.name))?;
        let mut plugin = factory();
        plugin
            .set_config(&cfg.raw_config())
            .with_context(|| format!("configuring filter {}", cfg.name))?;
        Ok(plugin)
    }

    pub fn aggregator(&self, cfg: &PluginConfig) -> Result<Box<dyn Aggregator>> {
        let factory = self
            .aggregators
            .get(&cfg.name)
            .ok_or_else(|| anyhow!("aggregator plugin {} is not registered", cfg.name))?;
        let mut plugin = factory();
        plugin
            .set_config(&cfg.raw_config())
            .with_context(|| format!("configuring aggregator {}", cfg.name))?;
        Ok(plugin)
    }

    /// Fresh output bound to `window`.
    pub fn output(&self, name: &str, window: &CycleWindow) -> Result<Box<dyn Output>> {
        let factory = self
            .outputs
            .get(name)
            .ok_or_else(|| anyhow!("output plugin {name} is not registered"))?;
        let mut plugin = factory();
        plugin
            .set_window(window)
            .with_context(|| format!("binding output {name} to window"))?;
        Ok(plugin)
    }

    /// `(stage, name, description)` of every registered plugin.
    pub fn catalog(&self) -> Vec<(&'static str, String, String)> {
        let mut out = Vec::new();
        for (name, f) in &self.collectors {
            out.push(("collector", name.clone(), f().description().to_string()));
        }
        for (name, f) in &self.filters {
            out.push(("filter", name.clone(), f().description().to_string()));
        }
        for (name, f) in &self.aggregators {
            out.push(("aggregator", name.clone(), f().description().to_string()));
        }
        for (name, f) in &self.outputs {
            out.push(("output", name.clone(), f().description().to_string()));
        }
        out
    }
}
