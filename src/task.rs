use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::time_windows::CycleType;

/// When a task may rerun before its current cycle has ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CycleMode {
    /// Only after the cycle has ended.
    EndOfCycle,
    /// At most once per local day while the cycle is open.
    InnerDay,
    /// Every scheduler pass.
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    #[default]
    Normal,
    Paused,
    PendingDelete,
}

/// A plugin reference: registry name plus its opaque configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default)]
    pub config: Value,
}

impl PluginConfig {
    pub fn new(name: impl Into<String>, config: Value) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, Value::Null)
    }

    /// Bytes handed to `set_config`; empty means "use defaults".
    pub fn raw_config(&self) -> Vec<u8> {
        match &self.config {
            Value::Null => Vec::new(),
            other => serde_json::to_vec(other).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub name: String,
}

fn default_cycles() -> u8 {
    1
}

/// Persistent definition and progress of one recurring metric computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub cycle: CycleType,
    pub cycle_mode: CycleMode,
    #[serde(default = "default_cycles")]
    pub calculate_cycles: u8,
    #[serde(default)]
    pub status: TaskStatus,
    /// Anchor timestamp (unix seconds) inside the most recent cycle to compute.
    pub task_start: i64,
    /// Unix seconds of the last successful run inside an open cycle; 0 = never.
    #[serde(default)]
    pub last_finish_time: i64,
    pub collector: PluginConfig,
    #[serde(default)]
    pub filters: Vec<PluginConfig>,
    pub aggregators: Vec<PluginConfig>,
    pub output: OutputConfig,
    #[serde(default)]
    pub output_index_name: String,
}

impl Task {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("task name is required");
        }
        if self.calculate_cycles == 0 {
            anyhow::bail!("task {}: calculate_cycles must be at least 1", self.name);
        }
        if self.aggregators.is_empty() {
            anyhow::bail!("task {}: at least one aggregator is required", self.name);
        }
        if self.collector.name.trim().is_empty() || self.output.name.trim().is_empty() {
            anyhow::bail!("task {}: collector and output names are required", self.name);
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Normal
    }
}

/// One cycle instance handed to aggregators and outputs before they run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleWindow {
    pub metric_name: String,
    pub begin: i64,
    pub end: i64,
    pub cycle: CycleType,
    pub mode: CycleMode,
    pub last_finish_time: i64,
}
