//! Shared fixtures for the executor and scheduler tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use cyclemetric::executor::{ExecutorSettings, TaskExecutor};
use cyclemetric::lock::MemoryLockStore;
use cyclemetric::plugin::memory::{self, MemorySink};
use cyclemetric::plugin::{Aggregator, Collector, Filter, Output, RecordSender, Registry};
use cyclemetric::store::{MemoryTaskStore, TaskStore};
use cyclemetric::task::{CycleMode, CycleWindow, OutputConfig, PluginConfig, Task, TaskStatus};
use cyclemetric::time_windows::CycleType;
use cyclemetric::types::{MetricOutput, Record};

pub fn now() -> i64 {
    Utc::now().timestamp()
}

/// user1 -> 1, user2 -> 2, user3 -> 2 under `count_rule_config`.
pub fn fixture_rows() -> Value {
    json!([
        {"id": "1", "user": "user1", "label2": "b", "amount": 10},
        {"id": "2", "user": "user2", "label2": "b", "amount": 5},
        {"id": "3", "user": "user2", "label2": "b", "amount": 7},
        {"id": "3", "user": "user2", "label2": "b", "amount": 7},
        {"id": "4", "user": "user3", "label2": "b", "amount": 1},
        {"id": "5", "user": "user3", "label2": "b", "amount": 2},
        {"id": "6", "user": "user3", "label2": "c", "amount": 3}
    ])
}

pub fn count_rule_config() -> Value {
    json!({
        "output_key": "cnt",
        "rules": [
            {"field": "user", "operator": "equal_key"},
            {"field": "label2", "value": "b", "operator": "equal"}
        ]
    })
}

pub fn rows_task(name: &str, cycle: CycleType, mode: CycleMode, task_start: i64) -> Task {
    Task {
        name: name.to_string(),
        cycle,
        cycle_mode: mode,
        calculate_cycles: 1,
        status: TaskStatus::Normal,
        task_start,
        last_finish_time: 0,
        collector: PluginConfig::new("json_rows", json!({ "rows": fixture_rows() })),
        filters: Vec::new(),
        aggregators: vec![PluginConfig::new("count", count_rule_config())],
        output: OutputConfig {
            name: memory::NAME.to_string(),
        },
        output_index_name: String::new(),
    }
}

pub fn fast_settings() -> ExecutorSettings {
    ExecutorSettings::default()
}

pub struct Harness {
    pub store: Arc<MemoryTaskStore>,
    pub locks: Arc<MemoryLockStore>,
    pub sink: MemorySink,
    pub registry: Registry,
}

impl Harness {
    pub fn new() -> Self {
        let sink = MemorySink::new();
        let mut registry = Registry::with_builtins();
        registry.register_output(memory::NAME, sink.factory());
        Self {
            store: Arc::new(MemoryTaskStore::new()),
            locks: Arc::new(MemoryLockStore::new()),
            sink,
            registry,
        }
    }

    pub async fn add(&self, task: Task) {
        self.store.add(task).await.unwrap();
    }

    pub fn executor(&self, settings: ExecutorSettings) -> TaskExecutor {
        TaskExecutor::new(
            self.store.clone(),
            self.locks.clone(),
            Arc::new(self.registry.clone()),
            settings,
        )
    }

    pub fn value(&self, window: &CycleWindow, key: &str, name: &str) -> Option<f64> {
        self.sink
            .find(&window.metric_name, window.begin, key)
            .and_then(|e| e.metric.value(name))
    }
}

// ============================================================================
// Scripted plugins
// ============================================================================

/// Serves fixed records per key; `fail_first` attempts per key error out.
pub struct ScriptedCollector {
    pub keys: Result<Vec<String>, String>,
    pub records: HashMap<String, Vec<Record>>,
    pub fail_first: u32,
    pub attempts: Arc<Mutex<HashMap<String, u32>>>,
}

impl ScriptedCollector {
    pub fn new(records: HashMap<String, Vec<Record>>) -> Self {
        let mut keys: Vec<String> = records.keys().cloned().collect();
        keys.sort();
        Self {
            keys: Ok(keys),
            records,
            fail_first: 0,
            attempts: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl Collector for ScriptedCollector {
    fn name(&self) -> &str {
        "scripted"
    }

    fn description(&self) -> &str {
        "test collector"
    }

    fn set_config(&mut self, _raw: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.keys.clone().map_err(anyhow::Error::msg)
    }

    async fn run(&self, key: &str, _window: &CycleWindow, out: &RecordSender) -> Result<()> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(key.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        if attempt <= self.fail_first {
            anyhow::bail!("transient failure {attempt} for {key}");
        }
        for record in self.records.get(key).cloned().unwrap_or_default() {
            out.send(record).await?;
        }
        Ok(())
    }
}

/// Sleeps in small steps until the stream is cancelled.
pub struct StallingCollector;

#[async_trait]
impl Collector for StallingCollector {
    fn name(&self) -> &str {
        "stalling"
    }

    fn description(&self) -> &str {
        "never finishes on its own"
    }

    fn set_config(&mut self, _raw: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(vec!["slow".to_string()])
    }

    async fn run(&self, _key: &str, _window: &CycleWindow, out: &RecordSender) -> Result<()> {
        for _ in 0..400 {
            if out.is_cancelled() {
                anyhow::bail!("stopped");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        Ok(())
    }
}

/// Emits one record per key after a delay long enough to cross a second boundary.
pub struct DelayedCollector {
    pub delay: Duration,
}

#[async_trait]
impl Collector for DelayedCollector {
    fn name(&self) -> &str {
        "delayed"
    }

    fn description(&self) -> &str {
        "slow single-record source"
    }

    fn set_config(&mut self, _raw: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(vec!["user1".to_string()])
    }

    async fn run(&self, key: &str, _window: &CycleWindow, out: &RecordSender) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        out.send(Record::new("1").with_label("user", key)).await
    }
}

/// Output whose existence checks and writes always fail.
pub struct BrokenOutput;

#[async_trait]
impl Output for BrokenOutput {
    fn name(&self) -> &str {
        "broken"
    }

    fn description(&self) -> &str {
        "rejects every call"
    }

    fn set_window(&mut self, _window: &CycleWindow) -> Result<()> {
        Ok(())
    }

    async fn index_name(&self) -> Result<String> {
        Ok("broken".to_string())
    }

    async fn exists(&self, _key: &str) -> Result<bool> {
        anyhow::bail!("index unreachable")
    }

    async fn write(&self, _metric: &MetricOutput) -> Result<()> {
        anyhow::bail!("disk full")
    }
}

/// Fails every record of one key.
pub struct RejectKey(pub &'static str);

#[async_trait]
impl Filter for RejectKey {
    fn name(&self) -> &str {
        "reject_key"
    }

    fn description(&self) -> &str {
        "fails records of one key"
    }

    fn set_config(&mut self, _raw: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn run(&self, key: &str, _record: &mut Record) -> Result<()> {
        if key == self.0 {
            anyhow::bail!("rejected {key}");
        }
        Ok(())
    }
}

/// Counts records per fingerprint it saw, shared across instances.
pub struct SeenCounter {
    pub seen: Arc<AtomicU32>,
}

#[async_trait]
impl Aggregator for SeenCounter {
    fn name(&self) -> &str {
        "seen"
    }

    fn description(&self) -> &str {
        "counts every record"
    }

    fn set_config(&mut self, _raw: &[u8]) -> Result<()> {
        Ok(())
    }

    fn set_window(&mut self, _window: &CycleWindow) -> Result<()> {
        Ok(())
    }

    async fn run(&mut self, _key: &str, _record: &Record) -> Result<()> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn metric(&self) -> (String, f64) {
        ("seen".to_string(), f64::from(self.seen.load(Ordering::SeqCst)))
    }
}

pub struct PanickingAggregator;

#[async_trait]
impl Aggregator for PanickingAggregator {
    fn name(&self) -> &str {
        "panicking"
    }

    fn description(&self) -> &str {
        "panics on the first record"
    }

    fn set_config(&mut self, _raw: &[u8]) -> Result<()> {
        Ok(())
    }

    fn set_window(&mut self, _window: &CycleWindow) -> Result<()> {
        Ok(())
    }

    async fn run(&mut self, _key: &str, _record: &Record) -> Result<()> {
        panic!("aggregator exploded");
    }

    fn metric(&self) -> (String, f64) {
        ("never".to_string(), 0.0)
    }
}

pub fn records_for(key: &str, ids: &[&str]) -> HashMap<String, Vec<Record>> {
    let records = ids
        .iter()
        .map(|id| Record::new(*id).with_label("user", key))
        .collect();
    HashMap::from([(key.to_string(), records)])
}

/// Registers a [`ScriptedCollector`] under `name`; returns its attempt counter.
pub fn register_scripted(
    registry: &mut Registry,
    name: &str,
    keys: Result<Vec<String>, String>,
    records: HashMap<String, Vec<Record>>,
    fail_first: u32,
) -> Arc<Mutex<HashMap<String, u32>>> {
    let attempts = Arc::new(Mutex::new(HashMap::new()));
    let shared = attempts.clone();
    registry.register_collector(name, move || {
        Box::new(ScriptedCollector {
            keys: keys.clone(),
            records: records.clone(),
            fail_first,
            attempts: shared.clone(),
        })
    });
    attempts
}

pub fn attempts_for(attempts: &Arc<Mutex<HashMap<String, u32>>>, key: &str) -> u32 {
    attempts.lock().unwrap().get(key).copied().unwrap_or(0)
}
