use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{fs, io};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::task::Task;

/// Persistence of task definitions and cycle progress.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Tasks in normal status.
    async fn get_active(&self) -> Result<Vec<Task>>;

    /// Records a committed run.
    async fn task_done(&self, name: &str, task_start: i64, last_finish_time: i64) -> Result<()>;

    /// Fails when the name is already taken.
    async fn add(&self, task: Task) -> Result<()>;

    async fn modify_output_index_name(&self, name: &str, index_name: &str) -> Result<()>;
}

fn apply_done(tasks: &mut BTreeMap<String, Task>, name: &str, start: i64, finish: i64) -> Result<()> {
    let task = tasks
        .get_mut(name)
        .ok_or_else(|| anyhow!("task {name} not found"))?;
    task.task_start = start;
    task.last_finish_time = finish;
    Ok(())
}

fn apply_add(tasks: &mut BTreeMap<String, Task>, task: Task) -> Result<()> {
    task.validate()?;
    if tasks.contains_key(&task.name) {
        anyhow::bail!("task {} already exists", task.name);
    }
    tasks.insert(task.name.clone(), task);
    Ok(())
}

fn apply_index_name(tasks: &mut BTreeMap<String, Task>, name: &str, index: &str) -> Result<()> {
    let task = tasks
        .get_mut(name)
        .ok_or_else(|| anyhow!("task {name} not found"))?;
    task.output_index_name = index.to_string();
    Ok(())
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<BTreeMap<String, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one task regardless of status.
    pub async fn task(&self, name: &str) -> Option<Task> {
        self.tasks.read().await.get(name).cloned()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get_active(&self) -> Result<Vec<Task>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.is_active())
            .cloned()
            .collect())
    }

    async fn task_done(&self, name: &str, task_start: i64, last_finish_time: i64) -> Result<()> {
        apply_done(&mut *self.tasks.write().await, name, task_start, last_finish_time)
    }

    async fn add(&self, task: Task) -> Result<()> {
        apply_add(&mut *self.tasks.write().await, task)
    }

    async fn modify_output_index_name(&self, name: &str, index_name: &str) -> Result<()> {
        apply_index_name(&mut *self.tasks.write().await, name, index_name)
    }
}

// ============================================================================
// JSON file store
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TaskFile {
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl TaskFile {
    pub fn load(path: &Path) -> Result<Self> {
        let data = match fs::read(path) {
            Ok(d) => d,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(err).context("reading task file"),
        };
        serde_json::from_slice(&data).context("parsing task file")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("creating task directory")?;
        }
        let tmp = path.with_extension("tmp");
        let data = serde_json::to_vec_pretty(self).context("serializing tasks")?;
        fs::write(&tmp, data).context("writing temp task file")?;
        fs::rename(&tmp, path).context("replacing task file")?;
        Ok(())
    }
}

/// Tasks kept in one JSON document, rewritten atomically on every change.
#[derive(Debug)]
pub struct JsonTaskStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonTaskStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = TaskFile::load(&path)?;
        info!(path = %path.display(), tasks = file.tasks.len(), "task store opened");
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, Task>> {
        Ok(TaskFile::load(&self.path)?
            .tasks
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect())
    }

    async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, Task>) -> Result<()>,
    {
        let _guard = self.write_lock.lock().await;
        let mut tasks = self.read_map()?;
        f(&mut tasks)?;
        TaskFile {
            tasks: tasks.into_values().collect(),
        }
        .save(&self.path)
    }
}

#[async_trait]
impl TaskStore for JsonTaskStore {
    async fn get_active(&self) -> Result<Vec<Task>> {
        Ok(self
            .read_map()?
            .into_values()
            .filter(Task::is_active)
            .collect())
    }

    async fn task_done(&self, name: &str, task_start: i64, last_finish_time: i64) -> Result<()> {
        self.update(|tasks| apply_done(tasks, name, task_start, last_finish_time))
            .await
    }

    async fn add(&self, task: Task) -> Result<()> {
        self.update(|tasks| apply_add(tasks, task)).await
    }

    async fn modify_output_index_name(&self, name: &str, index_name: &str) -> Result<()> {
        self.update(|tasks| apply_index_name(tasks, name, index_name))
            .await
    }
}
