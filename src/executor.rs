//! Per-task state machine: lock, eligibility, windows, commit, unlock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::guard::{catch_panic, RunGuard};
use crate::lock::{task_lock_key, DistributedLock, LockError, LockStore};
use crate::pipeline::{self, PipelineSettings, RunPlugins};
use crate::plugin::{Collector, Registry};
use crate::store::TaskStore;
use crate::task::{CycleMode, CycleWindow, Task};
use crate::time_windows::{day_start, interval, CycleError};

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(12 * 60);
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// How long a timed-out run may take to wind down after cancellation.
pub const CANCEL_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Cycle(#[from] CycleError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("plugin setup failed: {0:#}")]
    Plugin(anyhow::Error),
    #[error("task store error: {0:#}")]
    Store(anyhow::Error),
    #[error("run failed: {0}")]
    Failed(String),
    #[error("run exceeded {0:?}")]
    TimedOut(Duration),
    #[error("run cancelled")]
    Cancelled,
    #[error("run panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    LockHeld,
    NotDue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Skipped(SkipReason),
    Committed {
        task_start: i64,
        last_finish_time: i64,
        written: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// The first window has ended; a successful run moves to the next cycle.
    Advance,
    /// The cycle is still open but the mode allows a recomputation.
    Refresh,
    NotDue,
}

pub fn eligibility(
    first: &CycleWindow,
    mode: CycleMode,
    last_finish_time: i64,
    now: i64,
    today_start: i64,
) -> Eligibility {
    if now >= first.end {
        return Eligibility::Advance;
    }
    match mode {
        CycleMode::Always => Eligibility::Refresh,
        CycleMode::InnerDay if today_start > last_finish_time => Eligibility::Refresh,
        _ => Eligibility::NotDue,
    }
}

/// `calculate_cycles` windows walking backward; window 0 contains `task_start`.
pub fn plan_windows(task: &Task) -> Result<Vec<CycleWindow>, CycleError> {
    let count = task.calculate_cycles.max(1);
    let mut windows = Vec::with_capacity(usize::from(count));
    let mut anchor = task.task_start;
    for _ in 0..count {
        let span = interval(anchor, task.cycle)?;
        windows.push(CycleWindow {
            metric_name: task.name.clone(),
            begin: span.begin,
            end: span.end,
            cycle: task.cycle,
            mode: task.cycle_mode,
            last_finish_time: task.last_finish_time,
        });
        anchor = span.begin - 1;
    }
    Ok(windows)
}

/// Begin of the cycle after `first`, located from a point half a cycle past its end.
pub fn next_task_start(first: &CycleWindow) -> Result<i64, CycleError> {
    let probe = first.end + (first.end - first.begin) / 2;
    Ok(interval(probe, first.cycle)?.begin)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub lock_ttl: Duration,
    pub execution_timeout: Duration,
    pub pipeline: PipelineSettings,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            pipeline: PipelineSettings::default(),
        }
    }
}

pub struct TaskExecutor {
    store: Arc<dyn TaskStore>,
    locks: Arc<dyn LockStore>,
    registry: Arc<Registry>,
    settings: ExecutorSettings,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        locks: Arc<dyn LockStore>,
        registry: Arc<Registry>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            locks,
            registry,
            settings,
        }
    }

    /// Runs `task` once if its lock is free and it is due.
    pub async fn run(
        &self,
        task: &Task,
        shutdown: &CancellationToken,
    ) -> Result<RunOutcome, ExecError> {
        let span = tracing::info_span!("task_run", task = %task.name);
        self.run_inner(task, shutdown).instrument(span).await
    }

    async fn run_inner(
        &self,
        task: &Task,
        shutdown: &CancellationToken,
    ) -> Result<RunOutcome, ExecError> {
        let lock = DistributedLock::new(Arc::clone(&self.locks));
        let key = task_lock_key(&task.name);
        if !lock.lock(&key, self.settings.lock_ttl).await? {
            debug!("task lock held elsewhere");
            return Ok(RunOutcome::Skipped(SkipReason::LockHeld));
        }
        debug!(owner = lock.token(), "task lock acquired");

        let result = match catch_panic(self.run_locked(task, shutdown)).await {
            Ok(result) => result,
            Err(panic) => Err(ExecError::Panicked(panic)),
        };

        if let Err(err) = lock.unlock(&key).await {
            warn!(error = %err, "releasing task lock failed");
        }
        result
    }

    async fn run_locked(
        &self,
        task: &Task,
        shutdown: &CancellationToken,
    ) -> Result<RunOutcome, ExecError> {
        let now = Utc::now().timestamp();
        let windows = plan_windows(task)?;
        let Some(first) = windows.first() else {
            return Err(ExecError::Failed("no cycle window planned".to_string()));
        };
        let decision = eligibility(
            first,
            task.cycle_mode,
            task.last_finish_time,
            now,
            day_start(now)?,
        );
        if decision == Eligibility::NotDue {
            debug!(end = first.end, "cycle still open, not due");
            return Ok(RunOutcome::Skipped(SkipReason::NotDue));
        }

        let plugins = self.resolve_plugins(task).map_err(ExecError::Plugin)?;
        self.sync_index_name(task, first).await?;

        let guard = RunGuard::new(&task.name, shutdown);
        let work = self.run_windows(&task.output.name, &plugins, &windows, &guard);
        tokio::pin!(work);
        let timeout = self.settings.execution_timeout;
        let written = match tokio::time::timeout(timeout, &mut work).await {
            Ok(written) => written,
            Err(_) => {
                guard.fail(format!("execution exceeded {timeout:?}"));
                if tokio::time::timeout(CANCEL_GRACE, work).await.is_err() {
                    warn!("run ignored cancellation, abandoning it");
                }
                return Err(ExecError::TimedOut(timeout));
            }
        };

        if let Some(reason) = guard.failure() {
            return Err(ExecError::Failed(reason.to_string()));
        }
        if guard.is_cancelled() {
            return Err(ExecError::Cancelled);
        }

        // A refresh records when it finished, not when it was planned; results
        // written during the run must not look newer than the commit.
        let (task_start, last_finish_time) = match decision {
            Eligibility::Advance => (next_task_start(first)?, 0),
            _ => (task.task_start, Utc::now().timestamp()),
        };
        self.store
            .task_done(&task.name, task_start, last_finish_time)
            .await
            .map_err(ExecError::Store)?;
        info!(task_start, last_finish_time, written, "task run committed");
        Ok(RunOutcome::Committed {
            task_start,
            last_finish_time,
            written,
        })
    }

    fn resolve_plugins(&self, task: &Task) -> anyhow::Result<RunPlugins> {
        let collector: Arc<dyn Collector> = Arc::from(self.registry.collector(&task.collector)?);
        let filters = task
            .filters
            .iter()
            .map(|cfg| self.registry.filter(cfg))
            .collect::<anyhow::Result<Vec<_>>>()?;
        for cfg in &task.aggregators {
            self.registry.aggregator(cfg)?;
        }
        Ok(RunPlugins {
            collector,
            filters: Arc::new(filters),
            aggregators: Arc::new(task.aggregators.clone()),
        })
    }

    /// Persists the output's index name when it differs from the cached one.
    async fn sync_index_name(&self, task: &Task, first: &CycleWindow) -> Result<(), ExecError> {
        let output = self
            .registry
            .output(&task.output.name, first)
            .map_err(ExecError::Plugin)?;
        let index = output.index_name().await.map_err(ExecError::Plugin)?;
        if index == task.output_index_name {
            return Ok(());
        }
        match self.store.modify_output_index_name(&task.name, &index).await {
            Ok(()) => info!(index = %index, "output index name updated"),
            Err(err) => warn!(index = %index, error = %err, "persisting output index name failed"),
        }
        Ok(())
    }

    async fn run_windows(
        &self,
        output_name: &str,
        plugins: &RunPlugins,
        windows: &[CycleWindow],
        guard: &Arc<RunGuard>,
    ) -> usize {
        let mut written = 0;
        for window in windows {
            if guard.is_cancelled() {
                break;
            }
            let output = match self.registry.output(output_name, window) {
                Ok(output) => Arc::from(output),
                Err(err) => {
                    guard.fail(format!("{err:#}"));
                    break;
                }
            };
            let stats = pipeline::run_window(
                Arc::clone(&self.registry),
                plugins.clone(),
                output,
                window.clone(),
                Arc::clone(guard),
                self.settings.pipeline,
            )
            .await;
            written += stats.written;
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_windows::CycleType;

    fn window(begin: i64, end: i64) -> CycleWindow {
        CycleWindow {
            metric_name: "m".to_string(),
            begin,
            end,
            cycle: CycleType::Day,
            mode: CycleMode::EndOfCycle,
            last_finish_time: 0,
        }
    }

    #[test]
    fn ended_cycle_always_advances() {
        let w = window(0, 100);
        for mode in [CycleMode::EndOfCycle, CycleMode::InnerDay, CycleMode::Always] {
            assert_eq!(eligibility(&w, mode, 0, 100, 0), Eligibility::Advance);
        }
    }

    #[test]
    fn open_cycle_depends_on_mode() {
        let w = window(0, 100);
        assert_eq!(eligibility(&w, CycleMode::EndOfCycle, 0, 50, 40), Eligibility::NotDue);
        assert_eq!(eligibility(&w, CycleMode::Always, 45, 50, 40), Eligibility::Refresh);
        assert_eq!(eligibility(&w, CycleMode::InnerDay, 30, 50, 40), Eligibility::Refresh);
        assert_eq!(eligibility(&w, CycleMode::InnerDay, 45, 50, 40), Eligibility::NotDue);
    }
}
