//! Polling loop that runs every active task once per pass.
//! Tasks run one after another; a pass that finishes quickly is followed by a short pause.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::executor::{ExecError, RunOutcome, TaskExecutor};
use crate::store::TaskStore;

pub const DEFAULT_PASS_FLOOR: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Passes shorter than this are followed by a pause.
    pub pass_floor: Duration,
    /// Upper bound of that pause.
    pub idle_pause: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            pass_floor: DEFAULT_PASS_FLOOR,
            idle_pause: DEFAULT_IDLE_PAUSE,
        }
    }
}

/// Pause after a pass that took `elapsed`; `None` when no pause is needed.
pub fn pass_pause(elapsed: Duration, settings: &SchedulerSettings) -> Option<Duration> {
    if elapsed >= settings.pass_floor {
        return None;
    }
    Some((settings.pass_floor - elapsed).min(settings.idle_pause))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub tasks: usize,
    pub committed: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    executor: TaskExecutor,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(store: Arc<dyn TaskStore>, executor: TaskExecutor, settings: SchedulerSettings) -> Self {
        Self {
            store,
            executor,
            settings,
        }
    }

    /// Loops until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            pass_floor = ?self.settings.pass_floor,
            idle_pause = ?self.settings.idle_pause,
            "scheduler started"
        );
        while !shutdown.is_cancelled() {
            let started = Instant::now();
            let stats = self.run_pass(&shutdown).await;
            info!(
                tasks = stats.tasks,
                committed = stats.committed,
                skipped = stats.skipped,
                failed = stats.failed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "scheduler pass finished"
            );
            if let Some(pause) = pass_pause(started.elapsed(), &self.settings) {
                if shutdown
                    .run_until_cancelled(tokio::time::sleep(pause))
                    .await
                    .is_none()
                {
                    break;
                }
            }
        }
        info!("scheduler stopped");
    }

    /// Runs every active task once, in store order.
    pub async fn run_pass(&self, shutdown: &CancellationToken) -> PassStats {
        let mut stats = PassStats::default();
        let tasks = match self.store.get_active().await {
            Ok(tasks) => tasks,
            Err(err) => {
                error!(error = %err, "listing active tasks failed");
                return stats;
            }
        };

        for task in tasks {
            if shutdown.is_cancelled() {
                break;
            }
            stats.tasks += 1;
            match self.executor.run(&task, shutdown).await {
                Ok(RunOutcome::Committed { .. }) => stats.committed += 1,
                Ok(RunOutcome::Skipped(_)) => stats.skipped += 1,
                Err(ExecError::Cancelled) => {
                    warn!(task = %task.name, "task run cancelled");
                    stats.failed += 1;
                }
                Err(err) => {
                    error!(task = %task.name, error = %err, "task run failed");
                    stats.failed += 1;
                }
            }
        }
        stats
    }
}
