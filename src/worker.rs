//! Bounded worker pool.
//! A fixed number of slots limits how many submitted futures run at once.
//! Errors and panics from workers are captured; the first one is reported by `wait`.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::guard::catch_panic;

/// How often `wait` checks whether every slot has been released.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(300);

// ============================================================================
// Pool Mode
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// The first failure aborts the pool: pending submissions are refused
    /// and `wait` returns without waiting for running work.
    FailFast,
    /// Failures are recorded; everything already started runs to completion.
    WaitAll,
}

// ============================================================================
// Worker Pool
// ============================================================================

#[derive(Debug)]
struct Shared {
    mode: PoolMode,
    abort: CancellationToken,
    error: Mutex<Option<anyhow::Error>>,
}

impl Shared {
    fn record(&self, err: anyhow::Error) {
        if let Ok(mut slot) = self.error.lock() {
            if slot.is_none() {
                *slot = Some(err);
            } else {
                debug!(error = %err, "worker pool: additional failure dropped");
            }
        }
        if self.mode == PoolMode::FailFast {
            self.abort.cancel();
        }
    }

    fn take_error(&self) -> Option<anyhow::Error> {
        self.error.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[derive(Debug)]
pub struct WorkerPool {
    size: usize,
    slots: Arc<Semaphore>,
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(size: usize, mode: PoolMode) -> Self {
        let size = size.max(1);
        Self {
            size,
            slots: Arc::new(Semaphore::new(size)),
            shared: Arc::new(Shared {
                mode,
                abort: CancellationToken::new(),
                error: Mutex::new(None),
            }),
        }
    }

    pub fn fail_fast(size: usize) -> Self {
        Self::new(size, PoolMode::FailFast)
    }

    pub fn wait_all(size: usize) -> Self {
        Self::new(size, PoolMode::WaitAll)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn mode(&self) -> PoolMode {
        self.shared.mode
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.abort.is_cancelled()
    }

    /// Refuses further submissions and releases anyone blocked in `submit` or `wait`.
    pub fn abort(&self) {
        self.shared.abort.cancel();
    }

    /// Waits for a free slot, then runs `work` on its own task.
    ///
    /// Returns `false` without running `work` when the pool was aborted first.
    pub async fn submit<F>(&self, work: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let permit = tokio::select! {
            biased;
            _ = self.shared.abort.cancelled() => return false,
            permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let _permit = permit;
            match catch_panic(work).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => shared.record(err),
                Err(panic) => {
                    warn!(%panic, "worker panicked");
                    shared.record(anyhow!("worker panicked: {panic}"));
                }
            }
        });
        true
    }

    /// Blocks until every slot is free (or the pool is aborted) and returns the first captured error.
    pub async fn wait(&self) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(WAIT_POLL_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = self.shared.abort.cancelled() => break,
                _ = ticker.tick() => {
                    if self.slots.available_permits() == self.size {
                        break;
                    }
                }
            }
        }
        match self.shared.take_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
