//! Run-wide and per-key cancellation with a sticky first-failure slot.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Shared by every stage of one task run.
#[derive(Debug)]
pub struct RunGuard {
    task: String,
    token: CancellationToken,
    failure: OnceLock<String>,
}

impl RunGuard {
    pub fn new(task: impl Into<String>, parent: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            task: task.into(),
            token: parent.child_token(),
            failure: OnceLock::new(),
        })
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run-fatal: records the failure (first one wins) and cancels every stage.
    pub fn fail(&self, reason: impl Into<String>) {
        self.record(reason.into());
        self.token.cancel();
    }

    /// Marks the run unsuccessful without stopping unrelated work.
    pub fn mark_failed(&self, reason: impl Into<String>) {
        self.record(reason.into());
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.get().map(String::as_str)
    }

    pub fn key(self: &Arc<Self>, key: impl Into<String>) -> KeyGuard {
        KeyGuard {
            key: key.into(),
            token: self.token.child_token(),
            run: Arc::clone(self),
        }
    }

    fn record(&self, reason: String) {
        if self.failure.set(reason.clone()).is_ok() {
            warn!(task = %self.task, %reason, "task run marked failed");
        }
    }
}

/// Cancellation scope of one aggregation key's collect/filter/aggregate chain.
#[derive(Debug, Clone)]
pub struct KeyGuard {
    key: String,
    token: CancellationToken,
    run: Arc<RunGuard>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Key-fatal: stops this key's chain and keeps the run from committing.
    pub fn fail(&self, reason: impl std::fmt::Display) {
        if !self.token.is_cancelled() {
            self.run
                .mark_failed(format!("key {}: {}", self.key, reason));
        }
        self.token.cancel();
    }
}

/// Awaits `fut`, turning a panic into its message.
pub async fn catch_panic<F: Future>(fut: F) -> Result<F::Output, String> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|payload| panic_message(payload.as_ref()))
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
