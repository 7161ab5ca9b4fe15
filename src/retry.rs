use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_ATTEMPTS: u32 = 3;
pub const MIN_DELAY: Duration = Duration::from_millis(100);

/// Fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            delay: MIN_DELAY,
        }
    }
}

impl RetryPolicy {
    /// At least one attempt; delays shorter than [`MIN_DELAY`] are raised to it.
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay: delay.max(MIN_DELAY),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

/// Runs `op` until it succeeds or the attempts are spent, returning the last error.
///
/// `op` receives the zero-based attempt number. Cancellation interrupts the
/// wait between attempts and ends the loop with the most recent error.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        attempt += 1;
        if attempt >= policy.attempts || cancel.is_cancelled() {
            return Err(err);
        }
        debug!(attempt, error = %err, "retrying after failure");
        if cancel
            .run_until_cancelled(tokio::time::sleep(policy.delay))
            .await
            .is_none()
        {
            return Err(err);
        }
    }
}
