//! Tests for bounded, cancellation-aware retry.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use cyclemetric::retry::{retry, RetryPolicy, MIN_DELAY};
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn test_succeeds_after_transient_failures() {
    let calls = AtomicU32::new(0);
    let policy = RetryPolicy::new(3, Duration::from_millis(100));
    let result: Result<&str, String> = retry(&policy, &CancellationToken::new(), |attempt| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt < 2 {
                Err(format!("attempt {attempt}"))
            } else {
                Ok("done")
            }
        }
    })
    .await;

    assert_eq!(result, Ok("done"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_returns_last_error_when_exhausted() {
    let policy = RetryPolicy::new(3, Duration::from_millis(100));
    let result: Result<(), String> = retry(&policy, &CancellationToken::new(), |attempt| async move {
        Err(format!("attempt {attempt}"))
    })
    .await;

    assert_eq!(result, Err("attempt 2".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_retrying() {
    let calls = AtomicU32::new(0);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let policy = RetryPolicy::new(5, Duration::from_secs(1));
    let result: Result<(), String> = retry(&policy, &cancel, |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err("nope".to_string()) }
    })
    .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_policy_clamps_attempts_and_delay() {
    let policy = RetryPolicy::new(0, Duration::from_millis(1));
    assert_eq!(policy.attempts(), 1);
    assert_eq!(policy.delay(), MIN_DELAY);

    let default = RetryPolicy::default();
    assert_eq!(default.attempts(), 3);
    assert_eq!(default.delay(), Duration::from_millis(100));
}
