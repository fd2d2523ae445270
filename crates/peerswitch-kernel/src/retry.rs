//! Retry with exponential backoff for individual device operations.
//!
//! Every `release`/`acquire` call made during a handoff goes through
//! [`retry_async`]. Handoff-level failures are never retried here; the
//! caller decides whether to start a whole new handoff.

use peerswitch_types::config::RetrySettings;
use std::time::Duration;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Growth factor applied per further attempt.
    pub multiplier: f64,
    /// Upper bound on any single wait.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        Self {
            max_attempts: s.max_attempts,
            base_delay: Duration::from_millis(s.base_delay_ms),
            multiplier: s.multiplier,
            max_delay: Duration::from_millis(s.max_delay_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Backoff computation
// ---------------------------------------------------------------------------

/// Delay to wait after failed attempt number `attempt` (0-indexed).
///
/// Formula: `min(base_delay * multiplier^attempt, max_delay)`.
pub fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let factor = policy.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
    let millis = (policy.base_delay.as_millis() as f64) * factor;
    let cap = policy.max_delay.as_millis() as f64;
    if !millis.is_finite() || millis >= cap {
        return policy.max_delay;
    }
    Duration::from_millis(millis as u64)
}

// ---------------------------------------------------------------------------
// Core retry function
// ---------------------------------------------------------------------------

/// Run `operation` until it succeeds or the attempts are used up.
///
/// The error of the last attempt is returned unchanged.
pub async fn retry_async<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        attempt = attempt + 1,
                        "retry succeeded after {} previous failures", attempt
                    );
                }
                return Ok(value);
            }
            Err(err) => {
                if attempt + 1 >= max {
                    warn!(
                        attempts = max,
                        "all retry attempts exhausted: {}", err
                    );
                    return Err(err);
                }
                let delay = compute_backoff(policy, attempt);
                debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after error: {}",
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[test]
    fn test_policy_from_settings() {
        let policy = RetryPolicy::from(&RetrySettings::default());
        assert_eq!(policy, RetryPolicy::default());
    }

    #[test]
    fn test_compute_backoff_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(compute_backoff(&policy, 0), Duration::from_secs(1));
        assert_eq!(compute_backoff(&policy, 1), Duration::from_secs(2));
        assert_eq!(compute_backoff(&policy, 2), Duration::from_secs(4));
        assert_eq!(compute_backoff(&policy, 3), Duration::from_secs(8));
        // 16s capped at 10s
        assert_eq!(compute_backoff(&policy, 4), Duration::from_secs(10));
        assert_eq!(compute_backoff(&policy, 60), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_twice_then_succeed() {
        let calls = Arc::new(AtomicU32::new(0));
        let times = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let result = retry_async(&RetryPolicy::default(), || {
            let calls = calls.clone();
            let times = times.clone();
            async move {
                times.lock().unwrap().push(start.elapsed());
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("not yet")
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let times = times.lock().unwrap();
        let first_wait = times[1] - times[0];
        let second_wait = times[2] - times[1];
        assert!(first_wait >= Duration::from_secs(1) && first_wait < Duration::from_millis(1_100));
        assert!(second_wait >= Duration::from_secs(2) && second_wait < Duration::from_millis(2_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_async(&RetryPolicy::default(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("failure {n}")) }
        })
        .await;
        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry_async(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("nope") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
