//! Bounded retry with a fixed pause between attempts.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub attempts: u32,

    /// Pause after a failed attempt when another one remains
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

/// Every attempt failed.
#[derive(Debug, Error)]
#[error("gave up after {attempts} attempts: {last}")]
pub struct RetryError<E: std::fmt::Display> {
    pub attempts: u32,
    pub last: E,
}

/// Run `op` until it succeeds or the policy runs out of attempts.
///
/// `op` receives the 1-based attempt number. On success the value and the
/// attempt it succeeded on are returned. There is no sleep after the final
/// failure.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, op: F) -> Result<(T, u32), RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_until(policy, &CancellationToken::new(), op).await
}

/// Like [`retry`], but no new attempt starts once `stop` is cancelled.
///
/// An attempt already running is never interrupted. A pending pause ends as
/// soon as `stop` fires and the last error is returned.
pub async fn retry_until<T, E, F, Fut>(
    policy: RetryPolicy,
    stop: &CancellationToken,
    mut op: F,
) -> Result<(T, u32), RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(e) if attempt >= attempts || stop.is_cancelled() => {
                return Err(RetryError {
                    attempts: attempt,
                    last: e,
                });
            }
            Err(e) => {
                debug!(
                    attempt = attempt,
                    max_attempts = attempts,
                    delay_ms = policy.delay.as_millis() as u64,
                    "Attempt failed, retrying"
                );
                tokio::select! {
                    _ = stop.cancelled() => {
                        return Err(RetryError {
                            attempts: attempt,
                            last: e,
                        });
                    }
                    _ = tokio::time::sleep(policy.delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    #[tokio::test]
    async fn test_first_attempt_success() {
        let calls = AtomicU32::new(0);
        let result = retry(RetryPolicy::new(3, Duration::from_secs(10)), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>("done") }
        })
        .await
        .unwrap();

        assert_eq!(result, ("done", 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_succeeds_on_later_attempt() {
        let result = retry(RetryPolicy::new(3, Duration::from_millis(5)), |attempt| async move {
            if attempt < 3 {
                Err(format!("attempt {} failed", attempt))
            } else {
                Ok(attempt * 10)
            }
        })
        .await
        .unwrap();

        assert_eq!(result, (30, 3));
    }

    #[tokio::test]
    async fn test_gives_up_after_all_attempts() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let err = retry(RetryPolicy::new(3, Duration::from_millis(20)), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(format!("boom {}", attempt)) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last, "boom 3");
        // two pauses, none after the last failure
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_zero_attempts_runs_once() {
        let calls = AtomicU32::new(0);
        let err = retry(RetryPolicy::new(0, Duration::from_millis(1)), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("nope") }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.to_string(), "gave up after 1 attempts: nope");
    }

    #[tokio::test]
    async fn test_stop_prevents_further_attempts() {
        let stop = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let err = retry_until(RetryPolicy::new(5, Duration::from_secs(10)), &stop, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            let stop = stop.clone();
            async move {
                // fires while the first attempt is still running
                stop.cancel();
                Err::<(), _>(format!("boom {}", attempt))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts, 1);
        assert_eq!(err.last, "boom 1");
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_stop_ends_pending_pause() {
        let stop = CancellationToken::new();
        let canceller = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                stop.cancel();
            })
        };

        let start = Instant::now();
        let err = retry_until(RetryPolicy::new(3, Duration::from_secs(10)), &stop, |_| async {
            Err::<(), _>("down")
        })
        .await
        .unwrap_err();
        canceller.await.unwrap();

        assert_eq!(err.attempts, 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
