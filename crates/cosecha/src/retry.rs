//! Bounded retry-with-timeout driver.
//!
//! Every operation that depends on the observed process being reachable
//! goes through [`retry`]: connection attempts, the liveness probe, and
//! the wait-for-paused poll. Failures from the operation are swallowed
//! and retried after a fixed interval; only the optional overall deadline
//! turns the loop into a fatal [`CollectError::Timeout`].

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

use crate::result::{CollectError, CollectResult};

/// Invoke `operation` until it succeeds, sleeping `interval` between
/// failed attempts.
///
/// Without a `deadline` the loop runs forever; an unreachable service is
/// retried indefinitely. With a `deadline`, the whole loop including any
/// in-flight sleep is cancelled when it elapses and the error carries the
/// elapsed duration for diagnostics.
///
/// # Errors
///
/// Returns [`CollectError::Timeout`] if `deadline` elapses first.
pub async fn retry<T, E, F, Fut>(
    mut operation: F,
    interval: Duration,
    deadline: Option<Duration>,
) -> CollectResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = async {
        loop {
            match operation().await {
                Ok(value) => break value,
                Err(error) => {
                    tracing::debug!(%error, "attempt failed; retrying");
                }
            }
            sleep(interval).await;
        }
    };

    match deadline {
        None => Ok(attempts.await),
        Some(limit) => {
            let started = Instant::now();
            match timeout(limit, attempts).await {
                Ok(value) => Ok(value),
                Err(_) => Err(CollectError::Timeout {
                    elapsed: started.elapsed(),
                }),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_success_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let value = retry(
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, CollectError>(7) }
            },
            Duration::from_millis(200),
            None,
        )
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventual_success_after_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let value = retry(
            || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 4 {
                        Err(CollectError::Connection {
                            message: "refused".to_string(),
                        })
                    } else {
                        Ok(attempt)
                    }
                }
            },
            Duration::from_millis(200),
            None,
        )
        .await
        .unwrap();
        assert_eq!(value, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_bounds_a_failing_operation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result = retry(
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(CollectError::Connection {
                        message: "refused".to_string(),
                    })
                }
            },
            Duration::from_millis(200),
            Some(Duration::from_millis(500)),
        )
        .await;

        // Attempts at t=0, 200, 400; the deadline at t=500 cancels the
        // in-flight sleep before a fourth attempt can run.
        let err = result.unwrap_err();
        match err {
            CollectError::Timeout { elapsed } => {
                assert!(elapsed >= Duration::from_millis(500));
                assert!(elapsed <= Duration::from_millis(700));
            }
            other => panic!("expected Timeout, got {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_just_before_deadline() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let value = retry(
            || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(CollectError::Connection {
                            message: "refused".to_string(),
                        })
                    } else {
                        Ok("up")
                    }
                }
            },
            Duration::from_millis(200),
            Some(Duration::from_millis(500)),
        )
        .await
        .unwrap();
        assert_eq!(value, "up");
    }
}
