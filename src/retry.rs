//! Exponential-backoff retry for transient failures
//!
//! Transient transport failures (backend RPC down, connection reset, feed host
//! timing out) are retried with exponential backoff and optional jitter;
//! permanent failures (bad config, invalid state, duplicate admission) fail
//! immediately. What counts as transient is decided per error type through
//! [`IsRetryable`].

use crate::config::RetryConfig;
use crate::error::{DownloadError, Error};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Classifies an error as worth retrying or terminal.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Timeouts and connect failures are transient
            Error::Network(e) => e.is_timeout() || e.is_connect(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            Error::Download(e) => match e {
                // Transport down: the backend may come back
                DownloadError::BackendUnavailable { .. } => true,
                // Unconfirmed commands are reconciled by the state poll, not retried
                DownloadError::ConfirmationTimeout { .. } => false,
                DownloadError::NotFound { .. }
                | DownloadError::InvalidState { .. }
                | DownloadError::UnknownAdapter { .. }
                | DownloadError::Backend { .. } => false,
            },
            // A malformed feed stays malformed
            Error::FeedParse(_) => false,
            // Sandbox failures are contained at call granularity, never retried
            Error::Sandbox(_) => false,
            Error::Database(_) | Error::Sqlx(_) => false,
            Error::Config { .. } => false,
            Error::NotFound(_) => false,
            Error::ShuttingDown => false,
            Error::Serialization(_) => false,
            // Dedup skip is a terminal outcome, not a failure to repeat
            Error::Duplicate { .. } => false,
            Error::Other(_) => false,
        }
    }
}

/// Run `operation` until it succeeds, retrying retryable errors up to
/// `config.max_attempts` times with exponentially growing, capped delays.
/// The final error is returned unchanged once attempts run out or the error
/// is permanent.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;
                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                let sleep_for = if config.jitter { jittered(delay) } else { delay };
                tokio::time::sleep(sleep_for).await;

                delay = delay.mul_f64(config.backoff_multiplier).min(config.max_delay);
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    attempts = attempt + 1,
                    retryable = e.is_retryable(),
                    "Operation failed for good"
                );
                return Err(e);
            }
        }
    }
}

/// Spread a delay uniformly over `[delay, 2 * delay]` to keep synchronized
/// callers from hammering a recovering backend in lockstep.
fn jittered(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    delay.mul_f64(rng.gen_range(1.0..=2.0))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum TestError {
        Transient,
        Permanent,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestError::Transient => write!(f, "transient error"),
                TestError::Permanent => write!(f, "permanent error"),
            }
        }
    }

    impl IsRetryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Drive `with_retry` against an operation that fails `failures` times
    /// before returning 42, reporting the result and how often it was called.
    async fn run_flaky(
        config: &RetryConfig,
        failures: u32,
        error: fn() -> TestError,
    ) -> (Result<i32, TestError>, u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = with_retry(config, || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < failures {
                    Err(error())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        (result, calls.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn success_needs_no_retry() {
        let (result, calls) = run_flaky(&fast(3), 0, || TestError::Transient).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1, "should only call once");
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let (result, calls) = run_flaky(&fast(3), 2, || TestError::Transient).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 3, "should retry twice before success");
    }

    #[tokio::test]
    async fn exhausted_attempts_return_last_error() {
        let (result, calls) = run_flaky(&fast(2), u32::MAX, || TestError::Transient).await;
        assert!(matches!(result, Err(TestError::Transient)));
        assert_eq!(calls, 3, "should try initial + 2 retries");
    }

    #[tokio::test]
    async fn permanent_error_fails_immediately() {
        let (result, calls) = run_flaky(&fast(3), u32::MAX, || TestError::Permanent).await;
        assert!(matches!(result, Err(TestError::Permanent)));
        assert_eq!(calls, 1, "should not retry permanent error");
    }

    #[tokio::test]
    async fn delays_grow_exponentially_up_to_the_cap() {
        let config = RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            backoff_multiplier: 10.0,
            jitter: false,
        };

        let timestamps = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let ts_clone = timestamps.clone();

        let _result = with_retry(&config, || {
            let ts = ts_clone.clone();
            async move {
                ts.lock().await.push(std::time::Instant::now());
                Err::<i32, _>(TestError::Transient)
            }
        })
        .await;

        let ts = timestamps.lock().await;
        assert_eq!(ts.len(), 5, "initial + 4 retries = 5 calls");

        // Without the cap the later delays would be 500ms and 5000ms
        let max_allowed = Duration::from_millis(350); // 200ms cap + scheduling tolerance
        for i in 1..ts.len() {
            let gap = ts[i].duration_since(ts[i - 1]);
            assert!(
                gap <= max_allowed,
                "delay between attempt {} and {} was {:?}, exceeds cap + tolerance",
                i,
                i + 1,
                gap
            );
        }
    }

    #[test]
    fn jittered_delays_stay_within_bounds_over_many_iterations() {
        let delay = Duration::from_millis(50);
        for i in 0..200 {
            let sample = jittered(delay);
            assert!(
                sample >= delay,
                "iteration {i}: jittered {sample:?} < base delay {delay:?}"
            );
            assert!(
                sample <= delay * 2,
                "iteration {i}: jittered {sample:?} > 2x base delay"
            );
        }
    }

    // -----------------------------------------------------------------------
    // IsRetryable classification for library errors
    // -----------------------------------------------------------------------

    #[test]
    fn io_timeouts_and_connection_drops_are_retryable() {
        let timeout = Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"));
        assert!(timeout.is_retryable());

        let reset = Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        assert!(reset.is_retryable());

        let not_found = Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "not found",
        ));
        assert!(!not_found.is_retryable());
    }

    #[test]
    fn backend_outage_is_retryable_but_unconfirmed_commands_are_not() {
        let outage = Error::Download(DownloadError::BackendUnavailable {
            adapter: "rpc".to_string(),
            reason: "connection refused".to_string(),
        });
        assert!(outage.is_retryable());

        let unconfirmed = Error::Download(DownloadError::ConfirmationTimeout {
            id: 7,
            operation: "pause".to_string(),
            timeout_ms: 10_000,
        });
        assert!(
            !unconfirmed.is_retryable(),
            "unconfirmed commands reconcile via the state poll"
        );
    }

    #[test]
    fn permanent_error_variants_are_not_retryable() {
        use crate::error::{DatabaseError, SandboxError};

        assert!(
            !Error::Config {
                message: "bad config".to_string(),
                key: None,
            }
            .is_retryable()
        );
        assert!(
            !Error::Database(DatabaseError::QueryFailed("db error".to_string())).is_retryable()
        );
        assert!(!Error::FeedParse("not xml".to_string()).is_retryable());
        assert!(
            !Error::Sandbox(SandboxError::Compile {
                message: "syntax error".to_string(),
            })
            .is_retryable()
        );
        assert!(!Error::Duplicate { existing_id: 1 }.is_retryable());
        assert!(!Error::ShuttingDown.is_retryable());
        assert!(!Error::Other("unknown".to_string()).is_retryable());
    }
}
