//! Exponential backoff with per-attempt timeouts around store calls.

use std::{future::Future, time::Duration};

use {cadence_config::ScheduledJobSettings, tracing::warn};

#[cfg(feature = "metrics")]
use cadence_metrics::{counter, sweeper as sweeper_metrics};

use crate::{Error, Result, error::StoreErrorKind};

/// Maximum number of doublings applied to the base delay.
const MAX_DOUBLINGS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Retries after the initial attempt.
    pub retries: u32,
    /// Timeout applied to each attempt.
    pub request_timeout: Duration,
}

impl BackoffPolicy {
    pub fn from_settings(settings: &ScheduledJobSettings) -> Self {
        Self {
            base: settings.sweep_backoff,
            retries: settings.sweep_backoff_retry_count,
            request_timeout: settings.request_timeout,
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_DOUBLINGS);
        self.base.saturating_mul(1 << exponent)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// retries are exhausted. Every attempt is bounded by `request_timeout`.
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.request_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(Error::store(
                    StoreErrorKind::Timeout,
                    format!("{operation} timed out after {:?}", self.request_timeout),
                )),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    let delay = self.delay(attempt);
                    warn!(
                        operation,
                        attempt,
                        retries = self.retries,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "store call failed, retrying"
                    );
                    #[cfg(feature = "metrics")]
                    counter!(sweeper_metrics::RETRIES_TOTAL).increment(1);
                    tokio::time::sleep(delay).await;
                },
                Err(e) => return Err(e),
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
    };

    fn policy(retries: u32) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(1),
            retries,
            request_timeout: Duration::from_millis(200),
        }
    }

    /// Operation that fails `failures` times with `kind` before succeeding.
    fn flaky(
        failures: u32,
        kind: StoreErrorKind,
    ) -> (
        Arc<AtomicU32>,
        impl FnMut() -> std::future::Ready<Result<u32>>,
    ) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n <= failures {
                Err(Error::store(kind, "flaky"))
            } else {
                Ok(n)
            })
        };
        (calls, op)
    }

    #[test]
    fn delay_doubles() {
        let p = BackoffPolicy {
            base: Duration::from_millis(50),
            retries: 3,
            request_timeout: Duration::from_secs(10),
        };
        assert_eq!(p.delay(1), Duration::from_millis(50));
        assert_eq!(p.delay(2), Duration::from_millis(100));
        assert_eq!(p.delay(3), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let (calls, op) = flaky(2, StoreErrorKind::Unavailable);
        let value = policy(3).retry("fetch", op).await.unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        let (calls, op) = flaky(10, StoreErrorKind::Overloaded);
        assert!(policy(3).retry("fetch", op).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let (calls, op) = flaky(10, StoreErrorKind::Invalid);
        assert!(policy(3).retry("fetch", op).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out_and_count_as_transient() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let p = BackoffPolicy {
            base: Duration::from_millis(1),
            retries: 1,
            request_timeout: Duration::from_millis(20),
        };
        let err = p
            .retry("fetch", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<(), Error>(())
                }
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
