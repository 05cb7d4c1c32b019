//! Retry policy (§4.2).
//!
//! Grounded on `backend/pool/healthcheck.rs`'s `timeout`-wrapped retryable
//! operation and `backend/server/connection.rs`'s connect loop; this module
//! generalizes that into a reusable bounded-retry-with-backoff primitive
//! used for both connection-opening and command-execution (two distinct
//! policy instances, per §4.2).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bounded-retry configuration. Two shard operations get independent
/// instances of this (§4.2): one governing connection-open, one governing
/// command-execution.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Total attempts, including the first. `1` means no retries.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        let capped = exp.min(self.max_delay);
        let jitter_ms = rand::rng().random_range(0..=(capped.as_millis() as u64).max(1));
        Duration::from_millis(jitter_ms)
    }
}

/// Outcome of waiting out a retry delay: either the delay elapsed, or the
/// cancellation token fired first.
enum WaitOutcome {
    Elapsed,
    Cancelled,
}

async fn wait_or_cancel(delay: Duration, token: &CancellationToken) -> WaitOutcome {
    tokio::select! {
        _ = tokio::time::sleep(delay) => WaitOutcome::Elapsed,
        _ = token.cancelled() => WaitOutcome::Cancelled,
    }
}

/// Runs a unit of async work under a bounded-retry envelope (§4.2).
///
/// On error, consults `is_transient` (the union of a standard detector and
/// a user-supplied predicate, composed by the caller per §4.2) and, if the
/// error is transient, the retry budget isn't exhausted, and `token` hasn't
/// fired, waits a backoff interval (itself cancellable) and retries with a
/// freshly produced unit of work — `work` is an `FnMut` precisely so each
/// attempt can hand back an independent clone (§4.4 "state residue" note:
/// retries must not reuse a command left in an inconsistent state).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub async fn execute<T, E, F, Fut>(
        &self,
        token: &CancellationToken,
        is_transient: impl Fn(&E) -> bool,
        mut work: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match work().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let transient = is_transient(&err);
                    let exhausted = attempt >= self.config.max_attempts;
                    if !transient || exhausted || token.is_cancelled() {
                        return Err(err);
                    }
                    let delay = self.config.delay_for(attempt);
                    debug!(attempt, ?delay, "retrying after transient shard error");
                    match wait_or_cancel(delay, token).await {
                        WaitOutcome::Elapsed => continue,
                        WaitOutcome::Cancelled => {
                            warn!("retry backoff interrupted by cancellation");
                            return Err(err);
                        }
                    }
                }
            }
        }
    }
}

/// Composes a standard transient-error detector with an optional
/// user-supplied predicate (§4.2 "the union of a standard database-transient
/// detector and a user-supplied predicate").
pub fn classifier<E>(
    default_detector: impl Fn(&E) -> bool,
    user_predicate: Option<std::sync::Arc<dyn Fn(&E) -> bool + Send + Sync>>,
) -> impl Fn(&E) -> bool {
    move |err: &E| default_detector(err) || user_predicate.as_ref().is_some_and(|p| p(err))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Boom;

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        });
        let attempts = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result: Result<u32, Boom> = policy
            .execute(&token, |_| true, || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(Boom)
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_error_is_not_retried() {
        let policy = RetryPolicy::new(RetryConfig::default());
        let attempts = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result: Result<u32, Boom> = policy
            .execute(&token, |_| false, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Boom)
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_returns_last_error() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        });
        let attempts = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result: Result<u32, Boom> = policy
            .execute(&token, |_| true, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Boom)
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_token_stops_retry_loop() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
        });
        let token = CancellationToken::new();
        token.cancel();

        let result: Result<u32, Boom> = policy.execute(&token, |_| true, || async { Err(Boom) }).await;

        assert!(result.is_err());
    }
}
