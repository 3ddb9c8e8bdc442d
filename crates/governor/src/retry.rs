//! Bounded retry with per-kind budgets
//!
//! | kind                        | retries |
//! |-----------------------------|---------|
//! | RateLimit                   | 3       |
//! | ApplicationLimit, UserLimit | 2       |
//! | Processing, HTTP >= 500     | 3       |
//! | everything else             | 0       |
//!
//! A failure carrying `retry_after` waits exactly that long. Otherwise the
//! delay is `min(base * 2^attempt, max)` plus random jitter so accounts that
//! were throttled together do not retry in lockstep.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tracing::{debug, warn};

use crate::error::{ApiError, Result};

impl ApiError {
    /// How many times this failure may be retried.
    pub fn max_retries(&self) -> u32 {
        match self {
            ApiError::RateLimit { .. } => 3,
            ApiError::ApplicationLimit { .. } | ApiError::UserLimit { .. } => 2,
            ApiError::Processing { detail, .. } => match detail.http_status {
                Some(status) if status >= 500 => 3,
                _ => 0,
            },
            ApiError::Auth { .. }
            | ApiError::Permission { .. }
            | ApiError::Validation { .. }
            | ApiError::RetriesExhausted { .. } => 0,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.max_retries() > 0
    }
}

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            max_jitter: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Exponential part of the delay for a zero-based attempt, before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before retrying after `error` on zero-based `attempt`.
    pub fn delay_for(&self, error: &ApiError, attempt: u32) -> Duration {
        if let Some(wait) = error.retry_after() {
            return wait;
        }
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_ms));
        self.backoff(attempt) + jitter
    }

    /// Run `operation` until it succeeds, fails with a non-retryable kind, or
    /// exhausts the retry budget of the kind it keeps failing with.
    ///
    /// Non-retryable failures return on first occurrence with no added delay.
    /// Exhaustion returns `RetriesExhausted` naming `context`, the budget and
    /// the last cause.
    pub async fn retry_with_backoff<T, F, Fut>(&self, context: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(context, attempts = attempt + 1, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let kind = error.kind().label();
            let budget = error.max_retries();
            if budget == 0 {
                crate::metrics::record_failure(kind);
                return Err(error);
            }

            if attempt >= budget {
                warn!(context, kind, retries = budget, error = %error, "retry budget exhausted");
                crate::metrics::record_failure(kind);
                return Err(ApiError::RetriesExhausted {
                    context: context.to_string(),
                    retries: budget,
                    source: Box::new(error),
                });
            }

            let delay = self.delay_for(&error, attempt);
            warn!(
                context,
                kind,
                attempt = attempt + 1,
                max_retries = budget,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retryable failure, backing off"
            );
            crate::metrics::record_retry(kind);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// `RetryPolicy::retry_with_backoff` with the default policy.
pub async fn retry_with_backoff<T, F, Fut>(operation: F, context: &str) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryPolicy::default()
        .retry_with_backoff(context, operation)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FailureKind, RemoteDetail};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn validation() -> ApiError {
        ApiError::Validation {
            message: "Invalid parameter".into(),
            detail: RemoteDetail {
                http_status: Some(400),
                code: Some(100),
                ..RemoteDetail::default()
            },
        }
    }

    fn throttled() -> ApiError {
        ApiError::RateLimit {
            message: "too many calls".into(),
            retry_after: Duration::from_secs(300),
            detail: RemoteDetail::status(400),
        }
    }

    #[test]
    fn eligibility_table() {
        assert_eq!(throttled().max_retries(), 3);
        assert_eq!(
            ApiError::ApplicationLimit {
                message: String::new(),
                detail: RemoteDetail::default()
            }
            .max_retries(),
            2
        );
        assert_eq!(
            ApiError::UserLimit {
                message: String::new(),
                detail: RemoteDetail::default()
            }
            .max_retries(),
            2
        );
        assert_eq!(ApiError::processing("boom", Some(503)).max_retries(), 3);
        assert_eq!(ApiError::processing("boom", Some(500)).max_retries(), 3);
        assert_eq!(ApiError::processing("nope", Some(404)).max_retries(), 0);
        assert_eq!(ApiError::processing("offline", None).max_retries(), 0);
        assert!(!validation().is_retryable());
        assert!(
            !ApiError::Auth {
                message: String::new(),
                detail: RemoteDetail::default()
            }
            .is_retryable()
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(5), Duration::from_secs(32));
        assert_eq!(policy.backoff(6), Duration::from_secs(60));
        assert_eq!(policy.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn delay_uses_retry_after_verbatim() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(&throttled(), 2), Duration::from_secs(300));
    }

    #[test]
    fn delay_jitter_is_bounded() {
        let policy = RetryPolicy::default();
        let err = ApiError::processing("HTTP 503", Some(503));
        for _ in 0..50 {
            let delay = policy.delay_for(&err, 1);
            assert!(delay >= Duration::from_secs(2), "delay {delay:?} below backoff");
            assert!(delay <= Duration::from_secs(3), "delay {delay:?} above jitter bound");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_propagates_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result: Result<()> = retry_with_backoff(
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(validation())
                }
            },
            "POST act_1/campaigns",
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Validation);
        assert!(!err.is_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_twice_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result = retry_with_backoff(
            || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 { Err(throttled()) } else { Ok("done") }
                }
            },
            "GET act_1/insights",
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_exhaust_after_three_retries() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = retry_with_backoff(
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ApiError::processing("HTTP 503: unavailable", Some(503)))
                }
            },
            "GET act_1/adsets",
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result.unwrap_err() {
            ApiError::RetriesExhausted {
                context,
                retries,
                source,
            } => {
                assert_eq!(context, "GET act_1/adsets");
                assert_eq!(retries, 3);
                assert_eq!(source.http_status(), Some(503));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn user_limit_gets_two_retries() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = retry_with_backoff(
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ApiError::UserLimit {
                        message: "User request limit reached".into(),
                        detail: RemoteDetail::default(),
                    })
                }
            },
            "GET me/adaccounts",
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let err = result.unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.kind(), FailureKind::UserLimit);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_policy_without_jitter_is_deterministic() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(150),
            max_jitter: Duration::ZERO,
        };
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result = policy
            .retry_with_backoff("GET act_1", || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 3 {
                        Err(ApiError::processing("HTTP 500", Some(500)))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        // 100ms, then 150ms (capped), then 150ms
        assert_eq!(start.elapsed(), Duration::from_millis(400));
    }
}
