use super::{BreakerError, BreakerOpen, CircuitBreaker, ExponentialBackoff, RetryError};
use super::Transient;
use crate::core::{ErrorCategory, InitError};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResilienceError<E> {
    #[error(transparent)]
    CircuitOpen(BreakerOpen),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: E },

    #[error("{0}")]
    Failed(E),

    #[error("call cancelled")]
    Cancelled,
}

/// Breaker and backoff composed around one outbound call.
///
/// The breaker sits outside the retry loop: an open circuit rejects the call
/// before any attempt is made, and a whole exhausted retry sequence counts
/// as a single breaker failure.
#[derive(Clone)]
pub struct ResiliencePolicy {
    breaker: Arc<CircuitBreaker>,
    backoff: ExponentialBackoff,
}

impl ResiliencePolicy {
    pub fn new(breaker: Arc<CircuitBreaker>, backoff: ExponentialBackoff) -> Self {
        Self { breaker, backoff }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn backoff(&self) -> &ExponentialBackoff {
        &self.backoff
    }

    pub async fn call<F, Fut, T, E>(
        &self,
        token: &CancellationToken,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + fmt::Display,
    {
        let backoff = &self.backoff;
        let outcome = self
            .breaker
            .execute(|| backoff.execute(token, op))
            .await;

        match outcome {
            Ok(value) => Ok(value),
            Err(BreakerError::Open(open)) => Err(ResilienceError::CircuitOpen(open)),
            Err(BreakerError::Inner(RetryError::Exhausted { attempts, last })) => {
                Err(ResilienceError::RetriesExhausted { attempts, last })
            }
            Err(BreakerError::Inner(RetryError::NotRetryable(err))) => {
                Err(ResilienceError::Failed(err))
            }
            Err(BreakerError::Inner(RetryError::Cancelled { .. })) => {
                Err(ResilienceError::Cancelled)
            }
        }
    }
}

impl From<ResilienceError<InitError>> for InitError {
    fn from(err: ResilienceError<InitError>) -> Self {
        match err {
            ResilienceError::CircuitOpen(open) => InitError::transient(open.to_string()),
            ResilienceError::RetriesExhausted { attempts, last } => InitError::new(
                last.category,
                format!("{} (after {attempts} attempts)", last.message),
            ),
            ResilienceError::Failed(err) => err,
            ResilienceError::Cancelled => InitError::new(ErrorCategory::Cancelled, "call cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffPolicy, BreakerPolicy};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> ResiliencePolicy {
        let breaker = Arc::new(CircuitBreaker::new("api", BreakerPolicy::consecutive()));
        let backoff = ExponentialBackoff::new(BackoffPolicy {
            delays_ms: vec![10, 20],
            jitter_factor: 0.0,
        });
        ResiliencePolicy::new(breaker, backoff)
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_skips_retries() {
        let policy = fast_policy();
        let token = CancellationToken::new();
        for _ in 0..5 {
            policy.breaker().try_acquire().unwrap().failure();
        }

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .call(&token, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(InitError::transient("down")) }
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_keep_category() {
        let policy = fast_policy();
        let token = CancellationToken::new();

        let result: Result<(), _> = policy
            .call(&token, |_| async { Err(InitError::transient("reset")) })
            .await;

        let err = InitError::from(result.unwrap_err());
        assert_eq!(err.category, ErrorCategory::Transient);
        assert!(err.message.contains("after 3 attempts"));
        assert_eq!(policy.breaker().snapshot().failure_count, 1);
    }
}
