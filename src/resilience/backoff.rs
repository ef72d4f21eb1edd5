use super::Transient;
use crate::config::BackoffPolicy;
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

/// Why a retried call gave up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// A non-transient failure; returned immediately, no retry budget used.
    #[error("{0}")]
    NotRetryable(E),

    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl<E: Transient> Transient for RetryError<E> {
    fn is_transient(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

/// Jittered exponential retry schedule.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    policy: BackoffPolicy,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl ExponentialBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn max_retries(&self) -> usize {
        self.policy.max_retries()
    }

    /// Un-jittered delay before retry `retry_index` (0-based), capped at the
    /// last table entry.
    pub fn base_delay(&self, retry_index: usize) -> Duration {
        let last = self.policy.delays_ms.len().saturating_sub(1);
        let ms = self
            .policy
            .delays_ms
            .get(retry_index.min(last))
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }

    pub fn delay_with_jitter(&self, retry_index: usize) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_jitter_from(retry_index, &mut rng)
    }

    /// Nominal delay scaled by a uniform factor in `[1 - jitter, 1 + jitter]`.
    pub fn delay_with_jitter_from<R: Rng + ?Sized>(&self, retry_index: usize, rng: &mut R) -> Duration {
        let base_ms = self.base_delay(retry_index).as_millis() as f64;
        let jitter = self.policy.jitter_factor.abs();
        let offset = if jitter > 0.0 {
            rng.gen_range(-jitter..=jitter)
        } else {
            0.0
        };
        let millis = (base_ms * (1.0 + offset)).round().max(0.0);
        Duration::from_millis(millis as u64)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, runs out
    /// of retries, or `token` is cancelled. `op` receives the 1-based attempt
    /// number.
    pub async fn execute<F, Fut, T, E>(
        &self,
        token: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + fmt::Display,
    {
        let max_attempts = self.max_retries() as u32 + 1;
        let mut attempt: u32 = 0;

        loop {
            if token.is_cancelled() {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            attempt += 1;

            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_transient() {
                event!(Level::DEBUG, attempt, error = %err, "non-transient failure, not retrying");
                return Err(RetryError::NotRetryable(err));
            }

            if attempt >= max_attempts {
                event!(Level::WARN, attempt, error = %err, "retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.delay_with_jitter((attempt - 1) as usize);
            event!(
                Level::WARN,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, retrying"
            );

            tokio::select! {
                _ = token.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
                _ = sleep(delay) => {}
            }
        }
    }
}
