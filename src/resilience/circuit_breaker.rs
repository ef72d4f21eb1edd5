use super::Transient;
use crate::config::{BreakerMode, BreakerPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of one breaker, for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerState {
    pub key: String,
    pub state: CircuitState,
    /// Consecutive failures since the last success.
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub next_retry_time: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub recovery_delay_index: usize,
    pub window_calls: usize,
    pub window_failures: usize,
}

/// Fail-fast rejection while the circuit is open (or a trial is in flight).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("circuit '{key}' is open, retry in {retry_after:?}")]
pub struct BreakerOpen {
    pub key: String,
    pub retry_after: Duration,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Open(BreakerOpen),

    #[error("{0}")]
    Inner(E),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    Normal,
    Trial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallOutcome {
    Success,
    Failure,
    Ignored,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    samples: VecDeque<(Instant, bool)>,
    recovery_index: usize,
    open_until: Option<Instant>,
    trial_in_flight: bool,
    /// Bumped on every state change; permits from an older generation no
    /// longer influence the state machine.
    generation: u64,
    last_failure_time: Option<DateTime<Utc>>,
    next_retry_time: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            samples: VecDeque::new(),
            recovery_index: 0,
            open_until: None,
            trial_in_flight: false,
            generation: 0,
            last_failure_time: None,
            next_retry_time: None,
            opened_at: None,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.samples.front() {
            if now.saturating_duration_since(*at) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn window_failures(&self) -> usize {
        self.samples.iter().filter(|(_, ok)| !ok).count()
    }
}

/// Circuit breaker guarding one external dependency.
///
/// All transitions happen under a single mutex, so concurrent callers see
/// one consistent state machine and at most one half-open trial runs at a
/// time.
pub struct CircuitBreaker {
    key: String,
    policy: BreakerPolicy,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, policy: BreakerPolicy) -> Self {
        Self {
            key: key.into(),
            policy,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn policy(&self) -> &BreakerPolicy {
        &self.policy
    }

    // Transitions never panic half-way, so a poisoned guard still holds a
    // consistent state.
    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let now = Instant::now();
        let mut inner = self.lock();
        let window = self.policy.sampling_window();
        inner.prune(now, window);
        CircuitBreakerState {
            key: self.key.clone(),
            state: inner.state,
            failure_count: inner.consecutive_failures,
            last_failure_time: inner.last_failure_time,
            next_retry_time: inner.next_retry_time,
            opened_at: inner.opened_at,
            recovery_delay_index: inner.recovery_index,
            window_calls: inner.samples.len(),
            window_failures: inner.window_failures(),
        }
    }

    /// Asks to make a call. The returned permit must be settled with
    /// `success`, `failure` or `ignore`; dropping it counts as `ignore`.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, BreakerOpen> {
        let now = Instant::now();
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Ok(CallPermit::new(self, PermitKind::Normal, inner.generation)),
            CircuitState::Open => {
                let open_until = inner.open_until.unwrap_or(now);
                if now < open_until {
                    return Err(BreakerOpen {
                        key: self.key.clone(),
                        retry_after: open_until - now,
                    });
                }
                inner.state = CircuitState::HalfOpen;
                inner.generation += 1;
                inner.trial_in_flight = true;
                event!(Level::INFO, breaker = %self.key, "circuit half-open, allowing trial");
                Ok(CallPermit::new(self, PermitKind::Trial, inner.generation))
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(BreakerOpen {
                        key: self.key.clone(),
                        retry_after: Duration::ZERO,
                    });
                }
                inner.trial_in_flight = true;
                Ok(CallPermit::new(self, PermitKind::Trial, inner.generation))
            }
        }
    }

    /// Runs `op` behind the breaker. While closed, only transient failures
    /// count against the circuit. A failed half-open trial reopens it
    /// whatever the error category.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient,
    {
        let permit = self.try_acquire().map_err(BreakerError::Open)?;
        match op().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                if err.is_transient() || permit.is_trial() {
                    permit.failure();
                } else {
                    permit.ignore();
                }
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Forces the circuit closed and clears history.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let generation = inner.generation + 1;
        *inner = BreakerInner::new();
        inner.generation = generation;
        event!(Level::INFO, breaker = %self.key, "circuit manually reset");
    }

    fn settle(&self, kind: PermitKind, generation: u64, outcome: CallOutcome) {
        let now = Instant::now();
        let mut inner = self.lock();

        if outcome == CallOutcome::Failure {
            inner.last_failure_time = Some(Utc::now());
        }

        match kind {
            PermitKind::Trial => {
                if inner.generation != generation || inner.state != CircuitState::HalfOpen {
                    return;
                }
                inner.trial_in_flight = false;
                match outcome {
                    CallOutcome::Success => self.close(&mut inner),
                    CallOutcome::Failure => {
                        inner.consecutive_failures += 1;
                        inner.recovery_index =
                            (inner.recovery_index + 1).min(self.policy.last_recovery_index());
                        self.trip(&mut inner, now);
                    }
                    CallOutcome::Ignored => {}
                }
            }
            PermitKind::Normal => {
                if inner.generation != generation || inner.state != CircuitState::Closed {
                    return;
                }
                match outcome {
                    CallOutcome::Success => {
                        inner.consecutive_failures = 0;
                        inner.samples.push_back((now, true));
                    }
                    CallOutcome::Failure => {
                        inner.consecutive_failures += 1;
                        inner.samples.push_back((now, false));
                    }
                    CallOutcome::Ignored => return,
                }
                inner.prune(now, self.policy.sampling_window());
                if outcome == CallOutcome::Failure && self.should_trip(&inner) {
                    self.trip(&mut inner, now);
                }
            }
        }
    }

    fn should_trip(&self, inner: &BreakerInner) -> bool {
        match self.policy.mode {
            BreakerMode::ConsecutiveFailures => {
                inner.consecutive_failures >= self.policy.consecutive_failure_threshold
            }
            BreakerMode::FailureRate => {
                let calls = inner.samples.len();
                if calls < self.policy.minimum_throughput {
                    return false;
                }
                let rate = inner.window_failures() as f64 / calls as f64;
                rate >= self.policy.failure_rate_threshold
            }
        }
    }

    fn trip(&self, inner: &mut BreakerInner, now: Instant) {
        let delay = self.policy.recovery_delay(inner.recovery_index);
        inner.state = CircuitState::Open;
        inner.generation += 1;
        inner.open_until = Some(now + delay);
        inner.samples.clear();
        inner.trial_in_flight = false;
        let opened_at = Utc::now();
        inner.opened_at = Some(opened_at);
        inner.next_retry_time =
            Some(opened_at + chrono::Duration::milliseconds(delay.as_millis() as i64));
        event!(
            Level::WARN,
            breaker = %self.key,
            recovery_delay_ms = delay.as_millis() as u64,
            recovery_index = inner.recovery_index,
            "circuit opened"
        );
    }

    fn close(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Closed;
        inner.generation += 1;
        inner.recovery_index = 0;
        inner.consecutive_failures = 0;
        inner.samples.clear();
        inner.open_until = None;
        inner.next_retry_time = None;
        inner.opened_at = None;
        event!(Level::INFO, breaker = %self.key, "circuit closed after successful trial");
    }
}

/// Permission to make one call through a breaker.
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    kind: PermitKind,
    generation: u64,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, kind: PermitKind, generation: u64) -> Self {
        Self {
            breaker,
            kind,
            generation,
            settled: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.kind == PermitKind::Trial
    }

    pub fn success(mut self) {
        self.finish(CallOutcome::Success);
    }

    pub fn failure(mut self) {
        self.finish(CallOutcome::Failure);
    }

    pub fn ignore(mut self) {
        self.finish(CallOutcome::Ignored);
    }

    fn finish(&mut self, outcome: CallOutcome) {
        if !self.settled {
            self.settled = true;
            self.breaker.settle(self.kind, self.generation, outcome);
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        self.finish(CallOutcome::Ignored);
    }
}

/// Hands out one breaker per dependency key for the lifetime of the process.
pub struct CircuitBreakerRegistry {
    policy: BreakerPolicy,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.policy.clone())))
            .clone()
    }

    pub fn snapshot(&self) -> Vec<CircuitBreakerState> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut states: Vec<CircuitBreakerState> =
            breakers.iter().map(|breaker| breaker.snapshot()).collect();
        states.sort_by(|a, b| a.key.cmp(&b.key));
        states
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail(breaker: &CircuitBreaker) {
        breaker.try_acquire().unwrap().failure();
    }

    #[test]
    fn test_rate_mode_needs_minimum_throughput() {
        let breaker = CircuitBreaker::new("db", BreakerPolicy::default());
        for _ in 0..4 {
            fail(&breaker);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_rate_mode_trips_at_half_failures() {
        let breaker = CircuitBreaker::new("api", BreakerPolicy::default());
        for _ in 0..3 {
            breaker.try_acquire().unwrap().success();
        }
        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker);
        // 3 of 6 calls failed
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_consecutive_mode_resets_on_success() {
        let breaker = CircuitBreaker::new("api", BreakerPolicy::consecutive());
        for _ in 0..4 {
            fail(&breaker);
        }
        breaker.try_acquire().unwrap().success();
        for _ in 0..4 {
            fail(&breaker);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_dropped_permit_is_ignored() {
        let breaker = CircuitBreaker::new("db", BreakerPolicy::default());
        for _ in 0..10 {
            let _permit = breaker.try_acquire().unwrap();
        }
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.window_calls, 0);
        assert_eq!(snapshot.state, CircuitState::Closed);
    }

    #[test]
    fn test_registry_shares_breakers_by_key() {
        let registry = CircuitBreakerRegistry::default();
        let first = registry.get("mysql");
        let second = registry.get("mysql");
        let other = registry.get("visual");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));

        let keys: Vec<String> = registry.snapshot().into_iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["mysql".to_string(), "visual".to_string()]);
    }
}
