/// Resilience tests
///
/// Circuit breaker state machine and jittered exponential backoff, on a
/// paused clock so recovery windows elapse instantly.
/// Run with: cargo test --test resilience_tests

use bootseq::resilience::BreakerError;
use bootseq::{
    BackoffPolicy, BreakerPolicy, CircuitBreaker, CircuitBreakerRegistry, CircuitState,
    ExponentialBackoff, InitError, ResilienceError, ResiliencePolicy,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::{Instant, advance, sleep};
use tokio_util::sync::CancellationToken;

fn trip(breaker: &CircuitBreaker, failures: usize) {
    for _ in 0..failures {
        breaker.try_acquire().unwrap().failure();
    }
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_after_five_consecutive_failures() {
    let breaker = CircuitBreaker::new("database", BreakerPolicy::consecutive());

    trip(&breaker, 4);
    assert_eq!(breaker.state(), CircuitState::Closed);
    trip(&breaker, 1);
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected = breaker.try_acquire().err().unwrap();
    assert_eq!(rejected.key, "database");
    assert_eq!(rejected.retry_after, Duration::from_secs(30));

    let snapshot = breaker.snapshot();
    assert_eq!(snapshot.failure_count, 5);
    assert!(snapshot.next_retry_time.is_some());
    assert!(snapshot.last_failure_time.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_successful_trial_closes_and_resets_delay() {
    let breaker = CircuitBreaker::new("api", BreakerPolicy::consecutive());
    trip(&breaker, 5);

    advance(Duration::from_secs(29)).await;
    assert!(breaker.try_acquire().is_err());

    advance(Duration::from_secs(1)).await;
    let trial = breaker.try_acquire().unwrap();
    assert!(trial.is_trial());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    // Only one trial at a time.
    assert!(breaker.try_acquire().is_err());

    trial.success();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.snapshot().recovery_delay_index, 0);
    assert!(breaker.try_acquire().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_escalates_recovery_delay() {
    let breaker = CircuitBreaker::new("api", BreakerPolicy::consecutive());
    trip(&breaker, 5);

    let expected = [30u64, 60, 120, 300, 600, 600];
    for (index, window) in expected.iter().enumerate() {
        let rejected = breaker.try_acquire().err().unwrap();
        assert_eq!(rejected.retry_after, Duration::from_secs(*window), "trip #{index}");

        advance(Duration::from_secs(*window)).await;
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }
    assert_eq!(breaker.snapshot().recovery_delay_index, 4);

    // A later successful trial starts the table over.
    advance(Duration::from_secs(600)).await;
    breaker.try_acquire().unwrap().success();
    trip(&breaker, 5);
    assert_eq!(
        breaker.try_acquire().err().unwrap().retry_after,
        Duration::from_secs(30)
    );
}

#[tokio::test(start_paused = true)]
async fn test_rate_breaker_uses_sliding_window() {
    let breaker = CircuitBreaker::new("cache", BreakerPolicy::default());

    trip(&breaker, 4);
    advance(Duration::from_secs(31)).await;
    trip(&breaker, 1);
    // Old failures fell out of the 30 s window.
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.snapshot().window_calls, 1);

    for _ in 0..2 {
        breaker.try_acquire().unwrap().success();
    }
    trip(&breaker, 1);
    assert_eq!(breaker.state(), CircuitState::Closed);
    trip(&breaker, 1);
    // 3 failures out of 5 calls
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_get_a_single_trial() {
    let breaker = Arc::new(CircuitBreaker::new("bus", BreakerPolicy::consecutive()));
    trip(&breaker, 5);
    advance(Duration::from_secs(30)).await;

    let executed = Arc::new(AtomicU32::new(0));
    let mut handles = vec![];
    for _ in 0..10 {
        let breaker = Arc::clone(&breaker);
        let executed = Arc::clone(&executed);
        handles.push(tokio::spawn(async move {
            breaker
                .execute(|| async move {
                    executed.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(10)).await;
                    Ok::<(), InitError>(())
                })
                .await
        }));
    }

    let mut rejected = 0;
    for handle in handles {
        if let Err(BreakerError::Open(_)) = handle.await.unwrap() {
            rejected += 1;
        }
    }

    assert_eq!(executed.load(Ordering::SeqCst), 1);
    assert_eq!(rejected, 9);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_non_transient_errors_do_not_trip_breaker() {
    let breaker = CircuitBreaker::new("config", BreakerPolicy::consecutive());
    for _ in 0..10 {
        let result: Result<(), _> = breaker
            .execute(|| async { Err(InitError::configuration("missing key")) })
            .await;
        assert!(matches!(result, Err(BreakerError::Inner(_))));
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_non_transient_trial_failure_reopens_circuit() {
    let breaker = CircuitBreaker::new("config", BreakerPolicy::consecutive());
    trip(&breaker, 5);
    advance(Duration::from_secs(30)).await;

    let result: Result<(), _> = breaker
        .execute(|| async { Err(InitError::configuration("missing key")) })
        .await;
    assert!(matches!(result, Err(BreakerError::Inner(_))));

    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(breaker.snapshot().recovery_delay_index, 1);
    assert_eq!(
        breaker.try_acquire().err().unwrap().retry_after,
        Duration::from_secs(60)
    );
}

#[test]
fn test_registry_snapshot_lists_every_dependency() {
    let registry = CircuitBreakerRegistry::new(BreakerPolicy::consecutive());
    trip(&registry.get("remote_api"), 5);
    registry.get("database");

    let states = registry.snapshot();
    assert_eq!(states.len(), 2);
    assert_eq!(states[0].key, "database");
    assert_eq!(states[0].state, CircuitState::Closed);
    assert_eq!(states[1].key, "remote_api");
    assert_eq!(states[1].state, CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delays_follow_jittered_table() {
    let backoff = ExponentialBackoff::default();
    let token = CancellationToken::new();
    let mut attempts_at = Vec::new();

    let result: Result<(), _> = backoff
        .execute(&token, |_| {
            attempts_at.push(Instant::now());
            async { Err(InitError::transient("connection refused")) }
        })
        .await;
    assert!(result.is_err());

    let nominal = [1_000u64, 2_000, 4_000, 8_000, 16_000];
    assert_eq!(attempts_at.len(), nominal.len() + 1);
    for (gap, base) in attempts_at.windows(2).zip(nominal) {
        let waited = (gap[1] - gap[0]).as_millis() as u64;
        assert!(waited >= base * 3 / 4, "waited {waited} ms for nominal {base}");
        assert!(waited <= base * 5 / 4 + 1, "waited {waited} ms for nominal {base}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_never_consumes_retries() {
    let breaker = Arc::new(CircuitBreaker::new("remote_api", BreakerPolicy::consecutive()));
    let policy = ResiliencePolicy::new(
        breaker.clone(),
        ExponentialBackoff::new(BackoffPolicy {
            delays_ms: vec![100, 200],
            jitter_factor: 0.25,
        }),
    );
    let token = CancellationToken::new();
    let calls = AtomicU32::new(0);

    // Five exhausted retry sequences, three attempts each.
    for _ in 0..5 {
        let result: Result<(), _> = policy
            .call(&token, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(InitError::transient("timeout")) }
            })
            .await;
        assert!(matches!(result, Err(ResilienceError::RetriesExhausted { attempts: 3, .. })));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 15);
    assert_eq!(breaker.state(), CircuitState::Open);

    let result: Result<(), _> = policy
        .call(&token, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), InitError>(()) }
        })
        .await;
    assert!(matches!(result, Err(ResilienceError::CircuitOpen(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 15);
}
