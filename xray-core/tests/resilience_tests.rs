//! Circuit breaker and retry policy behaviour on a simulated clock.
//!
//! Every time-dependent test pauses the tokio clock and advances it
//! explicitly, so recovery timeouts and backoff sleeps cost nothing.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use xray_core::error::{ServiceError, ServiceResult};
use xray_core::resilience::{
    guarded, BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryPolicy,
    DETECTOR, VISION_MODEL,
};

// ── Helpers ──────────────────────────────────────────────────────────────────

fn breaker(failure_threshold: u32, recovery_secs: u64, success_threshold: u32) -> CircuitBreaker {
    CircuitBreaker::new(
        "detector",
        CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout: Duration::from_secs(recovery_secs),
            success_threshold,
        },
    )
}

async fn failing_call(cb: &CircuitBreaker, calls: &AtomicU32) -> ServiceResult<()> {
    cb.call(|| async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(ServiceError::inference_in("yolo", "cuda error"))
    })
    .await
}

async fn ok_call(cb: &CircuitBreaker, calls: &AtomicU32) -> ServiceResult<&'static str> {
    cb.call(|| async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok("boxes")
    })
    .await
}

// ── Circuit breaker transitions ──────────────────────────────────────────────

#[tokio::test]
async fn three_failures_open_and_fourth_call_fails_fast() {
    let cb = breaker(3, 60, 2);
    let calls = AtomicU32::new(0);

    for _ in 0..3 {
        let err = failing_call(&cb, &calls).await.unwrap_err();
        assert!(matches!(err, ServiceError::Inference { .. }));
    }
    assert_eq!(cb.state(), CircuitState::Open);

    let err = failing_call(&cb, &calls).await.unwrap_err();
    assert!(matches!(err, ServiceError::CircuitOpen { ref service } if service == "detector"));
    assert_eq!(calls.load(Ordering::SeqCst), 3, "wrapped fn must not run while open");
}

#[tokio::test(start_paused = true)]
async fn reading_state_after_timeout_moves_to_half_open() {
    let cb = breaker(3, 60, 2);
    let calls = AtomicU32::new(0);
    for _ in 0..3 {
        let _ = failing_call(&cb, &calls).await;
    }
    assert_eq!(cb.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(cb.state(), CircuitState::HalfOpen);
}

#[tokio::test(start_paused = true)]
async fn two_half_open_successes_close_the_circuit() {
    let cb = breaker(3, 60, 2);
    let calls = AtomicU32::new(0);
    for _ in 0..3 {
        let _ = failing_call(&cb, &calls).await;
    }
    tokio::time::advance(Duration::from_secs(61)).await;

    ok_call(&cb, &calls).await.unwrap();
    assert_eq!(cb.state(), CircuitState::HalfOpen);
    ok_call(&cb, &calls).await.unwrap();
    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.status().failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn half_open_failure_reopens_and_restarts_timer() {
    let cb = breaker(3, 60, 2);
    let calls = AtomicU32::new(0);
    for _ in 0..3 {
        let _ = failing_call(&cb, &calls).await;
    }
    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(cb.state(), CircuitState::HalfOpen);

    let _ = failing_call(&cb, &calls).await;
    assert_eq!(cb.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(cb.state(), CircuitState::Open, "timer restarts from the new failure");
    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(cb.state(), CircuitState::HalfOpen);
}

#[tokio::test(start_paused = true)]
async fn status_document_reflects_open_breaker() {
    let cb = breaker(1, 60, 2);
    let calls = AtomicU32::new(0);
    let _ = failing_call(&cb, &calls).await;

    let json = serde_json::to_value(cb.status()).unwrap();
    assert_eq!(json["state"], "open");
    assert_eq!(json["failure_count"], 1);
    assert_eq!(json["success_count"], 0);
    assert!(json["last_failure"].is_string());
    assert_eq!(json["config"]["success_threshold"], 2);
}

#[tokio::test]
async fn concurrent_failures_are_all_counted() {
    let cb = Arc::new(breaker(50, 60, 2));
    let mut handles = Vec::new();
    for _ in 0..20 {
        let cb = Arc::clone(&cb);
        handles.push(tokio::spawn(async move {
            let _ = cb
                .call(|| async { Err::<(), _>(ServiceError::inference("x")) })
                .await;
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(cb.status().failure_count, 20);
    assert_eq!(cb.state(), CircuitState::Closed);
}

// ── Registry ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn registry_breakers_are_shared_and_resettable() {
    let registry = BreakerRegistry::with_backends(
        CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::detector()
        },
        CircuitBreakerConfig::vision_model(),
    );
    let calls = AtomicU32::new(0);
    let detector = registry.get(DETECTOR).unwrap();
    let _ = failing_call(&detector, &calls).await;

    let again = registry.get(DETECTOR).unwrap();
    assert_eq!(again.state(), CircuitState::Open);
    assert_eq!(registry.get(VISION_MODEL).unwrap().state(), CircuitState::Closed);

    registry.reset_all();
    assert_eq!(detector.state(), CircuitState::Closed);
}

// ── Retry inside breaker ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn exhausted_retry_sequence_counts_once_against_breaker() {
    let cb = breaker(2, 60, 1);
    let policy = RetryPolicy::default();
    let attempts = AtomicU32::new(0);

    let out: ServiceResult<()> = guarded(&cb, &policy, || async {
        attempts.fetch_add(1, Ordering::SeqCst);
        Err(ServiceError::inference("transient"))
    })
    .await;

    assert!(out.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(cb.status().failure_count, 1);
    assert_eq!(cb.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn retry_recovers_before_breaker_notices() {
    let cb = breaker(1, 60, 1);
    let policy = RetryPolicy::inference();
    let attempts = AtomicU32::new(0);

    let out = guarded(&cb, &policy, || async {
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(ServiceError::inference("warming up"))
        } else {
            Ok(42)
        }
    })
    .await;

    assert_eq!(out.unwrap(), 42);
    assert_eq!(cb.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn open_breaker_skips_retry_entirely() {
    let cb = breaker(1, 60, 1);
    let calls = AtomicU32::new(0);
    let _ = failing_call(&cb, &calls).await;

    let attempts = AtomicU32::new(0);
    let out: ServiceResult<()> = guarded(&cb, &RetryPolicy::default(), || async {
        attempts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .await;

    assert!(matches!(out, Err(ServiceError::CircuitOpen { .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn resource_preset_waits_longer() {
    let policy = RetryPolicy::resource();
    let started = tokio::time::Instant::now();
    let attempts = AtomicU32::new(0);

    let out: ServiceResult<()> = policy
        .run("oom", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(ServiceError::ResourceExhausted("CUDA out of memory".into()))
        })
        .await;

    assert!(matches!(out, Err(ServiceError::ResourceExhausted(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(started.elapsed(), Duration::from_secs(2));
}
