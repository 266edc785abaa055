//! Circuit breaker guarding one ML backend.
//!
//! The breaker counts consecutive backend failures. When they reach
//! `failure_threshold` the circuit *opens* and calls fail fast with
//! [`ServiceError::CircuitOpen`]. Once `recovery_timeout` has elapsed since
//! the last failure, reading the state moves it to *half-open*; enough
//! consecutive successes close it again, any failure re-opens it.
//!
//! ```text
//! Closed ──failures ≥ threshold──▶ Open ──timeout elapsed (on read)──▶ HalfOpen
//!    ▲                                ▲                                  │
//!    └──────successes ≥ threshold─────┼──────────────────────────────────┤
//!                                     └───────────any failure────────────┘
//! ```
//!
//! Time is measured with [`tokio::time::Instant`] so tests can drive the
//! recovery timeout with a paused clock.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ServiceError, ServiceResult};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy, calls pass through.
    Closed,
    /// Tripped, calls are rejected without reaching the backend.
    Open,
    /// Recovery timeout elapsed, calls are let through as probes.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Thresholds for one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time after the last failure before Open → HalfOpen.
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes before the circuit closes.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Lightweight detector: recovers quickly.
    pub fn detector() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }

    /// Large generative model: give it longer to come back.
    pub fn vision_model() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(120),
            success_threshold: 2,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be > 0".to_string());
        }
        if self.success_threshold == 0 {
            return Err("success_threshold must be > 0".to_string());
        }
        Ok(())
    }
}

/// Serialized thresholds inside a [`BreakerStatus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfigView {
    pub failure_threshold: u32,
    /// Seconds.
    pub recovery_timeout: f64,
    pub success_threshold: u32,
}

/// Operational snapshot of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub config: BreakerConfigView,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
}

/// Circuit breaker for a single named backend.
///
/// All counters live behind one mutex so a transition updates them together.
/// The lock is never held across an `.await`.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure: None,
                last_failure_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open → HalfOpen once the recovery timeout has elapsed.
    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let Some(last) = inner.last_failure else {
            return;
        };
        let elapsed = last.elapsed();
        if elapsed >= self.config.recovery_timeout {
            inner.state = CircuitState::HalfOpen;
            inner.consecutive_successes = 0;
            info!(
                breaker = %self.name,
                elapsed_secs = elapsed.as_secs_f64(),
                "circuit breaker entering half-open state"
            );
        }
    }

    /// Current state. Reading it may move Open → HalfOpen.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Run `f` under breaker protection.
    ///
    /// Fails with [`ServiceError::CircuitOpen`] without calling `f` while the
    /// circuit is open. Only errors whose kind counts against the breaker
    /// are recorded as failures; other errors pass through untouched.
    pub async fn call<T, F, Fut>(&self, f: F) -> ServiceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ServiceResult<T>>,
    {
        if self.state() == CircuitState::Open {
            warn!(breaker = %self.name, "circuit breaker open, rejecting call");
            return Err(ServiceError::CircuitOpen {
                service: self.name.clone(),
            });
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                if err.kind().counts_against_breaker() {
                    self.record_failure(&err);
                }
                Err(err)
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                debug!(
                    breaker = %self.name,
                    successes = inner.consecutive_successes,
                    threshold = self.config.success_threshold,
                    "half-open probe succeeded"
                );
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    info!(breaker = %self.name, "circuit breaker closed after recovery");
                }
            }
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, err: &ServiceError) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.consecutive_successes = 0;
                warn!(breaker = %self.name, error = %err, "circuit breaker re-opened from half-open");
            }
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                warn!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    error = %err,
                    "circuit breaker opened"
                );
            }
            _ => debug!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                threshold = self.config.failure_threshold,
                "backend failure recorded"
            ),
        }
    }

    /// Force Closed with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.last_failure = None;
        inner.last_failure_at = None;
        info!(breaker = %self.name, "circuit breaker manually reset");
    }

    pub fn status(&self) -> BreakerStatus {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        BreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.consecutive_failures,
            success_count: inner.consecutive_successes,
            last_failure: inner.last_failure_at,
            config: BreakerConfigView {
                failure_threshold: self.config.failure_threshold,
                recovery_timeout: self.config.recovery_timeout.as_secs_f64(),
                success_threshold: self.config.success_threshold,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: u32, timeout_secs: u64, successes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: failures,
                recovery_timeout: Duration::from_secs(timeout_secs),
                success_threshold: successes,
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> ServiceResult<()> {
        cb.call(|| async { Err::<(), _>(ServiceError::inference("boom")) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> ServiceResult<u32> {
        cb.call(|| async { Ok(7) }).await
    }

    #[tokio::test]
    async fn test_circuit_starts_closed() {
        let cb = breaker(3, 60, 2);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 60, 2);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        succeed(&cb).await.unwrap();
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.status().failure_count, 1);
    }

    #[tokio::test]
    async fn test_non_backend_errors_are_not_counted() {
        let cb = breaker(1, 60, 1);
        let err = cb
            .call(|| async { Err::<(), _>(ServiceError::Cancelled("client left".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Cancelled(_)));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_does_not_recover_before_timeout() {
        let cb = breaker(1, 60, 1);
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes_open_circuit() {
        let cb = breaker(1, 600, 1);
        let _ = fail(&cb).await;
        assert!(cb.is_open());
        cb.reset();
        let status = cb.status();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert!(status.last_failure.is_none());
    }

    #[test]
    fn test_status_serializes_config() {
        let cb = CircuitBreaker::new("vision_model", CircuitBreakerConfig::vision_model());
        let json = serde_json::to_value(cb.status()).unwrap();
        assert_eq!(json["name"], "vision_model");
        assert_eq!(json["state"], "closed");
        assert_eq!(json["config"]["recovery_timeout"], 120.0);
        assert_eq!(json["config"]["failure_threshold"], 3);
    }

    #[test]
    fn test_zero_thresholds_rejected() {
        let cfg = CircuitBreakerConfig {
            failure_threshold: 0,
            ..CircuitBreakerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
