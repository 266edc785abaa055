//! Fault isolation for calls into unreliable ML backends.
//!
//! - [`circuit_breaker`]: per-backend Closed/Open/HalfOpen state machine.
//! - [`registry`]: process-lifetime breakers keyed by backend name.
//! - [`retry`]: bounded exponential-backoff retry keyed on [`ErrorKind`].
//!
//! The two compose as `breaker.call(|| retry.run(op))`; see
//! [`guarded`].
//!
//! [`ErrorKind`]: crate::error::ErrorKind

pub mod circuit_breaker;
pub mod registry;
pub mod retry;

use std::future::Future;

pub use circuit_breaker::{
    BreakerConfigView, BreakerStatus, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use registry::{BreakerRegistry, SharedBreakerRegistry, DETECTOR, VISION_MODEL};
pub use retry::RetryPolicy;

use crate::error::ServiceResult;

/// Run `op` with retries inside `breaker`.
pub async fn guarded<T, F, Fut>(
    breaker: &CircuitBreaker,
    retry: &RetryPolicy,
    op: F,
) -> ServiceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServiceResult<T>>,
{
    breaker.call(|| retry.run(breaker.name(), op)).await
}
