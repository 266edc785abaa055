//! Bounded retry with exponential backoff.
//!
//! Eligibility is decided structurally from [`ErrorKind`]: a failure whose
//! kind is in the policy's retryable set is retried after
//! `min_wait · 2^(attempt-1)`, clamped to `[min_wait, max_wait]`. Anything
//! else propagates on first occurrence. After the last attempt the final
//! error is returned unchanged.
//!
//! Retries run *inside* a breaker-protected call, so the breaker sees one
//! outcome per exhausted retry sequence.

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::error::{ErrorKind, ServiceError, ServiceResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
    pub retry_on: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(10))
    }
}

impl RetryPolicy {
    /// Policy retrying every kind for which [`ErrorKind::is_retriable`] holds.
    pub fn new(max_attempts: u32, min_wait: Duration, max_wait: Duration) -> Self {
        Self {
            max_attempts,
            min_wait,
            max_wait,
            retry_on: vec![ErrorKind::Inference, ErrorKind::ResourceExhausted],
        }
    }

    /// Transient inference failures: 3 attempts, 1–10 s.
    pub fn inference() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(10))
            .with_retry_on([ErrorKind::Inference])
    }

    /// Accelerator memory pressure: 2 attempts, 2–15 s to let memory free up.
    pub fn resource() -> Self {
        Self::new(2, Duration::from_secs(2), Duration::from_secs(15))
            .with_retry_on([ErrorKind::ResourceExhausted])
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO).with_retry_on([])
    }

    pub fn with_retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retry_on = kinds.into_iter().collect();
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be > 0".to_string());
        }
        if self.min_wait > self.max_wait {
            return Err(format!(
                "min_wait ({:?}) must not exceed max_wait ({:?})",
                self.min_wait, self.max_wait
            ));
        }
        Ok(())
    }

    pub fn should_retry(&self, err: &ServiceError) -> bool {
        self.retry_on.contains(&err.kind())
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.min_wait
            .saturating_mul(1u32 << exp)
            .max(self.min_wait)
            .min(self.max_wait)
    }

    /// Run `op` until it succeeds, fails non-retryably, or attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, op: F) -> ServiceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ServiceResult<T>>,
    {
        self.run_if(label, op, |_| true).await
    }

    /// Like [`RetryPolicy::run`], additionally requiring `allow(err)` before
    /// each retry. Streaming callers use this to stop retrying once output
    /// has already been forwarded.
    pub async fn run_if<T, F, Fut, P>(&self, label: &str, mut op: F, allow: P) -> ServiceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ServiceResult<T>>,
        P: Fn(&ServiceError) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !self.should_retry(&err) || !allow(&err) {
                return Err(err);
            }
            if attempt >= max_attempts {
                error!(
                    operation = label,
                    attempts = attempt,
                    error = %err,
                    "all retry attempts failed"
                );
                return Err(err);
            }

            let delay = self.delay_for(attempt);
            warn!(
                operation = label,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
