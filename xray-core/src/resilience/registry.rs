//! Named breaker registry.
//!
//! One breaker per backend name for the life of the process. The registry is
//! owned by the service container and handed out as `Arc`, so every caller
//! touching "detector" shares the same counters.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::circuit_breaker::{BreakerStatus, CircuitBreaker, CircuitBreakerConfig};

/// Breaker name for the bounding-box detector.
pub const DETECTOR: &str = "detector";
/// Breaker name for the vision-language model.
pub const VISION_MODEL: &str = "vision_model";

/// Shared reference to a registry.
pub type SharedBreakerRegistry = Arc<BreakerRegistry>;

#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: Mutex<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the two backend breakers.
    pub fn with_backends(detector: CircuitBreakerConfig, vision_model: CircuitBreakerConfig) -> Self {
        let registry = Self::new();
        registry.register(DETECTOR, detector);
        registry.register(VISION_MODEL, vision_model);
        registry
    }

    pub fn shared(self) -> SharedBreakerRegistry {
        Arc::new(self)
    }

    /// Get the breaker for `name`, creating it with `config` on first use.
    ///
    /// A later call with a different config returns the existing breaker.
    pub fn register(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Status of every breaker, ordered by name.
    pub fn status_all(&self) -> Vec<BreakerStatus> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        breakers.iter().map(|b| b.status()).collect()
    }

    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for breaker in breakers {
            breaker.reset();
        }
    }
}
