//! Registry for managing named circuit breakers.
//!
//! Allows global access and control (reset/inspection) of circuit breakers by ID.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::circuit_breaker::{CircuitBreaker, CircuitState};

/// Registry keyed by breaker id. Shared by the Connection Manager and the
/// Resilience Coordinator so operators can inspect or force-reset a breaker
/// without holding a reference to the component that created it.
#[derive(Default, Clone)]
pub struct CircuitBreakerRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a breaker under `id`. Overwrites any prior entry.
    pub fn register(&self, id: impl Into<String>, breaker: Arc<CircuitBreaker>) {
        self.inner.lock().unwrap().insert(id.into(), breaker);
    }

    pub fn get(&self, id: &str) -> Option<Arc<CircuitBreaker>> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<CircuitBreaker>> {
        self.inner.lock().unwrap().remove(id)
    }

    /// Force-reset a registered breaker by id.
    pub fn reset(&self, id: &str) -> Result<(), String> {
        match self.get(id) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(format!("breaker id not found: {id}")),
        }
    }

    /// Snapshot of every registered breaker's state, sorted by id.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.inner.lock().unwrap();
        let mut entries: Vec<(String, CircuitState)> = map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
