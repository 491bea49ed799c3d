//! Registry of named circuit breakers.
//!
//! A registry is constructed explicitly by the composition root and passed
//! down; there is no process-wide default. Concurrent first use of a name
//! always yields a single shared breaker.

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitStateListener,
};

/// Lazily creates and caches one [`CircuitBreaker`] per dependency name.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
    listeners: Vec<Arc<dyn CircuitStateListener>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry whose breakers use `default_config`.
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
            listeners: Vec::new(),
        }
    }

    /// Attaches a listener to every breaker created afterwards.
    pub fn with_listener(mut self, listener: Arc<dyn CircuitStateListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Configuration used for breakers created by [`get_or_create`](Self::get_or_create).
    pub fn default_config(&self) -> &CircuitBreakerConfig {
        &self.default_config
    }

    /// Returns the breaker for `name`, creating it with the default
    /// configuration on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, || self.default_config.clone())
    }

    /// Returns the breaker for `name`, creating it with `config` on first use.
    /// An existing breaker keeps its original configuration.
    pub fn get_or_create_with<F>(&self, name: &str, config: F) -> Arc<CircuitBreaker>
    where
        F: FnOnce() -> CircuitBreakerConfig,
    {
        if let Some(breaker) = self.breakers.get(name) {
            return breaker.value().clone();
        }

        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(breaker = %name, "Creating circuit breaker");
                Arc::new(
                    CircuitBreaker::with_config(name, config())
                        .with_listeners(self.listeners.iter().cloned()),
                )
            })
            .value()
            .clone()
    }

    /// Returns the breaker for `name` if it exists.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| entry.value().clone())
    }

    /// Removes a breaker. Holders of the removed instance keep using it.
    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(name).map(|(_, breaker)| breaker)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered breakers.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether no breaker has been created yet.
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn metrics(&self) -> Vec<CircuitMetrics> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();
        let mut metrics: Vec<CircuitMetrics> = breakers.iter().map(|b| b.metrics()).collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    /// Forces every breaker back to closed.
    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();
        for breaker in breakers {
            breaker.reset();
        }
    }
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.names())
            .field("default_config", &self.default_config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::RecordingListener;
    use crate::resilience::CircuitState;
    use std::time::Duration;

    #[test]
    fn test_same_instance_per_name() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get_or_create("inventory");
        let b = registry.get_or_create("inventory");
        let c = registry.get_or_create("billing");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.names(), vec!["billing", "inventory"]);
    }

    #[test]
    fn test_concurrent_first_use_creates_one_instance() {
        let registry = Arc::new(CircuitBreakerRegistry::default());
        let barrier = Arc::new(std::sync::Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.get_or_create("shared")
                })
            })
            .collect();

        let breakers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for breaker in &breakers[1..] {
            assert!(Arc::ptr_eq(&breakers[0], breaker));
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_existing_breaker_keeps_config() {
        let registry = CircuitBreakerRegistry::default();
        let first = registry.get_or_create_with("db", || {
            CircuitBreakerConfig::new().failure_threshold(1)
        });
        let second = registry.get_or_create_with("db", || {
            CircuitBreakerConfig::new().failure_threshold(9)
        });

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().failure_threshold, 1);
    }

    #[tokio::test]
    async fn test_listeners_and_reset_all() {
        let listener = Arc::new(RecordingListener::new());
        let registry = CircuitBreakerRegistry::new(
            CircuitBreakerConfig::new()
                .failure_threshold(1)
                .open_timeout(Duration::from_secs(60)),
        )
        .with_listener(listener.clone());

        let breaker = registry.get_or_create("search");
        let _ = breaker.execute(|| async { Err::<(), _>("boom") }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        registry.reset_all();
        assert_eq!(breaker.state(), CircuitState::Closed);

        let states: Vec<_> = listener.transitions().into_iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            states,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn test_remove_and_metrics() {
        let registry = CircuitBreakerRegistry::default();
        registry.get_or_create("a");
        registry.get_or_create("b");

        assert!(registry.remove("a").is_some());
        assert!(registry.get("a").is_none());
        let metrics = registry.metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].name, "b");
        assert_eq!(metrics[0].state, CircuitState::Closed);
    }
}
