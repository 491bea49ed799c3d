//! Aggregated metrics snapshot.
//!
//! Components expose plain `metrics()` snapshots. [`ResilienceSnapshot`]
//! gathers them for an external collector; nothing here runs on a schedule.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::client::{ClientMetrics, ResilientClient};
use crate::resilience::{
    CircuitBreakerRegistry, CircuitMetrics, CircuitState, RateLimiter, RateLimiterMetrics,
};

/// Metrics of every resilience component at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResilienceSnapshot {
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Circuit breakers.
    pub breakers: Vec<CircuitMetrics>,
    /// Keyed rate limiters.
    pub rate_limiters: Vec<RateLimiterMetrics>,
    /// Resilient clients.
    pub clients: Vec<ClientMetrics>,
}

impl Default for ResilienceSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl ResilienceSnapshot {
    /// Creates an empty snapshot stamped now.
    pub fn new() -> Self {
        Self {
            taken_at: Utc::now(),
            breakers: Vec::new(),
            rate_limiters: Vec::new(),
            clients: Vec::new(),
        }
    }

    /// Adds every breaker in a registry.
    pub fn with_registry(mut self, registry: &CircuitBreakerRegistry) -> Self {
        self.breakers.extend(registry.metrics());
        self
    }

    /// Adds a rate limiter.
    pub fn with_rate_limiter<R>(mut self, limiter: &RateLimiter<R>) -> Self {
        self.rate_limiters.push(limiter.metrics());
        self
    }

    /// Adds several rate limiter snapshots, e.g. from a per-endpoint limiter.
    pub fn with_rate_limiter_metrics(
        mut self,
        metrics: impl IntoIterator<Item = RateLimiterMetrics>,
    ) -> Self {
        self.rate_limiters.extend(metrics);
        self
    }

    /// Adds a client.
    pub fn with_client(mut self, client: &ResilientClient) -> Self {
        self.clients.push(client.metrics());
        self
    }

    /// Names of breakers that are not closed.
    pub fn unhealthy_breakers(&self) -> Vec<&str> {
        self.breakers
            .iter()
            .filter(|b| b.state != CircuitState::Closed)
            .map(|b| b.name.as_str())
            .collect()
    }

    /// Serializes the snapshot as JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitBreakerConfig, RateLimiterConfig};

    #[tokio::test]
    async fn test_snapshot_collects_components() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::new().failure_threshold(1));
        registry.get_or_create("healthy");
        let broken = registry.get_or_create("broken");
        let _ = broken.execute(|| async { Err::<(), _>("down") }).await;

        let limiter: RateLimiter<()> =
            RateLimiter::new("inbound", RateLimiterConfig::default(), |_| String::new());
        limiter.allow_key("k");

        let snapshot = ResilienceSnapshot::new()
            .with_registry(&registry)
            .with_rate_limiter(&limiter);

        assert_eq!(snapshot.breakers.len(), 2);
        assert_eq!(snapshot.unhealthy_breakers(), vec!["broken"]);
        assert_eq!(snapshot.rate_limiters[0].allowed, 1);

        let json: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(json["breakers"][0]["name"], "broken");
        assert_eq!(json["breakers"][0]["state"], "open");
        assert_eq!(json["rate_limiters"][0]["name"], "inbound");
    }
}
