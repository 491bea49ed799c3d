//! Configuration for resilient clients and the shared resilience components.
//!
//! Everything here is plain data: values are supplied by the composition
//! root (deserialized from whatever source it uses, or built in code) and
//! checked with `validate()`. Nothing is read from files or the environment.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use url::Url;

use crate::errors::ConfigError;
use crate::observability::LogConfig;
use crate::resilience::{
    CircuitBreakerConfig, CircuitBreakerRegistry, RateLimiterConfig, RetryPolicy,
    UnknownErrorPolicy,
};

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration of one [`ResilientClient`](crate::client::ResilientClient).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Dependency name; also the circuit breaker name.
    pub name: String,
    /// Base URL requests are resolved against.
    pub base_url: String,
    /// Timeout applied to each individual attempt.
    pub timeout: Duration,
    /// Circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry settings.
    pub retry: RetryPolicy,
    /// Treatment of unrecognised failures.
    pub unknown_errors: UnknownErrorPolicy,
    /// Optional outbound rate limit.
    pub rate_limit: Option<RateLimiterConfig>,
    /// Headers added to every request unless already present.
    pub default_headers: HashMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            base_url: String::new(),
            timeout: DEFAULT_TIMEOUT,
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            unknown_errors: UnknownErrorPolicy::default(),
            rate_limit: None,
            default_headers: HashMap::new(),
        }
    }
}

impl ClientConfig {
    /// Creates a configuration for `name` at `base_url`.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Set the per-attempt timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the circuit breaker configuration
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Set the retry policy
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Set the unknown-error policy
    pub fn unknown_errors(mut self, policy: UnknownErrorPolicy) -> Self {
        self.unknown_errors = policy;
        self
    }

    /// Set an outbound rate limit
    pub fn rate_limit(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    /// Add a default header
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// Validates every nested setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "must not be empty"));
        }
        Url::parse(&self.base_url)?;
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("timeout", "must be non-zero"));
        }
        self.circuit_breaker.validate()?;
        self.retry.validate()?;
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        Ok(())
    }

    /// Worst-case wall-clock time of one call: every attempt times out and
    /// every backoff reaches `max_delay` plus full upward jitter.
    pub fn worst_case_duration(&self) -> Duration {
        let attempts = self.retry.max_retries.saturating_add(1);
        self.timeout
            .saturating_add(self.retry.max_jittered_delay())
            .saturating_mul(attempts)
    }
}

/// Top-level configuration for a process's resilience layer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Default configuration for breakers created through the registry.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Default keyed (inbound) rate limiter configuration.
    pub rate_limiter: RateLimiterConfig,
    /// Outbound clients.
    pub clients: Vec<ClientConfig>,
    /// Logging setup.
    pub logging: LogConfig,
}

impl ResilienceConfig {
    /// Creates a builder.
    pub fn builder() -> ResilienceConfigBuilder {
        ResilienceConfigBuilder::default()
    }

    /// Validates every section and checks client names are unique.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker.validate()?;
        self.rate_limiter.validate()?;

        let mut names = HashSet::new();
        for client in &self.clients {
            client.validate()?;
            if !names.insert(client.name.as_str()) {
                return Err(ConfigError::invalid(
                    "clients",
                    format!("duplicate client name '{}'", client.name),
                ));
            }
        }
        Ok(())
    }

    /// Configuration of the client called `name`.
    pub fn client(&self, name: &str) -> Option<&ClientConfig> {
        self.clients.iter().find(|c| c.name == name)
    }

    /// Creates an empty breaker registry using the default breaker settings.
    pub fn registry(&self) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(self.circuit_breaker.clone())
    }
}

/// Builder for [`ResilienceConfig`].
#[derive(Debug, Default)]
pub struct ResilienceConfigBuilder {
    config: ResilienceConfig,
}

impl ResilienceConfigBuilder {
    /// Sets the default circuit breaker configuration.
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = config;
        self
    }

    /// Sets the default keyed rate limiter configuration.
    pub fn rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.config.rate_limiter = config;
        self
    }

    /// Adds a client.
    pub fn client(mut self, client: ClientConfig) -> Self {
        self.config.clients.push(client);
        self
    }

    /// Sets the logging configuration.
    pub fn logging(mut self, logging: LogConfig) -> Self {
        self.config.logging = logging;
        self
    }

    /// Validates and builds the configuration.
    pub fn build(self) -> Result<ResilienceConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
