//! Outbound Resilience
//!
//! Resilience controls for service-to-service calls:
//!
//! - **Circuit breaking**: a closed/open/half-open state machine per dependency
//! - **Retry**: exponential backoff with jitter and pluggable failure classification
//! - **Rate limiting**: lazily refilled token buckets, keyed per client or per route
//! - **Composition**: [`ResilientClient`] runs a transport call through all of the above
//! - **Observability**: `tracing` events, per-attempt spans and serializable metrics
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use outbound_resilience::{CircuitBreakerRegistry, ClientConfig, ResilientClient};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = CircuitBreakerRegistry::default();
//!     let config = ClientConfig::new("inventory", "http://inventory.internal");
//!     let client = ResilientClient::from_config(&config, Some(&registry))?;
//!
//!     let response = client.get(&CancellationToken::new(), "/items/42").await?;
//!     println!("{}", response.status);
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `rustls` (default) / `native-tls` - TLS backend of the reqwest transport
//! - `mocks` - test doubles for downstream tests

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod errors;
pub mod observability;
pub mod resilience;
pub mod transport;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

// Re-exports for convenience
pub use client::{ClientMetrics, ClientResult, ResilientClient, ResilientClientBuilder};
pub use config::{ClientConfig, ResilienceConfig, ResilienceConfigBuilder};
pub use errors::{CircuitRejected, ConfigError, RateLimitExceeded, ResilienceError, ResilienceResult};
pub use observability::{init_logging, LogConfig, ResilienceSnapshot};
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, Classifier,
    DefaultClassifier, ErrorClass, PerEndpointRateLimiter, RateLimiter, RateLimiterConfig,
    RetryExecutor, RetryPolicy, TokenBucket, UnknownErrorPolicy,
};
pub use transport::{HttpRequest, HttpResponse, Method, ReqwestTransport, Transport, TransportError};
