//! Resilience patterns for outbound calls.
//!
//! Provides circuit breaking, retry with backoff, failure classification and
//! token-bucket rate limiting.

pub mod circuit_breaker;
pub mod classify;
pub mod rate_limiter;
pub mod registry;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitPermit, CircuitState,
    CircuitStateListener, StateTransition,
};
pub use classify::{classify_io_error, classify_status, DefaultClassifier, UnknownErrorPolicy};
pub use rate_limiter::{
    keys, PerEndpointRateLimiter, RateLimiter, RateLimiterConfig, RateLimiterMetrics, TokenBucket,
};
pub use registry::CircuitBreakerRegistry;
pub use retry::{Classifier, ErrorClass, RetryExecutor, RetryOutcome, RetryPolicy};
