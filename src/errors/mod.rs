//! Error types for the resilience layer.
//!
//! Admission refusals (open circuit, saturated half-open trial slots, rate
//! limits), retry exhaustion and cancellation are reported as distinct
//! variants of [`ResilienceError`], separate from the wrapped operation's own
//! error so callers can pattern-match and apply fallbacks.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for resilient operations.
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

/// Error returned by every resilient entry point.
///
/// `E` is the error type of the wrapped operation. Terminal operation errors
/// are carried unmodified in [`ResilienceError::Operation`].
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// The circuit is open and its open timeout has not elapsed yet.
    #[error("Circuit breaker '{name}' is open (retry in {retry_in:?})")]
    CircuitOpen {
        /// Name of the guarded dependency.
        name: String,
        /// Time left until the breaker admits a half-open trial.
        retry_in: Duration,
    },

    /// The circuit is half-open and all trial slots are taken.
    #[error("Circuit breaker '{name}' is half-open and at its trial limit")]
    TooManyRequests {
        /// Name of the guarded dependency.
        name: String,
    },

    /// Every attempt failed with a retryable error.
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Total number of attempts made, including the first one.
        attempts: u32,
        /// Error returned by the final attempt.
        #[source]
        last_error: E,
    },

    /// A rate limiter refused admission.
    #[error("Rate limit exceeded for '{key}'")]
    RateLimited {
        /// Rate limit key that was exhausted.
        key: String,
        /// Time until one token becomes available.
        retry_after: Option<Duration>,
    },

    /// The caller's cancellation signal fired.
    #[error("Operation cancelled")]
    Cancelled,

    /// The operation failed with a terminal error.
    #[error(transparent)]
    Operation(E),
}

impl<E> ResilienceError<E> {
    /// Returns true if the call was refused by the circuit breaker.
    ///
    /// Open and half-open refusals are meant to be handled the same way by
    /// fallback logic.
    pub fn is_circuit_rejection(&self) -> bool {
        matches!(
            self,
            ResilienceError::CircuitOpen { .. } | ResilienceError::TooManyRequests { .. }
        )
    }

    /// Returns true if the call never reached the operation.
    pub fn is_admission_failure(&self) -> bool {
        self.is_circuit_rejection() || matches!(self, ResilienceError::RateLimited { .. })
    }

    /// Returns true if the caller cancelled the call.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ResilienceError::Cancelled)
    }

    /// Returns the underlying operation error, if any.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            ResilienceError::Operation(e) => Some(e),
            ResilienceError::RetriesExhausted { last_error, .. } => Some(last_error),
            _ => None,
        }
    }

    /// Consumes the error, returning the underlying operation error, if any.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            ResilienceError::Operation(e) => Some(e),
            ResilienceError::RetriesExhausted { last_error, .. } => Some(last_error),
            _ => None,
        }
    }

    /// Returns a stable code for this error kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            ResilienceError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            ResilienceError::TooManyRequests { .. } => "CIRCUIT_HALF_OPEN_LIMIT",
            ResilienceError::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            ResilienceError::RateLimited { .. } => "RATE_LIMITED",
            ResilienceError::Cancelled => "CANCELLED",
            ResilienceError::Operation(_) => "OPERATION_FAILED",
        }
    }
}

/// Admission refusal produced by [`CircuitBreaker::acquire`].
///
/// [`CircuitBreaker::acquire`]: crate::resilience::CircuitBreaker::acquire
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CircuitRejected {
    /// The breaker is open.
    #[error("Circuit breaker '{name}' is open")]
    Open {
        /// Breaker name.
        name: String,
        /// Time left until a trial is admitted.
        retry_in: Duration,
    },
    /// The breaker is half-open and saturated.
    #[error("Circuit breaker '{name}' is at its half-open trial limit")]
    HalfOpenSaturated {
        /// Breaker name.
        name: String,
    },
}

impl<E> From<CircuitRejected> for ResilienceError<E> {
    fn from(rejection: CircuitRejected) -> Self {
        match rejection {
            CircuitRejected::Open { name, retry_in } => {
                ResilienceError::CircuitOpen { name, retry_in }
            }
            CircuitRejected::HalfOpenSaturated { name } => {
                ResilienceError::TooManyRequests { name }
            }
        }
    }
}

/// Admission refusal produced by a rate limiter.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Rate limit exceeded for '{key}'")]
pub struct RateLimitExceeded {
    /// Key whose bucket was empty.
    pub key: String,
    /// Time until one token becomes available.
    pub retry_after: Duration,
}

impl<E> From<RateLimitExceeded> for ResilienceError<E> {
    fn from(err: RateLimitExceeded) -> Self {
        ResilienceError::RateLimited {
            key: err.key,
            retry_after: Some(err.retry_after),
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration value is out of range.
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue {
        /// Offending field.
        field: &'static str,
        /// Why the value was rejected.
        message: String,
    },

    /// The base URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The HTTP client could not be built.
    #[error("Failed to create HTTP client: {message}")]
    HttpClient {
        /// Error message.
        message: String,
    },

    /// The logging subscriber could not be installed.
    #[error("Logging setup failed: {message}")]
    Logging {
        /// Error message.
        message: String,
    },
}

impl ConfigError {
    /// Creates an invalid-value error.
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error, PartialEq)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn test_rejection_converts_to_circuit_errors() {
        let err: ResilienceError<Boom> = CircuitRejected::Open {
            name: "orders".to_string(),
            retry_in: Duration::from_secs(5),
        }
        .into();
        assert!(matches!(err, ResilienceError::CircuitOpen { ref name, .. } if name == "orders"));
        assert!(err.is_circuit_rejection());

        let err: ResilienceError<Boom> = CircuitRejected::HalfOpenSaturated {
            name: "orders".to_string(),
        }
        .into();
        assert!(matches!(err, ResilienceError::TooManyRequests { .. }));
        assert!(err.is_admission_failure());
    }

    #[test]
    fn test_operation_error_is_transparent() {
        let err = ResilienceError::Operation(Boom);
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.operation_error(), Some(&Boom));
        assert!(!err.is_admission_failure());
    }

    #[test]
    fn test_retries_exhausted_keeps_source() {
        let err = ResilienceError::RetriesExhausted {
            attempts: 4,
            last_error: Boom,
        };
        assert_eq!(err.to_string(), "Retries exhausted after 4 attempts: boom");
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.error_code(), "RETRIES_EXHAUSTED");
        assert_eq!(err.into_operation_error(), Some(Boom));
    }

    #[test]
    fn test_rate_limit_conversion() {
        let err: ResilienceError<Boom> = RateLimitExceeded {
            key: "10.0.0.1".to_string(),
            retry_after: Duration::from_millis(200),
        }
        .into();
        match err {
            ResilienceError::RateLimited { key, retry_after } => {
                assert_eq!(key, "10.0.0.1");
                assert_eq!(retry_after, Some(Duration::from_millis(200)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
