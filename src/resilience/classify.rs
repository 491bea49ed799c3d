//! Default failure classification.
//!
//! HTTP statuses and network-layer errors are mapped to [`ErrorClass`]. How
//! unrecognised failures are treated is an explicit choice carried by
//! [`UnknownErrorPolicy`].

use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;

use super::retry::{Classifier, ErrorClass};
use crate::transport::TransportError;

/// How errors with no known classification are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownErrorPolicy {
    /// Retry unknown errors. Favours availability; wrapped operations must be
    /// idempotent.
    #[default]
    Retry,
    /// Fail fast on unknown errors. Favours safety for dependencies whose
    /// unknown failures are likely persistent.
    Fail,
}

impl UnknownErrorPolicy {
    fn class(self) -> ErrorClass {
        match self {
            UnknownErrorPolicy::Retry => ErrorClass::Retryable,
            UnknownErrorPolicy::Fail => ErrorClass::Terminal,
        }
    }
}

/// Classifies an HTTP status, or `None` if the status is not recognised.
pub fn classify_status(status: u16) -> Option<ErrorClass> {
    match status {
        408 | 429 | 500 | 502 | 503 | 504 => Some(ErrorClass::Retryable),
        400 | 401 | 403 | 404 | 409 => Some(ErrorClass::Terminal),
        _ => None,
    }
}

/// Classifies an I/O error, or `None` if its kind is not a known
/// network-layer failure.
pub fn classify_io_error(error: &io::Error) -> Option<ErrorClass> {
    match error.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::TimedOut
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::Interrupted => Some(ErrorClass::Retryable),
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Some(ErrorClass::Terminal),
        _ => None,
    }
}

/// Status-code and network-error classifier shared by HTTP dependencies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultClassifier {
    /// Treatment of unrecognised statuses and errors.
    pub unknown: UnknownErrorPolicy,
}

impl DefaultClassifier {
    /// Availability-biased classifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Safety-biased classifier: unknown failures are terminal.
    pub fn fail_unknown() -> Self {
        Self {
            unknown: UnknownErrorPolicy::Fail,
        }
    }
}

impl Classifier<TransportError> for DefaultClassifier {
    fn classify(&self, error: &TransportError) -> ErrorClass {
        match error {
            TransportError::Cancelled => ErrorClass::Terminal,
            TransportError::Status { status, .. } => {
                classify_status(*status).unwrap_or_else(|| self.unknown.class())
            }
            TransportError::Timeout { .. }
            | TransportError::Connection { .. }
            | TransportError::Dns { .. } => ErrorClass::Retryable,
            TransportError::Request { .. } | TransportError::Decode { .. } => self.unknown.class(),
        }
    }

    fn retry_after(&self, error: &TransportError) -> Option<Duration> {
        error.retry_after()
    }
}

impl Classifier<io::Error> for DefaultClassifier {
    fn classify(&self, error: &io::Error) -> ErrorClass {
        classify_io_error(error).unwrap_or_else(|| self.unknown.class())
    }
}
