//! Per-attempt tracing hooks.
//!
//! [`ResilientClient`](crate::client::ResilientClient) reports the start and
//! end of every attempt, HTTP or not, to an [`AttemptTracer`]. The default
//! [`NoopTracer`] does nothing; [`SpanTracer`] opens a `tracing` span per
//! attempt with OpenTelemetry-style client attributes.

use std::time::Duration;
use tracing::{field::Empty, info_span, Span};

/// Identifies one transport attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptContext {
    /// Client (dependency) name.
    pub client: String,
    /// HTTP method, or the operation name for non-HTTP calls.
    pub method: String,
    /// Target URL. Empty for non-HTTP calls.
    pub url: String,
    /// Attempt number, starting at 1.
    pub attempt: u32,
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// A response arrived, whatever its status.
    Response {
        /// HTTP status code.
        status: u16,
    },
    /// A non-HTTP operation returned successfully.
    Completed,
    /// The attempt failed before a response arrived.
    Failed {
        /// Error description.
        error: String,
    },
}

impl AttemptOutcome {
    /// Whether the attempt produced a 2xx response or completed.
    pub fn is_success(&self) -> bool {
        match self {
            AttemptOutcome::Response { status } => (200..300).contains(status),
            AttemptOutcome::Completed => true,
            AttemptOutcome::Failed { .. } => false,
        }
    }

    /// Status code, if a response arrived.
    pub fn status(&self) -> Option<u16> {
        match self {
            AttemptOutcome::Response { status } => Some(*status),
            AttemptOutcome::Completed | AttemptOutcome::Failed { .. } => None,
        }
    }
}

/// Observer of individual transport attempts.
///
/// Both methods default to no-ops, so implementors override only what they
/// need. The span returned by `start` is entered around the attempt.
pub trait AttemptTracer: Send + Sync {
    /// Called before the attempt is sent.
    fn start(&self, _context: &AttemptContext) -> Span {
        Span::none()
    }

    /// Called once the attempt has completed.
    fn end(
        &self,
        _span: &Span,
        _context: &AttemptContext,
        _outcome: &AttemptOutcome,
        _elapsed: Duration,
    ) {
    }
}

/// Tracer that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl AttemptTracer for NoopTracer {}

/// Tracer emitting one `tracing` span per attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpanTracer;

impl AttemptTracer for SpanTracer {
    fn start(&self, context: &AttemptContext) -> Span {
        info_span!(
            "outbound_request",
            client = %context.client,
            http.method = %context.method,
            http.url = %context.url,
            attempt = context.attempt,
            otel.kind = "client",
            otel.status_code = Empty,
            http.status_code = Empty,
            error.message = Empty,
            duration_ms = Empty,
        )
    }

    fn end(
        &self,
        span: &Span,
        _context: &AttemptContext,
        outcome: &AttemptOutcome,
        elapsed: Duration,
    ) {
        span.record("duration_ms", elapsed.as_millis() as u64);
        match outcome {
            AttemptOutcome::Response { status } => {
                span.record("http.status_code", *status);
                let code = if outcome.is_success() { "OK" } else { "ERROR" };
                span.record("otel.status_code", code);
            }
            AttemptOutcome::Completed => {
                span.record("otel.status_code", "OK");
            }
            AttemptOutcome::Failed { error } => {
                span.record("otel.status_code", "ERROR");
                span.record("error.message", error.as_str());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> AttemptContext {
        AttemptContext {
            client: "inventory".to_string(),
            method: "GET".to_string(),
            url: "http://inventory/items".to_string(),
            attempt: 1,
        }
    }

    #[test]
    fn test_outcome_helpers() {
        assert!(AttemptOutcome::Response { status: 204 }.is_success());
        assert!(!AttemptOutcome::Response { status: 503 }.is_success());
        assert_eq!(AttemptOutcome::Response { status: 503 }.status(), Some(503));
        assert!(AttemptOutcome::Completed.is_success());
        assert_eq!(AttemptOutcome::Completed.status(), None);
        assert_eq!(
            AttemptOutcome::Failed {
                error: "reset".to_string()
            }
            .status(),
            None
        );
    }

    #[test]
    fn test_tracers_without_subscriber() {
        let ctx = context();
        for tracer in [&NoopTracer as &dyn AttemptTracer, &SpanTracer] {
            let span = tracer.start(&ctx);
            tracer.end(
                &span,
                &ctx,
                &AttemptOutcome::Response { status: 200 },
                Duration::from_millis(3),
            );
        }
        assert!(NoopTracer.start(&ctx).is_none());
    }
}
