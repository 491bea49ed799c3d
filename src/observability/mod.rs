//! Observability for the resilience layer.
//!
//! Provides logging setup, per-attempt tracing hooks and metrics snapshots.

pub mod logging;
pub mod metrics;
pub mod tracing_utils;

pub use logging::{init_logging, LogConfig, LogConfigBuilder, LogFormat, LogLevel};
pub use metrics::ResilienceSnapshot;
pub use tracing_utils::{AttemptContext, AttemptOutcome, AttemptTracer, NoopTracer, SpanTracer};
