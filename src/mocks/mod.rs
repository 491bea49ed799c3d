//! Test doubles for the resilience layer.
//!
//! Compiled for unit tests and behind the `mocks` feature for downstream
//! crates that want to test their own wiring.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::{ready, Ready};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::Span;

use crate::observability::{AttemptContext, AttemptOutcome, AttemptTracer};
use crate::resilience::{CircuitStateListener, StateTransition};
use crate::transport::{HttpRequest, HttpResponse, Transport, TransportError};

/// Base URL reported by [`MockTransport::url_for`].
pub const MOCK_BASE_URL: &str = "http://mock.local";

/// A canned response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body.
    pub body: Bytes,
}

impl MockResponse {
    /// A response with an empty body.
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Bytes::new(),
        }
    }

    /// A 200 response with a JSON body.
    pub fn json(body: serde_json::Value) -> Self {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self {
            status: 200,
            headers,
            body: Bytes::from(body.to_string()),
        }
    }

    /// An error response with a plain-text body.
    pub fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Bytes::from(message.to_string()),
        }
    }

    /// A 429 response carrying `Retry-After`.
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        let mut response = Self::error(429, "rate limited");
        response
            .headers
            .insert("retry-after".to_string(), retry_after_secs.to_string());
        response
    }

    fn into_response(self) -> HttpResponse {
        HttpResponse {
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }
}

type Reply = Result<MockResponse, TransportError>;

/// Transport returning queued replies and recording every request.
///
/// When the queue is empty the default reply is used, or a 500 if none is set.
#[derive(Debug, Default)]
pub struct MockTransport {
    replies: Mutex<VecDeque<Reply>>,
    default_reply: Option<Reply>,
    latency: Option<Duration>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    /// Creates an empty mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply used once the queue is drained.
    pub fn with_default(mut self, response: MockResponse) -> Self {
        self.default_reply = Some(Ok(response));
        self
    }

    /// Error used once the queue is drained.
    pub fn with_default_error(mut self, error: TransportError) -> Self {
        self.default_reply = Some(Err(error));
        self
    }

    /// Delay applied to every request before it replies.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queues a response.
    pub fn enqueue(&self, response: MockResponse) {
        self.replies.lock().push_back(Ok(response));
    }

    /// Queues a transport error.
    pub fn enqueue_error(&self, error: TransportError) {
        self.replies.lock().push_back(Err(error));
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests received.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn next_reply(&self) -> Reply {
        self.replies
            .lock()
            .pop_front()
            .or_else(|| self.default_reply.clone())
            .unwrap_or_else(|| Ok(MockResponse::error(500, "no mock response configured")))
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().push(request);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.next_reply().map(MockResponse::into_response)
    }

    fn url_for(&self, request: &HttpRequest) -> String {
        format!("{}/{}", MOCK_BASE_URL, request.path.trim_start_matches('/'))
    }
}

/// Operation replaying a fixed script of results and counting invocations.
///
/// Once the script is exhausted the last entry repeats.
#[derive(Debug)]
pub struct ScriptedOperation<T, E> {
    script: Vec<Result<T, E>>,
    calls: AtomicUsize,
}

impl<T: Clone, E: Clone> ScriptedOperation<T, E> {
    /// Creates an operation from a non-empty script.
    pub fn new(script: Vec<Result<T, E>>) -> Self {
        assert!(!script.is_empty(), "script must not be empty");
        Self {
            script,
            calls: AtomicUsize::new(0),
        }
    }

    /// An operation that always returns `result`.
    pub fn repeating(result: Result<T, E>) -> Self {
        Self::new(vec![result])
    }

    /// Runs the next step of the script.
    pub fn call(&self) -> Ready<Result<T, E>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let index = n.min(self.script.len() - 1);
        ready(self.script[index].clone())
    }

    /// Number of invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// One completed attempt seen by a [`RecordingTracer`].
#[derive(Debug, Clone)]
pub struct TraceRecord {
    /// Attempt identity.
    pub context: AttemptContext,
    /// How the attempt ended.
    pub outcome: AttemptOutcome,
    /// Attempt duration.
    pub elapsed: Duration,
}

/// Tracer that keeps every completed attempt in memory.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    started: AtomicUsize,
    records: Mutex<Vec<TraceRecord>>,
}

impl RecordingTracer {
    /// Creates an empty tracer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts started.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Completed attempts in order.
    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.lock().clone()
    }
}

impl AttemptTracer for RecordingTracer {
    fn start(&self, _context: &AttemptContext) -> Span {
        self.started.fetch_add(1, Ordering::SeqCst);
        Span::none()
    }

    fn end(
        &self,
        _span: &Span,
        context: &AttemptContext,
        outcome: &AttemptOutcome,
        elapsed: Duration,
    ) {
        self.records.lock().push(TraceRecord {
            context: context.clone(),
            outcome: outcome.clone(),
            elapsed,
        });
    }
}

/// Listener that keeps every state transition in memory.
#[derive(Debug, Default)]
pub struct RecordingListener {
    transitions: Mutex<Vec<StateTransition>>,
}

impl RecordingListener {
    /// Creates an empty listener.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transitions observed so far, in order.
    pub fn transitions(&self) -> Vec<StateTransition> {
        self.transitions.lock().clone()
    }
}

impl CircuitStateListener for RecordingListener {
    fn on_state_change(&self, transition: &StateTransition) {
        self.transitions.lock().push(transition.clone());
    }
}
