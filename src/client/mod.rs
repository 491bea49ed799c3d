//! Resilient client for one outbound dependency.
//!
//! A [`ResilientClient`] composes, in order: an optional outbound token
//! bucket, circuit breaker admission, and the retry loop. The breaker wraps
//! the whole retry sequence, so it reacts to calls that ultimately failed
//! rather than to individual transient errors that retry absorbed.
//!
//! # Timeouts
//!
//! The configured timeout applies to each attempt, not to the call as a
//! whole. A single call may therefore take up to
//! `(max_retries + 1) * (timeout + max_delay * (1 + jitter_fraction))` of
//! wall-clock time; callers should size their own deadlines (or cancel
//! through the token) accordingly.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use crate::config::{ClientConfig, DEFAULT_TIMEOUT};
use crate::errors::{ConfigError, ResilienceError};
use crate::observability::{AttemptContext, AttemptOutcome, AttemptTracer, NoopTracer};
use crate::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitMetrics, CircuitState,
    Classifier, DefaultClassifier, RetryExecutor, RetryPolicy, TokenBucket,
};
use crate::transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError};

/// Method reported to the tracer for attempts made through
/// [`ResilientClient::call`] and [`ResilientClient::call_with`].
pub const OPERATION_METHOD: &str = "CALL";

/// Result of an HTTP call through a [`ResilientClient`].
pub type ClientResult<T> = Result<T, ResilienceError<TransportError>>;

/// Point-in-time view of a client, for export by an external collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientMetrics {
    /// Client name.
    pub name: String,
    /// Breaker snapshot.
    pub circuit: CircuitMetrics,
    /// Calls made through the client.
    pub calls: u64,
    /// Calls that returned a value.
    pub successes: u64,
    /// Calls that failed after admission.
    pub failures: u64,
    /// Calls refused by the circuit breaker.
    pub circuit_rejections: u64,
    /// Calls refused by the outbound rate limit.
    pub rate_limited: u64,
    /// Calls abandoned through cancellation.
    pub cancelled: u64,
    /// Retries performed across all calls.
    pub retries: u64,
}

#[derive(Default)]
struct ClientCounters {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    circuit_rejections: AtomicU64,
    rate_limited: AtomicU64,
    cancelled: AtomicU64,
    retries: AtomicU64,
}

/// Client wrapping calls to one dependency with rate limiting, circuit
/// breaking and retries.
pub struct ResilientClient {
    name: String,
    transport: Arc<dyn Transport>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor,
    classifier: Arc<dyn Classifier<TransportError>>,
    tracer: Arc<dyn AttemptTracer>,
    rate_limit: Option<TokenBucket>,
    timeout: Duration,
    default_headers: HashMap<String, String>,
    counters: ClientCounters,
}

impl ResilientClient {
    /// Creates a builder for a client named `name`.
    pub fn builder(name: impl Into<String>) -> ResilientClientBuilder {
        ResilientClientBuilder::new(name)
    }

    /// Creates a client from configuration, using the reqwest transport.
    ///
    /// When `registry` is given the breaker is shared through it under the
    /// client's name.
    pub fn from_config(
        config: &ClientConfig,
        registry: Option<&CircuitBreakerRegistry>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut builder = Self::builder(config.name.clone())
            .base_url(config.base_url.clone())
            .timeout(config.timeout)
            .circuit_breaker_config(config.circuit_breaker.clone())
            .retry_policy(config.retry.clone())
            .classifier(Arc::new(DefaultClassifier {
                unknown: config.unknown_errors,
            }));
        if let Some(rate_limit) = &config.rate_limit {
            builder = builder.rate_limit(TokenBucket::from_config(rate_limit));
        }
        for (name, value) in &config.default_headers {
            builder = builder.default_header(name.clone(), value.clone());
        }
        if let Some(registry) = registry {
            let breaker =
                registry.get_or_create_with(&config.name, || config.circuit_breaker.clone());
            builder = builder.circuit_breaker(breaker);
        }
        builder.build()
    }

    /// Client name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The breaker guarding this client.
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Current breaker state.
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Retry policy.
    pub fn retry_policy(&self) -> &RetryPolicy {
        self.retry.policy()
    }

    /// Snapshot of client and breaker counters.
    pub fn metrics(&self) -> ClientMetrics {
        let c = &self.counters;
        ClientMetrics {
            name: self.name.clone(),
            circuit: self.breaker.metrics(),
            calls: c.calls.load(Ordering::Relaxed),
            successes: c.successes.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            circuit_rejections: c.circuit_rejections.load(Ordering::Relaxed),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
        }
    }

    /// Runs a transport-level operation with the client's classifier, each
    /// attempt bounded by the client's timeout and reported to the tracer.
    pub async fn call<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> ClientResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let attempt = AtomicU32::new(0);
        self.execute(self.classifier.as_ref(), cancel, || {
            let n = attempt.fetch_add(1, Ordering::Relaxed) + 1;
            self.traced(
                self.operation_context(n),
                self.with_timeout(operation()),
                operation_outcome,
            )
        })
        .await
    }

    /// Runs an operation of any error type with a caller-supplied classifier.
    ///
    /// Attempts are reported to the tracer. The client's per-attempt timeout
    /// is not applied; the operation is expected to bound its own attempts.
    pub async fn call_with<F, Fut, T, E, C>(
        &self,
        classifier: &C,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        C: Classifier<E> + ?Sized,
    {
        let attempt = AtomicU32::new(0);
        self.execute(classifier, cancel, || {
            let n = attempt.fetch_add(1, Ordering::Relaxed) + 1;
            self.traced(self.operation_context(n), operation(), operation_outcome)
        })
        .await
    }

    /// Sends an HTTP request. Non-2xx responses become
    /// [`TransportError::Status`] before classification.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        request: HttpRequest,
    ) -> ClientResult<HttpResponse> {
        let request = self.with_default_headers(request);
        let attempt = AtomicU32::new(0);
        self.execute(self.classifier.as_ref(), cancel, || {
            let n = attempt.fetch_add(1, Ordering::Relaxed) + 1;
            self.send_once(request.clone(), n)
        })
        .await
    }

    /// Sends a GET request.
    pub async fn get(&self, cancel: &CancellationToken, path: &str) -> ClientResult<HttpResponse> {
        self.send(cancel, HttpRequest::get(path)).await
    }

    /// Sends a POST request with a JSON body.
    pub async fn post_json<B>(
        &self,
        cancel: &CancellationToken,
        path: &str,
        body: &B,
    ) -> ClientResult<HttpResponse>
    where
        B: Serialize,
    {
        let request = HttpRequest::post(path)
            .json(body)
            .map_err(ResilienceError::Operation)?;
        self.send(cancel, request).await
    }

    /// Like [`send`](Self::send), but admission refusals (open circuit,
    /// saturated half-open trials, outbound rate limit) are handed to
    /// `fallback`. Failures of admitted calls are returned as they are.
    pub async fn send_with_fallback<FB, FbFut>(
        &self,
        cancel: &CancellationToken,
        request: HttpRequest,
        fallback: FB,
    ) -> ClientResult<HttpResponse>
    where
        FB: FnOnce(ResilienceError<TransportError>) -> FbFut,
        FbFut: Future<Output = Result<HttpResponse, TransportError>>,
    {
        match self.send(cancel, request).await {
            Err(err) if err.is_admission_failure() => {
                debug!(client = %self.name, reason = err.error_code(), "Using fallback");
                fallback(err).await.map_err(ResilienceError::Operation)
            }
            other => other,
        }
    }

    async fn execute<F, Fut, T, E, C>(
        &self,
        classifier: &C,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Classifier<E> + ?Sized,
    {
        let counters = &self.counters;
        counters.calls.fetch_add(1, Ordering::Relaxed);

        if let Some(bucket) = &self.rate_limit {
            if !bucket.allow() {
                counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                debug!(client = %self.name, "Outbound rate limit exceeded");
                return Err(ResilienceError::RateLimited {
                    key: self.name.clone(),
                    retry_after: Some(bucket.time_until_available()),
                });
            }
        }

        let permit = match self.breaker.acquire() {
            Ok(permit) => permit,
            Err(rejection) => {
                counters.circuit_rejections.fetch_add(1, Ordering::Relaxed);
                return Err(rejection.into());
            }
        };

        let outcome = self.retry.run_with_outcome(classifier, cancel, operation).await;
        counters
            .retries
            .fetch_add(u64::from(outcome.retries()), Ordering::Relaxed);

        match &outcome.result {
            Ok(_) => {
                counters.successes.fetch_add(1, Ordering::Relaxed);
                permit.record_success();
            }
            Err(ResilienceError::Cancelled) => {
                // The caller gave up; the dependency did not fail.
                counters.cancelled.fetch_add(1, Ordering::Relaxed);
                drop(permit);
            }
            Err(_) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                permit.record_failure();
            }
        }
        outcome.result
    }

    async fn with_timeout<T, Fut>(&self, attempt: Fut) -> Result<T, TransportError>
    where
        Fut: Future<Output = Result<T, TransportError>>,
    {
        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                message: format!("attempt exceeded {:?}", self.timeout),
            }),
        }
    }

    async fn send_once(
        &self,
        request: HttpRequest,
        attempt: u32,
    ) -> Result<HttpResponse, TransportError> {
        let context = AttemptContext {
            client: self.name.clone(),
            method: request.method.to_string(),
            url: self.transport.url_for(&request),
            attempt,
        };
        let attempt = self.with_timeout(self.transport.send(request));

        self.traced(context, attempt, |result| match result {
            Ok(response) => AttemptOutcome::Response {
                status: response.status,
            },
            Err(error) => AttemptOutcome::Failed {
                error: error.to_string(),
            },
        })
        .await
        .and_then(HttpResponse::error_for_status)
    }

    /// Runs one attempt inside the tracer's span and reports how it ended.
    async fn traced<T, E, Fut>(
        &self,
        context: AttemptContext,
        attempt: Fut,
        describe: impl FnOnce(&Result<T, E>) -> AttemptOutcome,
    ) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let span = self.tracer.start(&context);
        let started = Instant::now();
        let result = attempt.instrument(span.clone()).await;
        self.tracer
            .end(&span, &context, &describe(&result), started.elapsed());
        result
    }

    fn operation_context(&self, attempt: u32) -> AttemptContext {
        AttemptContext {
            client: self.name.clone(),
            method: OPERATION_METHOD.to_string(),
            url: String::new(),
            attempt,
        }
    }

    fn with_default_headers(&self, mut request: HttpRequest) -> HttpRequest {
        for (name, value) in &self.default_headers {
            if !request.headers.keys().any(|k| k.eq_ignore_ascii_case(name)) {
                request.headers.insert(name.clone(), value.clone());
            }
        }
        request
    }
}

fn operation_outcome<T, E: fmt::Display>(result: &Result<T, E>) -> AttemptOutcome {
    match result {
        Ok(_) => AttemptOutcome::Completed,
        Err(error) => AttemptOutcome::Failed {
            error: error.to_string(),
        },
    }
}

impl fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientClient")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("breaker", &self.breaker)
            .field("retry", self.retry.policy())
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

/// Builder for [`ResilientClient`].
pub struct ResilientClientBuilder {
    name: String,
    base_url: Option<String>,
    timeout: Duration,
    transport: Option<Arc<dyn Transport>>,
    breaker: Option<Arc<CircuitBreaker>>,
    breaker_config: CircuitBreakerConfig,
    retry_policy: RetryPolicy,
    classifier: Option<Arc<dyn Classifier<TransportError>>>,
    tracer: Option<Arc<dyn AttemptTracer>>,
    rate_limit: Option<TokenBucket>,
    default_headers: HashMap<String, String>,
}

impl ResilientClientBuilder {
    /// Creates a builder with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: None,
            timeout: DEFAULT_TIMEOUT,
            transport: None,
            breaker: None,
            breaker_config: CircuitBreakerConfig::default(),
            retry_policy: RetryPolicy::default(),
            classifier: None,
            tracer: None,
            rate_limit: None,
            default_headers: HashMap::new(),
        }
    }

    /// Sets the base URL used by the default reqwest transport.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sets the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Uses a custom transport instead of reqwest.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Uses an existing (possibly shared) breaker.
    pub fn circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Configuration of the breaker created when none is supplied.
    pub fn circuit_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Sets the retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the failure classifier. Defaults to [`DefaultClassifier`].
    pub fn classifier(mut self, classifier: Arc<dyn Classifier<TransportError>>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Sets the attempt tracer. Defaults to [`NoopTracer`].
    pub fn tracer(mut self, tracer: Arc<dyn AttemptTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Limits outbound calls with a token bucket checked before the breaker.
    pub fn rate_limit(mut self, bucket: TokenBucket) -> Self {
        self.rate_limit = Some(bucket);
        self
    }

    /// Adds a header sent with every request unless already present.
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// Builds the client.
    pub fn build(self) -> Result<ResilientClient, ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("timeout", "must be non-zero"));
        }
        self.retry_policy.validate()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => {
                let base_url = self.base_url.as_deref().ok_or_else(|| {
                    ConfigError::invalid("base_url", "required when no transport is supplied")
                })?;
                Arc::new(ReqwestTransport::new(base_url, self.timeout)?)
            }
        };

        let breaker = match self.breaker {
            Some(breaker) => breaker,
            None => {
                self.breaker_config.validate()?;
                Arc::new(CircuitBreaker::with_config(self.name.clone(), self.breaker_config))
            }
        };

        Ok(ResilientClient {
            name: self.name,
            transport,
            breaker,
            retry: RetryExecutor::new(self.retry_policy),
            classifier: self
                .classifier
                .unwrap_or_else(|| Arc::new(DefaultClassifier::new())),
            tracer: self.tracer.unwrap_or_else(|| Arc::new(NoopTracer)),
            rate_limit: self.rate_limit,
            timeout: self.timeout,
            default_headers: self.default_headers,
            counters: ClientCounters::default(),
        })
    }
}
