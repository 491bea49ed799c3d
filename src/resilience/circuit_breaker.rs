//! Circuit breaker pattern for fault tolerance.
//!
//! # States
//! - Closed: calls pass through; consecutive failures are counted
//! - Open: calls are rejected until `open_timeout` has elapsed
//! - Half-Open: a bounded number of trial calls decide whether to close or reopen
//!
//! # Transitions
//! ```text
//! Closed   --failure_threshold consecutive failures-->  Open
//! Open     --admission after open_timeout----------->   HalfOpen (admits the first trial)
//! HalfOpen --success_threshold consecutive successes->  Closed
//! HalfOpen --any failure----------------------------->  Open
//! ```
//!
//! Every transition starts a new episode. A [`CircuitPermit`] only reports its
//! outcome into the episode it was admitted in, so a slow call admitted before
//! the breaker moved on can never drive a later episode.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::{CircuitRejected, ConfigError, ResilienceError};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through.
    Closed,
    /// Circuit is open, requests are rejected.
    Open,
    /// Circuit is half-open, trial requests are admitted.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// How long the circuit stays open before admitting a trial.
    pub open_timeout: Duration,
    /// Maximum concurrent calls admitted while half-open.
    pub max_half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            max_half_open_requests: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set failure threshold
    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n;
        self
    }

    /// Set success threshold
    pub fn success_threshold(mut self, n: u32) -> Self {
        self.success_threshold = n;
        self
    }

    /// Set open timeout
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Set half-open max requests
    pub fn max_half_open_requests(mut self, n: u32) -> Self {
        self.max_half_open_requests = n;
        self
    }

    /// Checks that every threshold is at least one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "failure_threshold",
                "must be at least 1",
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid(
                "success_threshold",
                "must be at least 1",
            ));
        }
        if self.max_half_open_requests == 0 {
            return Err(ConfigError::invalid(
                "max_half_open_requests",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// A state change, delivered to listeners after the breaker lock is released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    /// Breaker name.
    pub name: String,
    /// Previous state.
    pub from: CircuitState,
    /// New state.
    pub to: CircuitState,
    /// Wall-clock time of the transition.
    pub at: DateTime<Utc>,
}

/// Observer of circuit state changes.
///
/// Listeners run synchronously on the thread that caused the transition,
/// outside the breaker's lock. They must not block.
pub trait CircuitStateListener: Send + Sync {
    /// Called exactly once per transition.
    fn on_state_change(&self, transition: &StateTransition);
}

impl<F> CircuitStateListener for F
where
    F: Fn(&StateTransition) + Send + Sync,
{
    fn on_state_change(&self, transition: &StateTransition) {
        self(transition)
    }
}

/// Point-in-time view of a breaker, for export by an external collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitMetrics {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures in the current episode.
    pub failures: u32,
    /// Consecutive half-open successes in the current episode.
    pub successes: u32,
    /// Time of the most recent recorded failure.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Trial calls currently in flight.
    pub half_open_in_flight: u32,
    /// Calls admitted over the breaker's lifetime.
    pub total_calls: u64,
    /// Failures recorded over the breaker's lifetime.
    pub total_failures: u64,
    /// Calls rejected over the breaker's lifetime.
    pub total_rejections: u64,
}

struct BreakerState {
    state: CircuitState,
    epoch: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    half_open_in_flight: u32,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            epoch: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure: None,
            last_failure_at: None,
            half_open_in_flight: 0,
        }
    }

    fn stamp_failure(&mut self) {
        self.last_failure = Some(Instant::now());
        self.last_failure_at = Some(Utc::now());
    }
}

/// Circuit breaker guarding a single named dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    listeners: Vec<Arc<dyn CircuitStateListener>>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a breaker with default configuration.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    /// Create a breaker with custom configuration.
    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
            listeners: Vec::new(),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// Adds a state change listener.
    pub fn with_listener(mut self, listener: Arc<dyn CircuitStateListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Adds several state change listeners.
    pub fn with_listeners(
        mut self,
        listeners: impl IntoIterator<Item = Arc<dyn CircuitStateListener>>,
    ) -> Self {
        self.listeners.extend(listeners);
        self
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. Never performs the open to half-open transition.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Snapshot of the breaker's counters.
    pub fn metrics(&self) -> CircuitMetrics {
        let state = self.state.lock();
        CircuitMetrics {
            name: self.name.clone(),
            state: state.state,
            failures: state.consecutive_failures,
            successes: state.consecutive_successes,
            last_failure_at: state.last_failure_at,
            half_open_in_flight: state.half_open_in_flight,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Execute an operation through the circuit breaker.
    ///
    /// The operation's own error is returned unmodified inside
    /// [`ResilienceError::Operation`].
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire()?;
        match operation().await {
            Ok(value) => {
                permit.record_success();
                Ok(value)
            }
            Err(error) => {
                permit.record_failure();
                Err(ResilienceError::Operation(error))
            }
        }
    }

    /// Like [`execute`](Self::execute), but runs `fallback` when admission is
    /// refused. Operation failures are not routed to the fallback.
    pub async fn execute_with_fallback<F, Fut, FB, FbFut, T, E>(
        &self,
        operation: F,
        fallback: FB,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(CircuitRejected) -> FbFut,
        FbFut: Future<Output = Result<T, E>>,
    {
        match self.acquire() {
            Ok(permit) => match operation().await {
                Ok(value) => {
                    permit.record_success();
                    Ok(value)
                }
                Err(error) => {
                    permit.record_failure();
                    Err(ResilienceError::Operation(error))
                }
            },
            Err(rejection) => {
                debug!(breaker = %self.name, "Circuit rejected call, using fallback");
                fallback(rejection).await.map_err(ResilienceError::Operation)
            }
        }
    }

    /// Admission check.
    ///
    /// On success the returned permit must be settled with
    /// [`CircuitPermit::record_success`] or [`CircuitPermit::record_failure`];
    /// dropping it unsettled only releases its half-open slot.
    pub fn acquire(&self) -> Result<CircuitPermit<'_>, CircuitRejected> {
        let mut transition = None;
        let admitted = {
            let mut state = self.state.lock();
            match state.state {
                CircuitState::Closed => Ok((state.epoch, false)),
                CircuitState::Open => {
                    let elapsed = state
                        .last_failure
                        .map(|at| at.elapsed())
                        .unwrap_or(self.config.open_timeout);
                    if elapsed >= self.config.open_timeout {
                        transition = Some(self.transition(&mut state, CircuitState::HalfOpen));
                        state.half_open_in_flight = 1;
                        Ok((state.epoch, true))
                    } else {
                        Err(CircuitRejected::Open {
                            name: self.name.clone(),
                            retry_in: self.config.open_timeout - elapsed,
                        })
                    }
                }
                CircuitState::HalfOpen => {
                    if state.half_open_in_flight < self.config.max_half_open_requests {
                        state.half_open_in_flight += 1;
                        Ok((state.epoch, true))
                    } else {
                        Err(CircuitRejected::HalfOpenSaturated {
                            name: self.name.clone(),
                        })
                    }
                }
            }
        };
        self.notify(transition);

        match admitted {
            Ok((epoch, half_open)) => {
                self.total_calls.fetch_add(1, Ordering::Relaxed);
                Ok(CircuitPermit {
                    breaker: self,
                    epoch,
                    half_open,
                    settled: false,
                })
            }
            Err(rejection) => {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                debug!(breaker = %self.name, reason = %rejection, "Circuit breaker rejected call");
                Err(rejection)
            }
        }
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let transition = {
            let mut state = self.state.lock();
            if state.state == CircuitState::Closed {
                state.consecutive_failures = 0;
                state.consecutive_successes = 0;
                None
            } else {
                Some(self.transition(&mut state, CircuitState::Closed))
            }
        };
        debug!(breaker = %self.name, "Circuit breaker reset to CLOSED");
        self.notify(transition);
    }

    fn settle(&self, epoch: u64, half_open: bool, outcome: Option<bool>) {
        if outcome == Some(false) {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
        }

        let transition = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                // Admitted in an earlier episode: the outcome is stale.
                None
            } else {
                if half_open {
                    state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                }
                match outcome {
                    Some(true) => self.on_success(&mut state),
                    Some(false) => self.on_failure(&mut state),
                    None => None,
                }
            }
        };
        self.notify(transition);
    }

    fn on_success(&self, state: &mut BreakerState) -> Option<StateTransition> {
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold {
                    info!(breaker = %self.name, "Circuit breaker transitioning to CLOSED");
                    Some(self.transition(state, CircuitState::Closed))
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    fn on_failure(&self, state: &mut BreakerState) -> Option<StateTransition> {
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                state.stamp_failure();
                if state.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failure_count = state.consecutive_failures,
                        "Circuit breaker transitioning to OPEN"
                    );
                    Some(self.transition(state, CircuitState::Open))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                state.stamp_failure();
                warn!(breaker = %self.name, "Circuit breaker returning to OPEN from half-open");
                Some(self.transition(state, CircuitState::Open))
            }
            CircuitState::Open => None,
        }
    }

    /// Moves to `to`, starting a new episode. Caller holds the lock.
    fn transition(&self, state: &mut BreakerState, to: CircuitState) -> StateTransition {
        let from = state.state;
        state.state = to;
        state.epoch += 1;
        state.consecutive_failures = 0;
        state.consecutive_successes = 0;
        state.half_open_in_flight = 0;
        if to == CircuitState::HalfOpen {
            debug!(breaker = %self.name, "Circuit breaker transitioning to HALF_OPEN");
        }
        StateTransition {
            name: self.name.clone(),
            from,
            to,
            at: Utc::now(),
        }
    }

    fn notify(&self, transition: Option<StateTransition>) {
        if let Some(transition) = transition {
            for listener in &self.listeners {
                listener.on_state_change(&transition);
            }
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Admission granted by [`CircuitBreaker::acquire`].
#[must_use = "a permit must be settled with record_success or record_failure"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
    half_open: bool,
    settled: bool,
}

impl CircuitPermit<'_> {
    /// Whether this call was admitted as a half-open trial.
    pub fn is_trial(&self) -> bool {
        self.half_open
    }

    /// Records a successful outcome.
    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.settle(self.epoch, self.half_open, Some(true));
    }

    /// Records a failed outcome.
    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.settle(self.epoch, self.half_open, Some(false));
    }

    /// Records `success` as the outcome.
    pub fn record(self, success: bool) {
        if success {
            self.record_success();
        } else {
            self.record_failure();
        }
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(self.epoch, self.half_open, None);
        }
    }
}

impl fmt::Debug for CircuitPermit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitPermit")
            .field("breaker", &self.breaker.name)
            .field("epoch", &self.epoch)
            .field("half_open", &self.half_open)
            .finish()
    }
}
