//! Rate limiting using the token bucket algorithm.
//!
//! [`TokenBucket`] is the per-key counter. [`RateLimiter`] maps requests to
//! keys and keeps one bucket per key; [`PerEndpointRateLimiter`] keeps one
//! whole limiter per route so that routes can carry different limits.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::{ConfigError, RateLimitExceeded};

/// Buckets at or above this share of capacity are considered idle.
const IDLE_FILL_RATIO: f64 = 0.99;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Continuously refilling token bucket.
///
/// Refill is computed lazily on every check as `elapsed * refill_rate`; no
/// timer runs in the background. The fill level always stays within
/// `[0, capacity]`.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            refill_rate: refill_rate.max(0.0),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Creates a full bucket from a limiter configuration.
    pub fn from_config(config: &RateLimiterConfig) -> Self {
        Self::new(config.capacity, config.refill_rate)
    }

    /// Maximum burst size.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn refilled(&self, state: &BucketState, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        (state.tokens + elapsed * self.refill_rate).min(self.capacity)
    }

    /// Takes one token if available. No partial admission.
    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.tokens = self.refilled(&state, now);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Current fill level. Does not consume.
    pub fn tokens(&self) -> f64 {
        let state = self.state.lock();
        self.refilled(&state, Instant::now())
    }

    /// Time until one token is available.
    pub fn time_until_available(&self) -> Duration {
        let tokens = self.tokens();
        if tokens >= 1.0 {
            return Duration::ZERO;
        }
        if self.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64((1.0 - tokens) / self.refill_rate)
    }

    fn is_idle(&self) -> bool {
        self.tokens() >= self.capacity * IDLE_FILL_RATIO
    }
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .field("tokens", &self.tokens())
            .finish()
    }
}

/// Configuration for a keyed rate limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Maximum burst per key.
    pub capacity: u32,
    /// Tokens refilled per second per key.
    pub refill_rate: f64,
    /// Period of the idle-bucket sweep.
    pub cleanup_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            refill_rate: 10.0,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl RateLimiterConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set bucket capacity
    pub fn capacity(mut self, n: u32) -> Self {
        self.capacity = n;
        self
    }

    /// Set refill rate (tokens per second)
    pub fn refill_rate(mut self, rate: f64) -> Self {
        self.refill_rate = rate;
        self
    }

    /// Set the cleanup sweep period
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Checks that capacity, refill rate and sweep period are positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid("capacity", "must be at least 1"));
        }
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return Err(ConfigError::invalid(
                "refill_rate",
                format!("must be a positive number, got {}", self.refill_rate),
            ));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::invalid("cleanup_interval", "must be non-zero"));
        }
        Ok(())
    }
}

/// Snapshot of a keyed limiter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterMetrics {
    /// Limiter name.
    pub name: String,
    /// Bucket capacity.
    pub capacity: u32,
    /// Refill rate per second.
    pub refill_rate: f64,
    /// Keys with a live bucket.
    pub active_keys: usize,
    /// Admissions granted.
    pub allowed: u64,
    /// Admissions refused.
    pub rejected: u64,
    /// Requests that bypassed the limiter.
    pub excluded: u64,
}

type KeyFn<R> = Arc<dyn Fn(&R) -> String + Send + Sync>;
type ExcludeFn<R> = Arc<dyn Fn(&R) -> bool + Send + Sync>;
type LimitHook<R> = Arc<dyn Fn(&R, &str) + Send + Sync>;

/// Keyed rate limiter holding one [`TokenBucket`] per key.
///
/// Buckets live in a sharded concurrent map, so checks for unrelated keys
/// never contend on a shared lock.
pub struct RateLimiter<R> {
    name: String,
    config: RateLimiterConfig,
    buckets: DashMap<String, Arc<TokenBucket>>,
    key_fn: KeyFn<R>,
    exclude_fn: Option<ExcludeFn<R>>,
    on_limit_exceeded: Option<LimitHook<R>>,
    allowed: AtomicU64,
    rejected: AtomicU64,
    excluded: AtomicU64,
}

impl<R> RateLimiter<R> {
    /// Creates a limiter that derives bucket keys with `key_fn`.
    pub fn new<K>(name: impl Into<String>, config: RateLimiterConfig, key_fn: K) -> Self
    where
        K: Fn(&R) -> String + Send + Sync + 'static,
    {
        Self::from_parts(name.into(), config, Arc::new(key_fn))
    }

    fn from_parts(name: String, config: RateLimiterConfig, key_fn: KeyFn<R>) -> Self {
        Self {
            name,
            config,
            buckets: DashMap::new(),
            key_fn,
            exclude_fn: None,
            on_limit_exceeded: None,
            allowed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            excluded: AtomicU64::new(0),
        }
    }

    /// Requests matching `exclude_fn` bypass the limiter.
    pub fn with_exclude<F>(mut self, exclude_fn: F) -> Self
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.exclude_fn = Some(Arc::new(exclude_fn));
        self
    }

    /// Hook invoked once per refused request with the request and its key.
    pub fn on_limit_exceeded<F>(mut self, hook: F) -> Self
    where
        F: Fn(&R, &str) + Send + Sync + 'static,
    {
        self.on_limit_exceeded = Some(Arc::new(hook));
        self
    }

    /// Limiter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Limiter configuration.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Admission check for a request.
    pub fn allow(&self, request: &R) -> bool {
        self.check(request).is_ok()
    }

    /// Admission check for a request, reporting the wait on refusal.
    pub fn check(&self, request: &R) -> Result<(), RateLimitExceeded> {
        if let Some(exclude) = &self.exclude_fn {
            if exclude(request) {
                self.excluded.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        let key = (self.key_fn)(request);
        let result = self.check_key(&key);
        if result.is_err() {
            if let Some(hook) = &self.on_limit_exceeded {
                hook(request, &key);
            }
        }
        result
    }

    /// Admission check for an already extracted key. Bypasses exclusion and
    /// the limit-exceeded hook.
    pub fn allow_key(&self, key: &str) -> bool {
        self.check_key(key).is_ok()
    }

    fn check_key(&self, key: &str) -> Result<(), RateLimitExceeded> {
        let bucket = self.bucket(key);
        if bucket.allow() {
            self.allowed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        self.rejected.fetch_add(1, Ordering::Relaxed);
        let retry_after = bucket.time_until_available();
        debug!(
            limiter = %self.name,
            key = %key,
            retry_after_ms = retry_after.as_millis() as u64,
            "Rate limit exceeded"
        );
        Err(RateLimitExceeded {
            key: key.to_string(),
            retry_after,
        })
    }

    fn bucket(&self, key: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return bucket.value().clone();
        }
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::from_config(&self.config)))
            .value()
            .clone()
    }

    /// Remaining tokens for `key`, or full capacity if it has no bucket.
    pub fn tokens(&self, key: &str) -> f64 {
        self.buckets
            .get(key)
            .map(|bucket| bucket.tokens())
            .unwrap_or_else(|| f64::from(self.config.capacity))
    }

    /// Number of keys with a live bucket.
    pub fn active_keys(&self) -> usize {
        self.buckets.len()
    }

    /// Evicts idle buckets (at or near full capacity) and returns how many
    /// were removed. An evicted key gets a fresh full bucket on its next check.
    pub fn cleanup(&self) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_idle());
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(limiter = %self.name, removed, "Evicted idle rate limit buckets");
        }
        removed
    }

    /// Snapshot of counters.
    pub fn metrics(&self) -> RateLimiterMetrics {
        RateLimiterMetrics {
            name: self.name.clone(),
            capacity: self.config.capacity,
            refill_rate: self.config.refill_rate,
            active_keys: self.buckets.len(),
            allowed: self.allowed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            excluded: self.excluded.load(Ordering::Relaxed),
        }
    }
}

impl<R: 'static> RateLimiter<R> {
    /// Runs [`cleanup`](Self::cleanup) every `cleanup_interval` until `cancel`
    /// fires or the limiter is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.config.cleanup_interval;
        spawn_sweeper(Arc::downgrade(self), period, cancel, |limiter| {
            limiter.cleanup();
        })
    }
}

impl<R> fmt::Debug for RateLimiter<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("active_keys", &self.buckets.len())
            .finish()
    }
}

fn spawn_sweeper<T, F>(
    target: Weak<T>,
    period: Duration,
    cancel: CancellationToken,
    sweep: F,
) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    F: Fn(&T) + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            match target.upgrade() {
                Some(target) => sweep(&target),
                None => break,
            }
        }
        info!("Rate limiter cleanup task stopped");
    })
}

/// Rate limiter keeping a separate [`RateLimiter`] per route.
///
/// Each route gets its own capacity and refill rate (falling back to the
/// default configuration) while sharing key extraction, exclusion and the
/// limit-exceeded hook.
pub struct PerEndpointRateLimiter<R> {
    name: String,
    default_config: RateLimiterConfig,
    route_configs: HashMap<String, RateLimiterConfig>,
    limiters: DashMap<String, Arc<RateLimiter<R>>>,
    path_fn: KeyFn<R>,
    key_fn: KeyFn<R>,
    exclude_fn: Option<ExcludeFn<R>>,
    on_limit_exceeded: Option<LimitHook<R>>,
}

impl<R> PerEndpointRateLimiter<R> {
    /// Creates a limiter selecting the route with `path_fn` and the bucket
    /// within that route with `key_fn`.
    pub fn new<P, K>(
        name: impl Into<String>,
        default_config: RateLimiterConfig,
        path_fn: P,
        key_fn: K,
    ) -> Self
    where
        P: Fn(&R) -> String + Send + Sync + 'static,
        K: Fn(&R) -> String + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            default_config,
            route_configs: HashMap::new(),
            limiters: DashMap::new(),
            path_fn: Arc::new(path_fn),
            key_fn: Arc::new(key_fn),
            exclude_fn: None,
            on_limit_exceeded: None,
        }
    }

    /// Overrides the limits for one route.
    pub fn with_route(mut self, path: impl Into<String>, config: RateLimiterConfig) -> Self {
        self.route_configs.insert(path.into(), config);
        self
    }

    /// Requests matching `exclude_fn` bypass every route's limiter.
    pub fn with_exclude<F>(mut self, exclude_fn: F) -> Self
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.exclude_fn = Some(Arc::new(exclude_fn));
        self
    }

    /// Hook invoked once per refused request.
    pub fn on_limit_exceeded<F>(mut self, hook: F) -> Self
    where
        F: Fn(&R, &str) + Send + Sync + 'static,
    {
        self.on_limit_exceeded = Some(Arc::new(hook));
        self
    }

    /// Limiter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration applied to `path`.
    pub fn config_for(&self, path: &str) -> &RateLimiterConfig {
        self.route_configs.get(path).unwrap_or(&self.default_config)
    }

    /// The limiter for `path`, created on first use.
    pub fn limiter(&self, path: &str) -> Arc<RateLimiter<R>> {
        if let Some(limiter) = self.limiters.get(path) {
            return limiter.value().clone();
        }
        self.limiters
            .entry(path.to_string())
            .or_insert_with(|| {
                let mut limiter = RateLimiter::from_parts(
                    format!("{}:{}", self.name, path),
                    self.config_for(path).clone(),
                    self.key_fn.clone(),
                );
                limiter.on_limit_exceeded = self.on_limit_exceeded.clone();
                Arc::new(limiter)
            })
            .value()
            .clone()
    }

    /// Admission check for a request.
    pub fn allow(&self, request: &R) -> bool {
        self.check(request).is_ok()
    }

    /// Admission check for a request, reporting the wait on refusal.
    pub fn check(&self, request: &R) -> Result<(), RateLimitExceeded> {
        if let Some(exclude) = &self.exclude_fn {
            if exclude(request) {
                return Ok(());
            }
        }
        let path = (self.path_fn)(request);
        self.limiter(&path).check(request)
    }

    /// Sweeps idle buckets on every route, then drops routes left without
    /// buckets. Returns the number of buckets removed. A dropped route is
    /// recreated from [`config_for`](Self::config_for) on its next request.
    pub fn cleanup(&self) -> usize {
        let removed = self
            .limiters
            .iter()
            .map(|entry| entry.value().cleanup())
            .sum();
        let routes_before = self.limiters.len();
        self.limiters.retain(|_, limiter| limiter.active_keys() > 0);
        let routes_removed = routes_before.saturating_sub(self.limiters.len());
        if routes_removed > 0 {
            debug!(limiter = %self.name, routes_removed, "Dropped idle routes");
        }
        removed
    }

    /// Number of routes with a live limiter.
    pub fn active_routes(&self) -> usize {
        self.limiters.len()
    }

    /// Per-route snapshots.
    pub fn metrics(&self) -> Vec<RateLimiterMetrics> {
        let mut metrics: Vec<_> = self
            .limiters
            .iter()
            .map(|entry| entry.value().metrics())
            .collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }
}

impl<R: 'static> PerEndpointRateLimiter<R> {
    /// Sweeps every route each `cleanup_interval` of the default
    /// configuration until `cancel` fires or the limiter is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.default_config.cleanup_interval;
        spawn_sweeper(Arc::downgrade(self), period, cancel, |limiter| {
            limiter.cleanup();
        })
    }
}

impl<R> fmt::Debug for PerEndpointRateLimiter<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerEndpointRateLimiter")
            .field("name", &self.name)
            .field("default_config", &self.default_config)
            .field("routes", &self.limiters.len())
            .finish()
    }
}

/// Key extraction helpers for inbound `http::Request`s.
pub mod keys {
    use http::Request;
    use std::net::SocketAddr;

    const HEALTH_PATHS: &[&str] = &["/health", "/healthz", "/ready", "/readyz", "/live", "/livez"];

    /// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then a
    /// `SocketAddr` request extension, else `"unknown"`.
    pub fn client_ip<B>(request: &Request<B>) -> String {
        let headers = request.headers();
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return forwarded.to_string();
        }
        if let Some(real_ip) = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return real_ip.to_string();
        }
        request
            .extensions()
            .get::<SocketAddr>()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Request path.
    pub fn path<B>(request: &Request<B>) -> String {
        request.uri().path().to_string()
    }

    /// Client address combined with the request path.
    pub fn client_ip_and_path<B>(request: &Request<B>) -> String {
        format!("{}:{}", client_ip(request), request.uri().path())
    }

    /// Whether the request targets a liveness or readiness endpoint.
    pub fn is_health_check<B>(request: &Request<B>) -> bool {
        HEALTH_PATHS.contains(&request.uri().path())
    }
}
