//! RPC endpoint health tracking: cooldowns, rate limits, soft-disable and revive.

use crate::utils::{Clock, SystemClock, elapsed_between};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

const BASE_COOLDOWN_SECS: u64 = 10;
const MAX_COOLDOWN_SECS: u64 = 600;
const RATE_LIMIT_COOLDOWN_SECS: u64 = 600;
const DISABLE_AFTER_FAILURES: u32 = 2;
/// Fraction of the per-call budget (60s / rate) that must pass between calls.
const MIN_INTERVAL_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Primary,
    Secondary,
}

impl Tier {
    /// Failover order.
    pub const ALL: [Tier; 2] = [Tier::Primary, Tier::Secondary];

    fn index(self) -> usize {
        match self {
            Tier::Primary => 0,
            Tier::Secondary => 1,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Primary => f.write_str("primary"),
            Tier::Secondary => f.write_str("secondary"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Provider told us to slow down. Long cooldown regardless of the failure count.
    RateLimited,
    Transient,
}

/// Decides how a failed call should be penalised.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, message: &str) -> ErrorClass;
}

/// Case-insensitive substring match against known rate-limit phrases.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    rate_limit_patterns: Vec<String>,
}

impl PatternClassifier {
    pub fn new(patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            rate_limit_patterns: patterns
                .into_iter()
                .map(|p| p.into().to_lowercase())
                .collect(),
        }
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::new(["rate limit", "too many requests", "429"])
    }
}

impl ErrorClassifier for PatternClassifier {
    fn classify(&self, message: &str) -> ErrorClass {
        let lower = message.to_lowercase();
        if self.rate_limit_patterns.iter().any(|p| lower.contains(p)) {
            ErrorClass::RateLimited
        } else {
            ErrorClass::Transient
        }
    }
}

#[derive(Debug, Clone, Default)]
struct EndpointState {
    consecutive_failures: u32,
    cooldown_until: Option<SystemTime>,
    disabled: bool,
    /// A disabled endpoint past its cooldown gets exactly one in-flight probe.
    probing: bool,
    last_call_at: Option<SystemTime>,
    calls: u64,
    failures: u64,
    last_error: Option<String>,
}

/// One RPC endpoint and the connection used to talk to it.
pub struct Endpoint<C> {
    pub name: String,
    pub url: String,
    pub tier: Tier,
    pub rate_limit_per_minute: u32,
    client: C,
    state: Mutex<EndpointState>,
}

/// Point-in-time view of an endpoint for logs and summaries.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub name: String,
    pub tier: Tier,
    pub alive: bool,
    pub calls: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub cooldown_remaining_secs: f64,
    pub last_error: Option<String>,
}

impl<C> Endpoint<C> {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        tier: Tier,
        rate_limit_per_minute: u32,
        client: C,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            tier,
            rate_limit_per_minute: rate_limit_per_minute.max(1),
            client,
            state: Mutex::new(EndpointState::default()),
        }
    }

    fn min_interval(&self) -> Duration {
        Duration::from_secs_f64(MIN_INTERVAL_FACTOR * 60.0 / self.rate_limit_per_minute as f64)
    }

    fn eligible(&self, state: &EndpointState, now: SystemTime) -> bool {
        if matches!(state.cooldown_until, Some(until) if now < until) {
            return false;
        }
        if state.disabled && state.probing {
            return false;
        }
        match state.last_call_at {
            Some(last) => elapsed_between(last, now) >= self.min_interval(),
            None => true,
        }
    }

    /// Whether a call may be issued right now. Read-only.
    pub fn can_call(&self, now: SystemTime) -> bool {
        let state = self.state.lock();
        self.eligible(&state, now)
    }

    /// Checks eligibility and claims the call slot in one step.
    pub fn try_acquire(&self, now: SystemTime) -> bool {
        let mut state = self.state.lock();
        if !self.eligible(&state, now) {
            return false;
        }
        state.last_call_at = Some(now);
        state.calls += 1;
        if state.disabled {
            state.probing = true;
        }
        true
    }

    pub fn record_success(&self, now: SystemTime) {
        let mut state = self.state.lock();
        if state.disabled {
            tracing::info!(endpoint = %self.name, "[RPC] endpoint revived");
        }
        state.consecutive_failures = 0;
        state.disabled = false;
        state.probing = false;
        state.cooldown_until = Some(now);
    }

    pub fn record_failure(&self, now: SystemTime, message: &str, class: ErrorClass) {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        state.failures += 1;
        state.probing = false;
        state.last_error = Some(message.to_string());

        let cooldown_secs = match class {
            ErrorClass::RateLimited => RATE_LIMIT_COOLDOWN_SECS,
            ErrorClass::Transient => backoff_secs(state.consecutive_failures),
        };
        state.cooldown_until = Some(now + Duration::from_secs(cooldown_secs));

        if state.consecutive_failures >= DISABLE_AFTER_FAILURES && !state.disabled {
            state.disabled = true;
            tracing::warn!(
                endpoint = %self.name,
                failures = state.consecutive_failures,
                cooldown_secs,
                "[RPC] endpoint disabled"
            );
        } else {
            tracing::debug!(
                endpoint = %self.name,
                failures = state.consecutive_failures,
                cooldown_secs,
                ?class,
                "[RPC] endpoint cooling down"
            );
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.state.lock().disabled
    }

    /// Time until the rate limiter frees this endpoint, if it is only throttled
    /// (not cooling down, not waiting on a probe).
    pub fn throttled_for(&self, now: SystemTime) -> Option<Duration> {
        let state = self.state.lock();
        if matches!(state.cooldown_until, Some(until) if now < until) {
            return None;
        }
        if state.disabled && state.probing {
            return None;
        }
        let last = state.last_call_at?;
        let waited = elapsed_between(last, now);
        let min = self.min_interval();
        (waited < min).then(|| min - waited)
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn stats(&self, now: SystemTime) -> EndpointStats {
        let state = self.state.lock();
        let cooldown_remaining_secs = state
            .cooldown_until
            .map(|until| elapsed_between(now, until).as_secs_f64())
            .unwrap_or(0.0);
        EndpointStats {
            name: self.name.clone(),
            tier: self.tier,
            alive: !state.disabled,
            calls: state.calls,
            failures: state.failures,
            consecutive_failures: state.consecutive_failures,
            cooldown_remaining_secs,
            last_error: state.last_error.clone(),
        }
    }
}

/// `min(600, 10 * 2^(n-1))` seconds.
fn backoff_secs(consecutive_failures: u32) -> u64 {
    let exp = consecutive_failures.saturating_sub(1).min(16);
    BASE_COOLDOWN_SECS
        .saturating_mul(1u64 << exp)
        .min(MAX_COOLDOWN_SECS)
}

/// All known endpoints, grouped by tier, with round-robin selection.
pub struct EndpointPool<C> {
    endpoints: Vec<Endpoint<C>>,
    cursors: [AtomicUsize; 2],
    clock: Arc<dyn Clock>,
    classifier: Arc<dyn ErrorClassifier>,
}

impl<C: Clone> EndpointPool<C> {
    pub fn new(
        endpoints: Vec<Endpoint<C>>,
        clock: Arc<dyn Clock>,
        classifier: Arc<dyn ErrorClassifier>,
    ) -> Self {
        Self {
            endpoints,
            cursors: [AtomicUsize::new(0), AtomicUsize::new(0)],
            clock,
            classifier,
        }
    }

    pub fn with_defaults(endpoints: Vec<Endpoint<C>>) -> Self {
        Self::new(
            endpoints,
            Arc::new(SystemClock),
            Arc::new(PatternClassifier::default()),
        )
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn alive_count(&self) -> usize {
        self.endpoints.iter().filter(|e| e.is_alive()).count()
    }

    pub fn endpoints(&self) -> &[Endpoint<C>] {
        &self.endpoints
    }

    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    /// Next eligible endpoint of `tier`, rotating the starting point on every
    /// call. The returned index is for `record_success` / `record_failure`.
    pub fn acquire(&self, tier: Tier) -> Option<(usize, C)> {
        let members: Vec<usize> = self
            .endpoints
            .iter()
            .enumerate()
            .filter(|(_, e)| e.tier == tier)
            .map(|(i, _)| i)
            .collect();
        if members.is_empty() {
            return None;
        }
        let start = self.cursors[tier.index()].fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        (0..members.len())
            .map(|offset| members[(start + offset) % members.len()])
            .find(|&i| self.endpoints[i].try_acquire(now))
            .map(|i| (i, self.endpoints[i].client.clone()))
    }

    pub fn record_success(&self, index: usize) {
        if let Some(endpoint) = self.endpoints.get(index) {
            endpoint.record_success(self.clock.now());
        }
    }

    pub fn record_failure(&self, index: usize, message: &str) {
        if let Some(endpoint) = self.endpoints.get(index) {
            let class = self.classifier.classify(message);
            endpoint.record_failure(self.clock.now(), message, class);
        }
    }

    /// Shortest wait until some merely-throttled endpoint frees up.
    pub fn earliest_slot(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.endpoints
            .iter()
            .filter_map(|e| e.throttled_for(now))
            .min()
    }

    pub fn stats(&self) -> Vec<EndpointStats> {
        let now = self.clock.now();
        self.endpoints.iter().map(|e| e.stats(now)).collect()
    }

    /// Lifetime share of calls that did not fail, 1.0 before any call.
    pub fn success_rate(&self) -> f64 {
        let (calls, failures) = self
            .stats()
            .iter()
            .fold((0u64, 0u64), |(c, f), s| (c + s.calls, f + s.failures));
        if calls == 0 {
            1.0
        } else {
            calls.saturating_sub(failures) as f64 / calls as f64
        }
    }
}
