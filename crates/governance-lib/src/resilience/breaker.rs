//! Per-dependency circuit breakers
//!
//! States:
//! - Closed: calls pass through, consecutive failures are counted
//! - Open: threshold reached, callers fail fast until the recovery timeout
//! - HalfOpen: one trial call decides whether to close or reopen
//!
//! The Open to HalfOpen transition is evaluated lazily by `is_open()`.

use crate::models::duration_millis;
use crate::observability::{GovernanceEvents, GovernanceMetrics};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Cooldown after the last failure before a trial call is allowed
    #[serde(with = "duration_millis")]
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Serializable view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub trips: u64,
    /// Milliseconds since the last recorded failure
    pub last_failure_age_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_issued_at: Option<Instant>,
    total_failures: u64,
    total_successes: u64,
    trips: u64,
}

/// Failure-isolation state machine for one dependency
///
/// No operation panics or returns an error.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    events: GovernanceEvents,
    metrics: Option<GovernanceMetrics>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::default()),
            events: GovernanceEvents::new(),
            metrics: None,
        }
    }

    pub fn with_events(mut self, events: GovernanceEvents) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: GovernanceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether callers should fail fast
    ///
    /// After the recovery timeout, the first call moves the breaker to
    /// HalfOpen and returns false so exactly one trial goes through. A trial
    /// that reports no outcome within another recovery timeout is replaced.
    pub fn is_open(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => false,
            BreakerState::HalfOpen => match inner.trial_issued_at {
                Some(at) if at.elapsed() < self.config.recovery_timeout => true,
                _ => {
                    inner.trial_issued_at = Some(Instant::now());
                    false
                }
            },
            BreakerState::Open => {
                let cooled_down = inner
                    .last_failure
                    .map(|at| at.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if cooled_down {
                    inner.trial_issued_at = Some(Instant::now());
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    false
                } else {
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.total_successes += 1;
        if inner.state == BreakerState::HalfOpen {
            self.transition(&mut inner, BreakerState::Closed);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.total_failures += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => self.transition(&mut inner, BreakerState::Open),
            // Already open: the new failure restarts the cooldown
            BreakerState::Open => {}
        }
    }

    /// Give back an outstanding trial whose outcome will never be recorded
    ///
    /// The next `is_open()` issues a fresh trial. No-op outside HalfOpen.
    pub fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.trial_issued_at = None;
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            trips: inner.trips,
            last_failure_age_ms: inner
                .last_failure
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            BreakerState::Open => {
                inner.trips += 1;
                inner.trial_issued_at = None;
            }
            BreakerState::Closed => inner.trial_issued_at = None,
            BreakerState::HalfOpen => {}
        }
        if let Some(metrics) = &self.metrics {
            metrics.inc_breaker_transition(&self.name, to.as_str());
        }
        self.events.breaker_transition(
            &self.name,
            from.as_str(),
            to.as_str(),
            inner.consecutive_failures,
        );
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// One shared breaker per dependency name, kept for the process lifetime
#[derive(Clone)]
pub struct BreakerRegistry {
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    default_config: BreakerConfig,
    events: GovernanceEvents,
    metrics: Option<GovernanceMetrics>,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            default_config,
            events: GovernanceEvents::new(),
            metrics: None,
        }
    }

    pub fn with_events(mut self, events: GovernanceEvents) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: GovernanceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Breaker for `name`, created with the default config on first use
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.default_config.clone())
    }

    /// Breaker for `name`; `config` only applies if it does not exist yet
    pub fn get_or_create_with(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let mut breaker =
                    CircuitBreaker::new(name, config).with_events(self.events.clone());
                if let Some(metrics) = &self.metrics {
                    breaker = breaker.with_metrics(metrics.clone());
                }
                Arc::new(breaker)
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Names of breakers currently refusing calls
    pub fn open_breakers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .breakers
            .iter()
            .filter(|entry| entry.value().state() == BreakerState::Open)
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Snapshots of every breaker, sorted by name
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> =
            self.breakers.iter().map(|entry| entry.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "embedding-service",
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
            },
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = breaker(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());

        breaker.record_failure();
        assert!(breaker.is_open());
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.snapshot().trips, 1);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = breaker(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();

        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 2);
    }

    #[test]
    fn test_half_open_then_closed() {
        let breaker = breaker(3, Duration::from_millis(30));
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(breaker.is_open());

        std::thread::sleep(Duration::from_millis(50));
        assert!(!breaker.is_open());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(!breaker.is_open());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = breaker(3, Duration::from_millis(30));
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(50));
        assert!(!breaker.is_open());

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.is_open());
        assert_eq!(breaker.snapshot().trips, 2);
    }

    #[test]
    fn test_half_open_allows_single_trial() {
        let breaker = breaker(1, Duration::from_millis(20));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(40));

        assert!(!breaker.is_open());
        // The trial is outstanding; everyone else still fails fast
        assert!(breaker.is_open());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn test_silent_trial_is_reissued_after_recovery_timeout() {
        let breaker = breaker(1, Duration::from_millis(20));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        assert!(!breaker.is_open());
        assert!(breaker.is_open());

        // The first trial never reported back
        std::thread::sleep(Duration::from_millis(40));
        assert!(!breaker.is_open());
        assert!(breaker.is_open());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_release_trial_ignored_outside_half_open() {
        let breaker = breaker(1, Duration::from_secs(60));
        breaker.record_failure();
        assert!(breaker.is_open());

        // Closed and Open ignore a release
        breaker.release_trial();
        assert!(breaker.is_open());
    }

    #[test]
    fn test_release_trial_in_half_open() {
        let breaker = breaker(1, Duration::from_millis(20));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        assert!(!breaker.is_open());
        assert!(breaker.is_open());

        breaker.release_trial();
        assert!(!breaker.is_open());
        assert!(breaker.is_open());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn test_failure_while_open_restarts_cooldown() {
        let breaker = breaker(1, Duration::from_millis(60));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(40));

        assert!(breaker.is_open());
    }

    #[test]
    fn test_transitions_are_counted() {
        let metrics = GovernanceMetrics::new().unwrap();
        let breaker = breaker(1, Duration::from_secs(60)).with_metrics(metrics.clone());
        breaker.record_failure();

        let families = metrics.registry().gather();
        let transitions = families
            .iter()
            .find(|f| f.get_name() == "circuit_breaker_transitions_total")
            .unwrap();
        assert_eq!(transitions.get_metric()[0].get_counter().get_value(), 1.0);
    }

    #[test]
    fn test_registry_shares_breakers_by_name() {
        let registry = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
        });

        let first = registry.get_or_create("vector-store");
        let second = registry.get_or_create("vector-store");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.get("missing").is_none());

        first.record_failure();
        second.record_failure();
        registry.get_or_create("cache");

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.open_breakers(), vec!["vector-store".to_string()]);

        let snapshots = registry.snapshots();
        assert_eq!(snapshots[0].name, "cache");
        assert_eq!(snapshots[1].state, BreakerState::Open);
    }
}
