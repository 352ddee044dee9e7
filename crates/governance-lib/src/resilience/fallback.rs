//! Ordered fallback strategies
//!
//! A chain tries its strategies in order and returns the first success.
//! Each step may restrict which [`FailureKind`]s it absorbs; a failure of
//! any other kind stops the chain and propagates immediately.

use super::breaker::CircuitBreaker;
use crate::error::{
    AttemptFailure, FailureKind, FallbackError, ServiceUnavailableError, StrategyError,
};
use crate::observability::{GovernanceEvents, GovernanceMetrics};
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// One way of producing an `O` from an `I`
#[async_trait]
pub trait Strategy<I, O>: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, input: I) -> Result<O, StrategyError>;
}

/// Adapts an async closure into a [`Strategy`]
pub struct FnStrategy<I, O, F> {
    name: String,
    f: F,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, F, Fut> FnStrategy<I, O, F>
where
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, StrategyError>> + Send,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<I, O, F, Fut> Strategy<I, O> for FnStrategy<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, StrategyError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, input: I) -> Result<O, StrategyError> {
        (self.f)(input).await
    }
}

/// Always returns a clone of a fixed value
struct StaticValue<O> {
    value: O,
}

#[async_trait]
impl<I, O> Strategy<I, O> for StaticValue<O>
where
    I: Send + 'static,
    O: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "static_default"
    }

    async fn call(&self, _input: I) -> Result<O, StrategyError> {
        Ok(self.value.clone())
    }
}

/// Fails fast while a circuit breaker is open and reports outcomes to it
pub struct BreakerGuarded<I, O> {
    inner: Arc<dyn Strategy<I, O>>,
    breaker: Arc<CircuitBreaker>,
}

impl<I, O> BreakerGuarded<I, O> {
    pub fn new(inner: Arc<dyn Strategy<I, O>>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }
}

#[async_trait]
impl<I, O> Strategy<I, O> for BreakerGuarded<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn call(&self, input: I) -> Result<O, StrategyError> {
        if self.breaker.is_open() {
            return Err(StrategyError::new(
                FailureKind::CircuitOpen,
                format!("circuit '{}' is open", self.breaker.name()),
            ));
        }
        let mut outcome = PendingOutcome::new(&self.breaker);
        match self.inner.call(input).await {
            Ok(output) => {
                outcome.disarm();
                self.breaker.record_success();
                Ok(output)
            }
            // Bad input says nothing about the dependency's health
            Err(e) if e.kind == FailureKind::InvalidInput => Err(e),
            Err(e) => {
                outcome.disarm();
                self.breaker.record_failure();
                Err(e)
            }
        }
    }
}

/// Hands a half-open trial back to the breaker when no outcome gets recorded,
/// either because the failure is not counted or the call was cancelled
struct PendingOutcome<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl<'a> PendingOutcome<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingOutcome<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_trial();
        }
    }
}

struct Step<I, O> {
    strategy: Arc<dyn Strategy<I, O>>,
    /// `None` absorbs every kind
    absorbs: Option<Vec<FailureKind>>,
}

impl<I, O> Step<I, O> {
    fn absorbs(&self, kind: FailureKind) -> bool {
        match &self.absorbs {
            None => true,
            Some(kinds) => kinds.contains(&kind),
        }
    }
}

/// Tries strategies in order until one succeeds
pub struct FallbackChain<I, O> {
    name: String,
    steps: Vec<Step<I, O>>,
    events: GovernanceEvents,
    metrics: Option<GovernanceMetrics>,
}

impl<I, O> FallbackChain<I, O>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            events: GovernanceEvents::new(),
            metrics: None,
        }
    }

    /// Append a strategy whose failures of any kind fall through
    pub fn then(self, strategy: Arc<dyn Strategy<I, O>>) -> Self {
        self.push(strategy, None)
    }

    /// Append a strategy whose failures fall through only for `kinds`
    pub fn then_absorbing(self, strategy: Arc<dyn Strategy<I, O>>, kinds: &[FailureKind]) -> Self {
        self.push(strategy, Some(kinds.to_vec()))
    }

    fn push(mut self, strategy: Arc<dyn Strategy<I, O>>, absorbs: Option<Vec<FailureKind>>) -> Self {
        self.steps.push(Step { strategy, absorbs });
        self
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

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run the chain; the first success wins
    pub async fn execute(&self, input: I) -> Result<O, FallbackError> {
        let mut attempts = Vec::new();

        for (position, step) in self.steps.iter().enumerate() {
            let name = step.strategy.name().to_string();
            match step.strategy.call(input.clone()).await {
                Ok(output) => {
                    if position > 0 {
                        self.events.fallback_used(&name, position);
                    }
                    return Ok(output);
                }
                Err(error) => {
                    if !step.absorbs(error.kind) {
                        debug!(
                            chain = %self.name,
                            strategy = %name,
                            kind = %error.kind,
                            "Strategy failure is not absorbable, propagating"
                        );
                        return Err(FallbackError::Propagated {
                            strategy: name,
                            error,
                        });
                    }
                    debug!(
                        chain = %self.name,
                        strategy = %name,
                        kind = %error.kind,
                        error = %error.message,
                        "Strategy failed, trying next"
                    );
                    attempts.push(AttemptFailure {
                        strategy: name,
                        kind: error.kind,
                        message: error.message,
                    });
                }
            }
        }

        let exhausted = ServiceUnavailableError { attempts };
        if let Some(metrics) = &self.metrics {
            metrics.inc_fallback_exhausted();
        }
        self.events
            .fallback_exhausted(exhausted.attempts.len(), &exhausted.to_string());
        Err(exhausted.into())
    }
}

/// A primary strategy with exactly one fallback
pub struct WithFallback<I, O> {
    chain: FallbackChain<I, O>,
}

impl<I, O> WithFallback<I, O>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
{
    /// Fall back to another strategy on any primary failure
    pub fn new(primary: Arc<dyn Strategy<I, O>>, fallback: Arc<dyn Strategy<I, O>>) -> Self {
        Self::absorbing(primary, None, fallback)
    }

    /// Fall back only when the primary fails with one of `kinds`
    pub fn absorbing(
        primary: Arc<dyn Strategy<I, O>>,
        kinds: Option<&[FailureKind]>,
        fallback: Arc<dyn Strategy<I, O>>,
    ) -> Self {
        let name = format!("{}_with_fallback", primary.name());
        let chain = FallbackChain::new(name);
        let chain = match kinds {
            Some(kinds) => chain.then_absorbing(primary, kinds),
            None => chain.then(primary),
        };
        Self {
            chain: chain.then(fallback),
        }
    }

    /// Fall back to a fixed value on any primary failure
    pub fn with_value(primary: Arc<dyn Strategy<I, O>>, value: O) -> Self
    where
        O: Clone + Sync,
    {
        Self::new(primary, Arc::new(StaticValue { value }))
    }

    pub fn with_events(mut self, events: GovernanceEvents) -> Self {
        self.chain = self.chain.with_events(events);
        self
    }

    pub fn with_metrics(mut self, metrics: GovernanceMetrics) -> Self {
        self.chain = self.chain.with_metrics(metrics);
        self
    }

    pub async fn execute(&self, input: I) -> Result<O, FallbackError> {
        self.chain.execute(input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{BreakerConfig, BreakerState};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Strategy with a scripted result that counts invocations
    struct Scripted {
        name: &'static str,
        result: Result<String, StrategyError>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn ok(name: &'static str, value: &str) -> Arc<Self> {
            Arc::new(Self {
                name,
                result: Ok(value.to_string()),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(name: &'static str, kind: FailureKind) -> Arc<Self> {
            Arc::new(Self {
                name,
                result: Err(StrategyError::new(kind, format!("{} failed", name))),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Strategy<u32, String> for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn call(&self, _input: u32) -> Result<String, StrategyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    #[tokio::test]
    async fn test_first_success_stops_chain() {
        let primary = Scripted::failing("primary", FailureKind::Timeout);
        let secondary = Scripted::ok("secondary", "cached");
        let tertiary = Scripted::ok("tertiary", "default");

        let chain = FallbackChain::<u32, String>::new("lookup")
            .then(primary.clone())
            .then(secondary.clone())
            .then(tertiary.clone());

        assert_eq!(chain.execute(7).await.unwrap(), "cached");
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 1);
        assert_eq!(tertiary.calls(), 0);
    }

    #[tokio::test]
    async fn test_third_strategy_succeeds_after_two_failures() {
        let primary = Scripted::failing("primary", FailureKind::Timeout);
        let secondary = Scripted::failing("secondary", FailureKind::Unavailable);
        let tertiary = Scripted::ok("tertiary", "default");

        let chain = FallbackChain::<u32, String>::new("lookup")
            .then(primary.clone())
            .then(secondary.clone())
            .then(tertiary.clone());

        assert_eq!(chain.execute(7).await.unwrap(), "default");
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 1);
        assert_eq!(tertiary.calls(), 1);
    }

    #[tokio::test]
    async fn test_all_failures_reported_in_order() {
        let metrics = GovernanceMetrics::new().unwrap();
        let first = Scripted::failing("first", FailureKind::Timeout);
        let second = Scripted::failing("second", FailureKind::Unavailable);

        let chain = FallbackChain::<u32, String>::new("lookup")
            .then(first.clone())
            .then(second.clone())
            .with_metrics(metrics.clone());

        match chain.execute(1).await {
            Err(FallbackError::ServiceUnavailable(err)) => {
                let names: Vec<&str> = err.attempts.iter().map(|a| a.strategy.as_str()).collect();
                assert_eq!(names, vec!["first", "second"]);
                assert_eq!(err.attempts[0].kind, FailureKind::Timeout);
                assert_eq!(err.attempts[1].message, "second failed");
            }
            other => panic!("expected service unavailable, got {:?}", other),
        }

        let families = metrics.registry().gather();
        let exhausted = families
            .iter()
            .find(|f| f.get_name() == "fallback_chain_exhausted_total")
            .unwrap();
        assert_eq!(exhausted.get_metric()[0].get_counter().get_value(), 1.0);
    }

    #[tokio::test]
    async fn test_non_absorbable_failure_propagates() {
        let primary = Scripted::failing("primary", FailureKind::InvalidInput);
        let secondary = Scripted::ok("secondary", "cached");

        let chain = FallbackChain::<u32, String>::new("lookup")
            .then_absorbing(primary.clone(), &[FailureKind::Timeout, FailureKind::Unavailable])
            .then(secondary.clone());

        match chain.execute(1).await {
            Err(FallbackError::Propagated { strategy, error }) => {
                assert_eq!(strategy, "primary");
                assert_eq!(error.kind, FailureKind::InvalidInput);
            }
            other => panic!("expected propagated error, got {:?}", other),
        }
        assert_eq!(secondary.calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_chain_is_unavailable() {
        let chain: FallbackChain<u32, String> = FallbackChain::new("empty");
        assert!(chain.is_empty());
        match chain.execute(1).await {
            Err(FallbackError::ServiceUnavailable(err)) => assert!(err.attempts.is_empty()),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fn_strategy_receives_input() {
        let double = Arc::new(FnStrategy::new("double", |n: u32| async move {
            Ok::<_, StrategyError>(n * 2)
        }));
        let chain = FallbackChain::<u32, u32>::new("math").then(double);
        assert_eq!(chain.execute(21).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_fallback_value() {
        let primary = Scripted::failing("primary", FailureKind::Overloaded);
        let wrapped = WithFallback::<u32, String>::with_value(primary.clone(), "fallback".to_string());

        assert_eq!(wrapped.execute(3).await.unwrap(), "fallback");
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn test_with_fallback_strategy_skipped_on_success() {
        let primary = Scripted::ok("primary", "fresh");
        let fallback = Scripted::ok("fallback", "stale");
        let wrapped = WithFallback::<u32, String>::new(primary.clone(), fallback.clone());

        assert_eq!(wrapped.execute(3).await.unwrap(), "fresh");
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_with_fallback_respects_absorbable_kinds() {
        let primary = Scripted::failing("primary", FailureKind::Internal);
        let fallback = Scripted::ok("fallback", "stale");
        let wrapped = WithFallback::<u32, String>::absorbing(
            primary.clone(),
            Some(&[FailureKind::Timeout]),
            fallback.clone(),
        );

        assert!(matches!(
            wrapped.execute(3).await,
            Err(FallbackError::Propagated { .. })
        ));
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_breaker_guarded_fails_fast_when_open() {
        let breaker = Arc::new(CircuitBreaker::new(
            "primary",
            BreakerConfig {
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(60),
            },
        ));
        let primary = Scripted::failing("primary", FailureKind::Unavailable);
        let guarded = Arc::new(BreakerGuarded::<u32, String>::new(primary.clone(), breaker.clone()));
        let backup = Scripted::ok("backup", "replica");

        let chain = FallbackChain::<u32, String>::new("reads")
            .then(guarded)
            .then(backup.clone());

        for _ in 0..4 {
            assert_eq!(chain.execute(0).await.unwrap(), "replica");
        }

        // Two real failures opened the breaker; later calls never reached primary
        assert_eq!(primary.calls(), 2);
        assert_eq!(backup.calls(), 4);
        assert!(breaker.is_open());
    }

    #[tokio::test]
    async fn test_breaker_guarded_records_success() {
        let breaker = Arc::new(CircuitBreaker::new("ok", BreakerConfig::default()));
        let guarded = BreakerGuarded::<u32, String>::new(Scripted::ok("ok", "value"), breaker.clone());

        assert_eq!(guarded.call(0).await.unwrap(), "value");
        assert_eq!(breaker.snapshot().total_successes, 1);
    }

    fn half_open_breaker() -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(
            "flaky",
            BreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_millis(20),
            },
        ));
        breaker.record_failure();
        breaker
    }

    #[tokio::test]
    async fn test_uncounted_trial_failure_frees_the_trial() {
        let breaker = half_open_breaker();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let rejecting = Scripted::failing("flaky", FailureKind::InvalidInput);
        let guarded = BreakerGuarded::<u32, String>::new(rejecting.clone(), breaker.clone());
        let err = guarded.call(0).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidInput);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // The next caller gets a fresh trial and can close the breaker
        let healthy = BreakerGuarded::<u32, String>::new(Scripted::ok("flaky", "value"), breaker.clone());
        assert_eq!(healthy.call(0).await.unwrap(), "value");
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(rejecting.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_trial_frees_the_trial() {
        let breaker = half_open_breaker();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let hanging = Arc::new(FnStrategy::new("flaky", |_n: u32| async {
            std::future::pending::<Result<String, StrategyError>>().await
        }));
        let guarded = BreakerGuarded::<u32, String>::new(hanging, breaker.clone());
        let cancelled = tokio::time::timeout(Duration::from_millis(10), guarded.call(0)).await;
        assert!(cancelled.is_err());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        assert!(!breaker.is_open());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
