//! Observability infrastructure for the governance layer
//!
//! Provides:
//! - Prometheus metrics registered in an owned registry (admission gauges,
//!   wait latency, breaker transitions, workload mode)
//! - Structured event logging with tracing, optionally mirrored into an
//!   [`AsyncLogSink`]

use crate::logging::{AsyncLogSink, LogRecord, Severity, SinkStats};
use crate::models::{Priority, WorkloadMode};
use prometheus::{
    Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default histogram buckets for admission wait time (in seconds)
const WAIT_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

struct GovernanceMetricsInner {
    registry: Registry,
    active_reservations: IntGauge,
    queued_requests: IntGauge,
    reserved_memory_mb: Gauge,
    reserved_cpu_percent: Gauge,
    admission_wait_seconds: Histogram,
    grants: IntCounter,
    timeouts: IntCounter,
    rejections: IntCounterVec,
    release_misses: IntCounter,
    reclaim_attempts: IntCounter,
    breaker_transitions: IntCounterVec,
    fallback_exhausted: IntCounter,
    workload_mode: IntGauge,
    recommended_batch_size: IntGauge,
    recommended_cache_size: IntGauge,
    recommended_workers: IntGauge,
    log_records_dropped: IntGauge,
    log_records_queued: IntGauge,
}

impl GovernanceMetricsInner {
    fn new(registry: Registry) -> prometheus::Result<Self> {
        let active_reservations = IntGauge::new(
            "governor_active_reservations",
            "Number of currently granted reservations",
        )?;
        let queued_requests = IntGauge::new(
            "governor_queued_requests",
            "Number of admission requests waiting for capacity",
        )?;
        let reserved_memory_mb = Gauge::new(
            "governor_reserved_memory_mb",
            "Memory currently reserved by active operations (MB)",
        )?;
        let reserved_cpu_percent = Gauge::new(
            "governor_reserved_cpu_percent",
            "CPU currently reserved by active operations (percent)",
        )?;
        let admission_wait_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "governor_admission_wait_seconds",
                "Time spent waiting for admission before a grant",
            )
            .buckets(WAIT_BUCKETS.to_vec()),
        )?;
        let grants = IntCounter::new("governor_grants_total", "Total reservations granted")?;
        let timeouts = IntCounter::new(
            "governor_timeouts_total",
            "Total admission requests that timed out while queued",
        )?;
        let rejections = IntCounterVec::new(
            Opts::new(
                "governor_rejections_total",
                "Total admission requests rejected without queueing",
            ),
            &["reason"],
        )?;
        let release_misses = IntCounter::new(
            "governor_release_misses_total",
            "Releases of unknown or already released operations",
        )?;
        let reclaim_attempts = IntCounter::new(
            "governor_reclaim_attempts_total",
            "Memory reclamation passes triggered by admission",
        )?;
        let breaker_transitions = IntCounterVec::new(
            Opts::new(
                "circuit_breaker_transitions_total",
                "Circuit breaker state transitions",
            ),
            &["breaker", "state"],
        )?;
        let fallback_exhausted = IntCounter::new(
            "fallback_chain_exhausted_total",
            "Fallback chains in which every strategy failed",
        )?;
        let workload_mode = IntGauge::new(
            "tuner_workload_mode",
            "Detected workload mode (0=idle, 1=mixed, 2=interactive_query, 3=bulk_ingestion)",
        )?;
        let recommended_batch_size = IntGauge::new(
            "tuner_recommended_batch_size",
            "Most recently recommended batch size",
        )?;
        let recommended_cache_size = IntGauge::new(
            "tuner_recommended_cache_size",
            "Most recently recommended cache size",
        )?;
        let recommended_workers = IntGauge::new(
            "tuner_recommended_workers",
            "Most recently recommended worker count",
        )?;

        let log_records_dropped = IntGauge::new(
            "log_sink_dropped_records",
            "Log records discarded because the sink queue was full",
        )?;
        let log_records_queued = IntGauge::new(
            "log_sink_queued_records",
            "Log records waiting for the sink writer",
        )?;

        registry.register(Box::new(active_reservations.clone()))?;
        registry.register(Box::new(queued_requests.clone()))?;
        registry.register(Box::new(reserved_memory_mb.clone()))?;
        registry.register(Box::new(reserved_cpu_percent.clone()))?;
        registry.register(Box::new(admission_wait_seconds.clone()))?;
        registry.register(Box::new(grants.clone()))?;
        registry.register(Box::new(timeouts.clone()))?;
        registry.register(Box::new(rejections.clone()))?;
        registry.register(Box::new(release_misses.clone()))?;
        registry.register(Box::new(reclaim_attempts.clone()))?;
        registry.register(Box::new(breaker_transitions.clone()))?;
        registry.register(Box::new(fallback_exhausted.clone()))?;
        registry.register(Box::new(workload_mode.clone()))?;
        registry.register(Box::new(recommended_batch_size.clone()))?;
        registry.register(Box::new(recommended_cache_size.clone()))?;
        registry.register(Box::new(recommended_workers.clone()))?;
        registry.register(Box::new(log_records_dropped.clone()))?;
        registry.register(Box::new(log_records_queued.clone()))?;

        Ok(Self {
            registry,
            active_reservations,
            queued_requests,
            reserved_memory_mb,
            reserved_cpu_percent,
            admission_wait_seconds,
            grants,
            timeouts,
            rejections,
            release_misses,
            reclaim_attempts,
            breaker_transitions,
            fallback_exhausted,
            workload_mode,
            recommended_batch_size,
            recommended_cache_size,
            recommended_workers,
            log_records_dropped,
            log_records_queued,
        })
    }
}

/// Prometheus metrics for the governance layer
///
/// Cheap to clone; clones share the same registry. Each instance owns
/// its registry, so tests and separate services never collide.
#[derive(Clone)]
pub struct GovernanceMetrics {
    inner: Arc<GovernanceMetricsInner>,
}

impl GovernanceMetrics {
    /// Create metrics in a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Register metrics into an existing registry
    pub fn with_registry(registry: Registry) -> prometheus::Result<Self> {
        Ok(Self {
            inner: Arc::new(GovernanceMetricsInner::new(registry)?),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Update admission gauges
    pub fn set_governor_gauges(
        &self,
        active: usize,
        queued: usize,
        memory_mb: f64,
        cpu_percent: f64,
    ) {
        self.inner.active_reservations.set(active as i64);
        self.inner.queued_requests.set(queued as i64);
        self.inner.reserved_memory_mb.set(memory_mb);
        self.inner.reserved_cpu_percent.set(cpu_percent);
    }

    pub fn observe_grant(&self, waited: Duration) {
        self.inner.grants.inc();
        self.inner
            .admission_wait_seconds
            .observe(waited.as_secs_f64());
    }

    pub fn inc_timeouts(&self) {
        self.inner.timeouts.inc();
    }

    pub fn inc_rejections(&self, reason: &str) {
        self.inner.rejections.with_label_values(&[reason]).inc();
    }

    pub fn inc_release_misses(&self) {
        self.inner.release_misses.inc();
    }

    pub fn inc_reclaim_attempts(&self) {
        self.inner.reclaim_attempts.inc();
    }

    pub fn inc_breaker_transition(&self, breaker: &str, state: &str) {
        self.inner
            .breaker_transitions
            .with_label_values(&[breaker, state])
            .inc();
    }

    pub fn inc_fallback_exhausted(&self) {
        self.inner.fallback_exhausted.inc();
    }

    /// Record the latest tuning recommendation
    pub fn set_recommendation(
        &self,
        mode: WorkloadMode,
        batch_size: usize,
        cache_size: usize,
        workers: usize,
    ) {
        self.inner.workload_mode.set(mode.code());
        self.inner.recommended_batch_size.set(batch_size as i64);
        self.inner.recommended_cache_size.set(cache_size as i64);
        self.inner.recommended_workers.set(workers as i64);
    }

    /// Copy log sink counters into gauges
    pub fn set_sink_stats(&self, stats: &SinkStats) {
        self.inner.log_records_dropped.set(stats.dropped as i64);
        self.inner.log_records_queued.set(stats.queued as i64);
    }
}

/// Structured emitter for governance events
///
/// Every event is logged through `tracing`; when a sink is attached the
/// same event is also offered to it without blocking.
#[derive(Clone, Default)]
pub struct GovernanceEvents {
    sink: Option<Arc<AsyncLogSink>>,
}

impl GovernanceEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror events into a log sink
    pub fn with_sink(sink: Arc<AsyncLogSink>) -> Self {
        Self { sink: Some(sink) }
    }

    fn mirror(&self, record: impl FnOnce() -> LogRecord) {
        if let Some(sink) = &self.sink {
            sink.try_enqueue(record());
        }
    }

    /// Log a reservation grant
    pub fn reservation_granted(
        &self,
        operation_id: &str,
        memory_mb: f64,
        cpu_percent: f64,
        priority: Priority,
        waited: Duration,
    ) {
        debug!(
            event = "reservation_granted",
            operation_id = %operation_id,
            memory_mb = memory_mb,
            cpu_percent = cpu_percent,
            priority = %priority,
            waited_ms = waited.as_millis() as u64,
            "Reservation granted"
        );
        self.mirror(|| {
            LogRecord::new(Severity::Debug, "governor", "Reservation granted")
                .with_field("operation_id", operation_id)
                .with_field("memory_mb", memory_mb)
                .with_field("cpu_percent", cpu_percent)
                .with_field("priority", priority.as_str())
                .with_field("waited_ms", waited.as_millis() as i64)
        });
    }

    /// Log a request parked in the wait queue
    pub fn reservation_queued(&self, operation_id: &str, priority: Priority, queue_len: usize) {
        debug!(
            event = "reservation_queued",
            operation_id = %operation_id,
            priority = %priority,
            queue_len = queue_len,
            "Reservation queued until capacity frees"
        );
        self.mirror(|| {
            LogRecord::new(Severity::Debug, "governor", "Reservation queued")
                .with_field("operation_id", operation_id)
                .with_field("priority", priority.as_str())
                .with_field("queue_len", queue_len)
        });
    }

    /// Log a request that gave up waiting
    pub fn reservation_timed_out(&self, operation_id: &str, waited: Duration) {
        warn!(
            event = "reservation_timed_out",
            operation_id = %operation_id,
            waited_ms = waited.as_millis() as u64,
            "Reservation timed out waiting for resources"
        );
        self.mirror(|| {
            LogRecord::new(Severity::Warning, "governor", "Reservation timed out")
                .with_field("operation_id", operation_id)
                .with_field("waited_ms", waited.as_millis() as i64)
        });
    }

    /// Log an immediate rejection
    pub fn reservation_rejected(&self, operation_id: &str, reason: &str) {
        warn!(
            event = "reservation_rejected",
            operation_id = %operation_id,
            reason = %reason,
            "Reservation rejected"
        );
        self.mirror(|| {
            LogRecord::new(Severity::Warning, "governor", "Reservation rejected")
                .with_field("operation_id", operation_id)
                .with_field("reason", reason)
        });
    }

    /// Log a release of an unknown or already released operation
    pub fn release_miss(&self, operation_id: &str) {
        warn!(
            event = "release_miss",
            operation_id = %operation_id,
            "Release of unknown or already released operation ignored"
        );
        self.mirror(|| {
            LogRecord::new(Severity::Warning, "governor", "Release miss")
                .with_field("operation_id", operation_id)
        });
    }

    /// Log a memory reclamation pass
    pub fn reclaim_attempted(&self, operation_id: &str, needed_mb: f64) {
        info!(
            event = "memory_reclaim",
            operation_id = %operation_id,
            needed_mb = needed_mb,
            "Running memory reclamation before queueing"
        );
        self.mirror(|| {
            LogRecord::new(Severity::Info, "governor", "Memory reclamation")
                .with_field("operation_id", operation_id)
                .with_field("needed_mb", needed_mb)
        });
    }

    /// Log a circuit breaker state change
    pub fn breaker_transition(&self, breaker: &str, from: &str, to: &str, failures: u32) {
        if to == "open" {
            warn!(
                event = "breaker_transition",
                breaker = %breaker,
                from = %from,
                to = %to,
                failures = failures,
                "Circuit breaker opened"
            );
        } else {
            info!(
                event = "breaker_transition",
                breaker = %breaker,
                from = %from,
                to = %to,
                failures = failures,
                "Circuit breaker state changed"
            );
        }
        let severity = if to == "open" {
            Severity::Warning
        } else {
            Severity::Info
        };
        self.mirror(|| {
            LogRecord::new(severity, "breaker", "Circuit breaker state changed")
                .with_field("breaker", breaker)
                .with_field("from", from)
                .with_field("to", to)
                .with_field("failures", failures as i64)
        });
    }

    /// Log a fallback chain in which every strategy failed
    pub fn fallback_exhausted(&self, attempts: usize, summary: &str) {
        warn!(
            event = "fallback_exhausted",
            attempts = attempts,
            summary = %summary,
            "All fallback strategies failed"
        );
        self.mirror(|| {
            LogRecord::new(Severity::Error, "fallback", "All fallback strategies failed")
                .with_field("attempts", attempts)
                .with_field("summary", summary)
        });
    }

    /// Log a fallback strategy that rescued a failing chain
    pub fn fallback_used(&self, strategy: &str, position: usize) {
        info!(
            event = "fallback_used",
            strategy = %strategy,
            position = position,
            "Fallback strategy succeeded"
        );
        self.mirror(|| {
            LogRecord::new(Severity::Info, "fallback", "Fallback strategy succeeded")
                .with_field("strategy", strategy)
                .with_field("position", position)
        });
    }

    /// Log a published tuning recommendation
    pub fn recommendation_published(
        &self,
        mode: WorkloadMode,
        batch_size: usize,
        cache_size: usize,
        workers: usize,
    ) {
        info!(
            event = "recommendation_published",
            mode = %mode,
            batch_size = batch_size,
            cache_size = cache_size,
            workers = workers,
            "Published tuning recommendation"
        );
        self.mirror(|| {
            LogRecord::new(Severity::Info, "tuner", "Published tuning recommendation")
                .with_field("mode", mode.as_str())
                .with_field("batch_size", batch_size)
                .with_field("cache_size", cache_size)
                .with_field("workers", workers)
        });
    }

    /// Log service startup
    pub fn log_startup(&self, version: &str) {
        info!(
            event = "governance_started",
            version = %version,
            "Resource governance started"
        );
    }

    /// Log service shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "governance_shutdown",
            reason = %reason,
            "Resource governance shutting down"
        );
    }
}
