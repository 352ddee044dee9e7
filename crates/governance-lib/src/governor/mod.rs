//! Admission control over shared memory, CPU and concurrency budgets
//!
//! Requests that fit are granted immediately. Requests that do not fit
//! trigger at most one memory reclamation pass (when memory is short) and
//! are then parked in a wait queue ordered by `(-priority, enqueue order)`.
//! Every release re-evaluates the queue under the governor mutex and
//! grants, in that order, each waiter that fits the freed capacity.
//!
//! A waiter that does not fit does not block later waiters that do: a
//! large high-priority request can be overtaken by a small lower-priority
//! one. Within a priority level grants are strictly FIFO.

mod guard;
mod queue;


pub use guard::ReservationGuard;

use crate::error::{RejectReason, ResourceUnavailableError};
use crate::models::{duration_millis, Priority, ResourceRequest};
use crate::observability::{GovernanceEvents, GovernanceMetrics};
use crate::tuning::HardwareProfile;
use async_trait::async_trait;
use guard::PendingAdmission;
use queue::{WaitKey, WaitQueue, Waiter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

/// Slack for accumulated floating point error in reserved totals
const EPSILON: f64 = 1e-9;

/// Hook that frees memory held by non-essential caches
///
/// Invoked at most once per admission attempt, before a memory-starved
/// request is queued. Returns the amount of memory (MB) it believes it freed.
#[async_trait]
pub trait MemoryReclaimer: Send + Sync {
    async fn reclaim(&self, needed_mb: f64) -> f64;
}

/// Limits enforced by the governor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub memory_limit_mb: f64,
    pub cpu_limit_percent: f64,
    pub max_concurrent: usize,
    /// Timeout used by [`ResourceGovernor::reserve_default`]
    #[serde(with = "duration_millis")]
    pub default_timeout: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: 4096.0,
            cpu_limit_percent: 80.0,
            max_concurrent: 10,
            default_timeout: Duration::from_secs(30),
        }
    }
}

impl GovernorConfig {
    /// Derive limits from the host: 80% of total memory and CPU, two
    /// concurrent operations per core
    pub fn for_hardware(profile: &HardwareProfile) -> Self {
        Self {
            memory_limit_mb: profile.total_memory_gb * 1024.0 * 0.8,
            cpu_limit_percent: 80.0,
            max_concurrent: (profile.cpu_count * 2).max(1),
            ..Default::default()
        }
    }
}

/// Cumulative governor counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernorCounters {
    pub granted: u64,
    pub released: u64,
    pub queued: u64,
    pub timed_out: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub reclaim_attempts: u64,
    pub release_misses: u64,
}

/// Snapshot of governor gauges and counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorStats {
    pub active: usize,
    pub queued: usize,
    pub reserved_memory_mb: f64,
    pub reserved_cpu_percent: f64,
    pub peak_memory_mb: f64,
    pub peak_cpu_percent: f64,
    pub memory_limit_mb: f64,
    pub cpu_limit_percent: f64,
    pub max_concurrent: usize,
    pub counters: GovernorCounters,
}

/// A granted resource hold
#[derive(Debug, Clone)]
struct ActiveReservation {
    ticket: u64,
    memory_mb: f64,
    cpu_percent: f64,
    priority: Priority,
    started_at: Instant,
}

/// Which budgets a request would overrun
#[derive(Debug, Clone, Copy, Default)]
struct Shortfall {
    concurrency: bool,
    memory_mb: f64,
    cpu: bool,
}

impl Shortfall {
    fn is_memory(&self) -> bool {
        self.memory_mb > 0.0
    }
}

#[derive(Debug, Default)]
struct GovernorState {
    active: HashMap<String, ActiveReservation>,
    queue: WaitQueue,
    reserved_memory_mb: f64,
    reserved_cpu_percent: f64,
    peak_memory_mb: f64,
    peak_cpu_percent: f64,
    next_seq: u64,
    counters: GovernorCounters,
    closed: bool,
}

impl GovernorState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Reasons to refuse a request before any capacity check
    fn precheck(&self, operation_id: &str) -> Option<RejectReason> {
        if self.closed {
            Some(RejectReason::ShuttingDown)
        } else if self.active.contains_key(operation_id)
            || self.queue.contains_operation(operation_id)
        {
            Some(RejectReason::DuplicateOperation)
        } else {
            None
        }
    }
}

pub(crate) struct GovernorShared {
    config: GovernorConfig,
    state: Mutex<GovernorState>,
    reclaimer: Option<Arc<dyn MemoryReclaimer>>,
    metrics: Option<GovernanceMetrics>,
    events: GovernanceEvents,
}

impl GovernorShared {
    fn lock(&self) -> MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, state: &GovernorState, request: &ResourceRequest) -> Result<(), Shortfall> {
        let mut shortfall = Shortfall::default();
        if state.active.len() >= self.config.max_concurrent {
            shortfall.concurrency = true;
        }
        let memory_after = state.reserved_memory_mb + request.memory_mb;
        if memory_after > self.config.memory_limit_mb + EPSILON {
            shortfall.memory_mb = memory_after - self.config.memory_limit_mb;
        }
        if state.reserved_cpu_percent + request.cpu_percent > self.config.cpu_limit_percent + EPSILON
        {
            shortfall.cpu = true;
        }

        if shortfall.concurrency || shortfall.is_memory() || shortfall.cpu {
            Err(shortfall)
        } else {
            Ok(())
        }
    }

    /// Describe why a request can never be admitted, if that is the case
    fn exceeds_limits(&self, request: &ResourceRequest) -> Option<String> {
        if self.config.max_concurrent == 0 {
            return Some("governor allows no concurrent operations".to_string());
        }
        if request.memory_mb > self.config.memory_limit_mb + EPSILON {
            return Some(format!(
                "requested {} MB, limit is {} MB",
                request.memory_mb, self.config.memory_limit_mb
            ));
        }
        if request.cpu_percent > self.config.cpu_limit_percent + EPSILON {
            return Some(format!(
                "requested {}% cpu, limit is {}%",
                request.cpu_percent, self.config.cpu_limit_percent
            ));
        }
        None
    }

    fn admit(&self, state: &mut GovernorState, request: &ResourceRequest, ticket: u64) {
        state.active.insert(
            request.operation_id.clone(),
            ActiveReservation {
                ticket,
                memory_mb: request.memory_mb,
                cpu_percent: request.cpu_percent,
                priority: request.priority,
                started_at: Instant::now(),
            },
        );
        state.reserved_memory_mb += request.memory_mb;
        state.reserved_cpu_percent += request.cpu_percent;
        state.peak_memory_mb = state.peak_memory_mb.max(state.reserved_memory_mb);
        state.peak_cpu_percent = state.peak_cpu_percent.max(state.reserved_cpu_percent);
        state.counters.granted += 1;
    }

    /// Remove an active reservation and hand freed capacity to waiters
    fn remove_active(&self, state: &mut GovernorState, operation_id: &str) {
        if let Some(reservation) = state.active.remove(operation_id) {
            state.reserved_memory_mb = (state.reserved_memory_mb - reservation.memory_mb).max(0.0);
            state.reserved_cpu_percent =
                (state.reserved_cpu_percent - reservation.cpu_percent).max(0.0);
            if state.active.is_empty() {
                state.reserved_memory_mb = 0.0;
                state.reserved_cpu_percent = 0.0;
            }
            state.counters.released += 1;
            debug!(
                operation_id = %operation_id,
                priority = %reservation.priority,
                held_ms = reservation.started_at.elapsed().as_millis() as u64,
                "Reservation released"
            );
            self.dispatch(state);
        }
    }

    /// Grant queued waiters, in order, while capacity allows
    fn dispatch(&self, state: &mut GovernorState) {
        for key in state.queue.keys() {
            if state.active.len() >= self.config.max_concurrent {
                break;
            }
            let fits = match state.queue.get(&key) {
                Some(waiter) => self.check(state, &waiter.request).is_ok(),
                None => false,
            };
            if !fits {
                continue;
            }
            let Some(waiter) = state.queue.remove(&key) else {
                continue;
            };
            if waiter.wake.send(()).is_err() {
                // Owner went away between enqueue and grant
                state.counters.cancelled += 1;
                continue;
            }
            self.admit(state, &waiter.request, key.seq());
            debug!(
                operation_id = %waiter.request.operation_id,
                queued_ms = waiter.enqueued_at.elapsed().as_millis() as u64,
                "Queued reservation granted"
            );
        }
    }

    fn publish_gauges(&self, state: &GovernorState) {
        if let Some(metrics) = &self.metrics {
            metrics.set_governor_gauges(
                state.active.len(),
                state.queue.len(),
                state.reserved_memory_mb,
                state.reserved_cpu_percent,
            );
        }
    }

    fn reject(&self, request: ResourceRequest, reason: RejectReason) -> ResourceUnavailableError {
        {
            let mut state = self.lock();
            state.counters.rejected += 1;
        }
        if let Some(metrics) = &self.metrics {
            metrics.inc_rejections(reason.label());
        }
        self.events
            .reservation_rejected(&request.operation_id, &reason.to_string());
        ResourceUnavailableError::new(request, reason)
    }

    fn on_granted(&self, request: &ResourceRequest, waited: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_grant(waited);
        }
        self.events.reservation_granted(
            &request.operation_id,
            request.memory_mb,
            request.cpu_percent,
            request.priority,
            waited,
        );
    }

    /// Release on behalf of a guard; only the matching grant is released
    pub(crate) fn release_ticket(&self, operation_id: &str, ticket: u64) {
        let mut state = self.lock();
        let matches = state
            .active
            .get(operation_id)
            .map(|r| r.ticket == ticket)
            .unwrap_or(false);
        if matches {
            self.remove_active(&mut state, operation_id);
            self.publish_gauges(&state);
        } else {
            state.counters.release_misses += 1;
            drop(state);
            if let Some(metrics) = &self.metrics {
                metrics.inc_release_misses();
            }
            debug!(
                operation_id = %operation_id,
                "Guard dropped after its reservation was already released"
            );
        }
    }

    /// Clean up after a `reserve` future dropped while queued
    pub(crate) fn abandon_waiter(&self, key: &WaitKey, operation_id: &str) {
        let mut state = self.lock();
        if state.queue.remove(key).is_some() {
            state.counters.cancelled += 1;
        } else {
            // The grant landed but its owner never collected it
            let granted = state
                .active
                .get(operation_id)
                .map(|r| r.ticket == key.seq())
                .unwrap_or(false);
            if granted {
                state.counters.cancelled += 1;
                self.remove_active(&mut state, operation_id);
            }
        }
        self.publish_gauges(&state);
        debug!(operation_id = %operation_id, "Queued reservation abandoned");
    }
}

/// Admission controller for memory, CPU and concurrency budgets
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct ResourceGovernor {
    shared: Arc<GovernorShared>,
}

impl ResourceGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        GovernorBuilder::new(config).build()
    }

    pub fn builder(config: GovernorConfig) -> GovernorBuilder {
        GovernorBuilder::new(config)
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.shared.config
    }

    /// Reserve resources, waiting up to `timeout` for capacity
    pub async fn reserve(
        &self,
        operation_id: impl Into<String>,
        memory_mb: f64,
        cpu_percent: f64,
        priority: Priority,
        timeout: Duration,
    ) -> Result<ReservationGuard, ResourceUnavailableError> {
        self.reserve_request(ResourceRequest::new(
            operation_id,
            memory_mb,
            cpu_percent,
            priority,
            timeout,
        ))
        .await
    }

    /// Reserve with normal priority and the configured default timeout
    pub async fn reserve_default(
        &self,
        operation_id: impl Into<String>,
        memory_mb: f64,
        cpu_percent: f64,
    ) -> Result<ReservationGuard, ResourceUnavailableError> {
        let timeout = self.shared.config.default_timeout;
        self.reserve(operation_id, memory_mb, cpu_percent, Priority::Normal, timeout)
            .await
    }

    /// Reserve resources described by a request
    pub async fn reserve_request(
        &self,
        request: ResourceRequest,
    ) -> Result<ReservationGuard, ResourceUnavailableError> {
        let shared = &self.shared;

        if let Some(detail) = request.validate() {
            return Err(shared.reject(request, RejectReason::InvalidRequest(detail)));
        }
        if let Some(detail) = shared.exceeds_limits(&request) {
            return Err(shared.reject(request, RejectReason::ExceedsLimits(detail)));
        }

        let started = Instant::now();
        let deadline = started.checked_add(request.timeout);

        let shortfall = {
            let mut state = shared.lock();
            if let Some(reason) = state.precheck(&request.operation_id) {
                drop(state);
                return Err(shared.reject(request, reason));
            }
            match shared.check(&state, &request) {
                Ok(()) => {
                    let ticket = state.next_seq();
                    shared.admit(&mut state, &request, ticket);
                    shared.publish_gauges(&state);
                    drop(state);
                    shared.on_granted(&request, Duration::ZERO);
                    return Ok(self.guard(&request, ticket));
                }
                Err(shortfall) => shortfall,
            }
        };

        let mut reclaimed = false;
        if shortfall.is_memory() {
            if let Some(reclaimer) = &shared.reclaimer {
                {
                    let mut state = shared.lock();
                    state.counters.reclaim_attempts += 1;
                }
                if let Some(metrics) = &shared.metrics {
                    metrics.inc_reclaim_attempts();
                }
                shared
                    .events
                    .reclaim_attempted(&request.operation_id, shortfall.memory_mb);
                let freed = reclaimer.reclaim(shortfall.memory_mb).await;
                debug!(
                    operation_id = %request.operation_id,
                    freed_mb = freed,
                    "Memory reclamation finished"
                );
                reclaimed = true;
            }
        }

        let (key, mut wake, queue_len) = {
            let mut state = shared.lock();
            if let Some(reason) = state.precheck(&request.operation_id) {
                drop(state);
                return Err(shared.reject(request, reason));
            }
            if reclaimed && shared.check(&state, &request).is_ok() {
                let ticket = state.next_seq();
                shared.admit(&mut state, &request, ticket);
                shared.publish_gauges(&state);
                drop(state);
                shared.on_granted(&request, started.elapsed());
                return Ok(self.guard(&request, ticket));
            }

            let (tx, rx) = oneshot::channel();
            let key = WaitKey::new(request.priority, state.next_seq());
            state.queue.push(
                key,
                Waiter {
                    request: request.clone(),
                    enqueued_at: Instant::now(),
                    wake: tx,
                },
            );
            state.counters.queued += 1;
            // Capacity may have freed while the lock was released for reclamation
            shared.dispatch(&mut state);
            shared.publish_gauges(&state);
            (key, rx, state.queue.len())
        };
        shared
            .events
            .reservation_queued(&request.operation_id, request.priority, queue_len);

        let mut pending = PendingAdmission::new(shared.clone(), key, request.operation_id.clone());

        let woken = match deadline {
            Some(deadline) => {
                tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), &mut wake)
                    .await
                    .ok()
            }
            None => Some((&mut wake).await),
        };

        match woken {
            Some(Ok(())) => {
                pending.disarm();
                shared.on_granted(&request, started.elapsed());
                Ok(self.guard(&request, key.seq()))
            }
            Some(Err(_)) => {
                pending.disarm();
                Err(ResourceUnavailableError::new(
                    request,
                    RejectReason::ShuttingDown,
                ))
            }
            None => {
                let removed = {
                    let mut state = shared.lock();
                    let removed = state.queue.remove(&key).is_some();
                    if removed {
                        state.counters.timed_out += 1;
                        shared.publish_gauges(&state);
                    }
                    removed
                };
                pending.disarm();

                if removed {
                    if let Some(metrics) = &shared.metrics {
                        metrics.inc_timeouts();
                    }
                    shared
                        .events
                        .reservation_timed_out(&request.operation_id, started.elapsed());
                    return Err(ResourceUnavailableError::new(
                        request,
                        RejectReason::TimedOut,
                    ));
                }

                // A grant landed between the deadline and taking the lock
                match wake.try_recv() {
                    Ok(()) => {
                        shared.on_granted(&request, started.elapsed());
                        Ok(self.guard(&request, key.seq()))
                    }
                    Err(_) => Err(ResourceUnavailableError::new(
                        request,
                        RejectReason::ShuttingDown,
                    )),
                }
            }
        }
    }

    fn guard(&self, request: &ResourceRequest, ticket: u64) -> ReservationGuard {
        ReservationGuard::new(
            self.shared.clone(),
            request.operation_id.clone(),
            ticket,
            request.memory_mb,
            request.cpu_percent,
            request.priority,
        )
    }

    /// Release a reservation by operation ID
    ///
    /// Unknown or already released IDs are ignored with a diagnostic.
    pub fn release(&self, operation_id: &str) {
        let mut state = self.shared.lock();
        if state.active.contains_key(operation_id) {
            self.shared.remove_active(&mut state, operation_id);
            self.shared.publish_gauges(&state);
            return;
        }
        state.counters.release_misses += 1;
        drop(state);
        if let Some(metrics) = &self.shared.metrics {
            metrics.inc_release_misses();
        }
        self.shared.events.release_miss(operation_id);
    }

    /// Whether an operation currently holds a reservation
    pub fn is_active(&self, operation_id: &str) -> bool {
        self.shared.lock().active.contains_key(operation_id)
    }

    /// IDs of active reservations, sorted
    pub fn active_operations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.lock().active.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> GovernorStats {
        let state = self.shared.lock();
        GovernorStats {
            active: state.active.len(),
            queued: state.queue.len(),
            reserved_memory_mb: state.reserved_memory_mb,
            reserved_cpu_percent: state.reserved_cpu_percent,
            peak_memory_mb: state.peak_memory_mb,
            peak_cpu_percent: state.peak_cpu_percent,
            memory_limit_mb: self.shared.config.memory_limit_mb,
            cpu_limit_percent: self.shared.config.cpu_limit_percent,
            max_concurrent: self.shared.config.max_concurrent,
            counters: state.counters.clone(),
        }
    }

    /// Refuse new requests and fail every queued waiter
    ///
    /// Active reservations stay valid until their guards are dropped.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.closed = true;
        let dropped = state.queue.clear();
        self.shared.publish_gauges(&state);
        debug!(dropped_waiters = dropped, "Resource governor closed");
    }
}

/// Builder for a [`ResourceGovernor`] with optional collaborators
pub struct GovernorBuilder {
    config: GovernorConfig,
    reclaimer: Option<Arc<dyn MemoryReclaimer>>,
    metrics: Option<GovernanceMetrics>,
    events: GovernanceEvents,
}

impl GovernorBuilder {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            reclaimer: None,
            metrics: None,
            events: GovernanceEvents::new(),
        }
    }

    /// Set the memory reclamation hook
    pub fn reclaimer(mut self, reclaimer: Arc<dyn MemoryReclaimer>) -> Self {
        self.reclaimer = Some(reclaimer);
        self
    }

    pub fn metrics(mut self, metrics: GovernanceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn events(mut self, events: GovernanceEvents) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> ResourceGovernor {
        ResourceGovernor {
            shared: Arc::new(GovernorShared {
                config: self.config,
                state: Mutex::new(GovernorState {
                    queue: WaitQueue::new(),
                    ..Default::default()
                }),
                reclaimer: self.reclaimer,
                metrics: self.metrics,
                events: self.events,
            }),
        }
    }
}
