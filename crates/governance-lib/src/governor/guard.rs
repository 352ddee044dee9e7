//! Scoped handles tying reservations and queued waiters to their owner's lifetime

use super::queue::WaitKey;
use super::GovernorShared;
use crate::models::Priority;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A granted reservation, released when dropped
///
/// Release happens on every exit path of the owning scope: normal return,
/// early `?` return, panic unwind, or cancellation of the owning future.
#[must_use = "dropping the guard releases the reservation immediately"]
pub struct ReservationGuard {
    shared: Arc<GovernorShared>,
    operation_id: String,
    ticket: u64,
    memory_mb: f64,
    cpu_percent: f64,
    priority: Priority,
    granted_at: Instant,
    released: bool,
}

impl ReservationGuard {
    pub(crate) fn new(
        shared: Arc<GovernorShared>,
        operation_id: String,
        ticket: u64,
        memory_mb: f64,
        cpu_percent: f64,
        priority: Priority,
    ) -> Self {
        Self {
            shared,
            operation_id,
            ticket,
            memory_mb,
            cpu_percent,
            priority,
            granted_at: Instant::now(),
            released: false,
        }
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn memory_mb(&self) -> f64 {
        self.memory_mb
    }

    pub fn cpu_percent(&self) -> f64 {
        self.cpu_percent
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Time since the reservation was granted
    pub fn elapsed(&self) -> Duration {
        self.granted_at.elapsed()
    }

    /// Release before the end of scope
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.release_ticket(&self.operation_id, self.ticket);
        }
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for ReservationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationGuard")
            .field("operation_id", &self.operation_id)
            .field("memory_mb", &self.memory_mb)
            .field("cpu_percent", &self.cpu_percent)
            .field("priority", &self.priority)
            .field("released", &self.released)
            .finish()
    }
}

/// Cleans up a queued waiter whose `reserve` future is dropped early
///
/// If the waiter is still queued it is removed; if a grant already
/// landed, the granted reservation is released again.
pub(crate) struct PendingAdmission {
    shared: Arc<GovernorShared>,
    key: WaitKey,
    operation_id: String,
    armed: bool,
}

impl PendingAdmission {
    pub(crate) fn new(shared: Arc<GovernorShared>, key: WaitKey, operation_id: String) -> Self {
        Self {
            shared,
            key,
            operation_id,
            armed: true,
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingAdmission {
    fn drop(&mut self) {
        if self.armed {
            self.shared.abandon_waiter(&self.key, &self.operation_id);
        }
    }
}
