//! Priority-ordered wait structure for blocked admission requests

use crate::models::{Priority, ResourceRequest};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::time::Instant;
use tokio::sync::oneshot;

/// Ordering key for a waiter: higher priority first, then enqueue order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct WaitKey {
    rank: Reverse<Priority>,
    seq: u64,
}

impl WaitKey {
    pub(crate) fn new(priority: Priority, seq: u64) -> Self {
        Self {
            rank: Reverse(priority),
            seq,
        }
    }

    /// Sequence number, reused as the reservation ticket once granted
    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }
}

/// A request parked until capacity frees up
#[derive(Debug)]
pub(crate) struct Waiter {
    pub request: ResourceRequest,
    pub enqueued_at: Instant,
    pub wake: oneshot::Sender<()>,
}

/// Blocked requests ordered by `(-priority, enqueue sequence)`
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    waiters: BTreeMap<WaitKey, Waiter>,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, key: WaitKey, waiter: Waiter) {
        self.waiters.insert(key, waiter);
    }

    pub(crate) fn remove(&mut self, key: &WaitKey) -> Option<Waiter> {
        self.waiters.remove(key)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &WaitKey) -> bool {
        self.waiters.contains_key(key)
    }

    pub(crate) fn contains_operation(&self, operation_id: &str) -> bool {
        self.waiters
            .values()
            .any(|w| w.request.operation_id == operation_id)
    }

    /// Keys in grant order
    pub(crate) fn keys(&self) -> Vec<WaitKey> {
        self.waiters.keys().copied().collect()
    }

    pub(crate) fn get(&self, key: &WaitKey) -> Option<&Waiter> {
        self.waiters.get(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Remove every waiter, dropping their wake channels
    pub(crate) fn clear(&mut self) -> usize {
        let count = self.waiters.len();
        self.waiters.clear();
        count
    }
}
