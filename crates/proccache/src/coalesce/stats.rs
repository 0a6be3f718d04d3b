//! Coalescing statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for monitoring coalescing effectiveness
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoalescerStats {
    /// Calls to `execute` (and therefore `get`)
    pub total_calls: u64,
    /// Calls that joined a round already in flight
    pub coalesced_calls: u64,
    /// Leader rounds answered by a stored value
    pub store_hits: u64,
    /// Leader rounds answered by an empty marker
    pub empty_hits: u64,
    /// Loader invocations
    pub loads: u64,
    /// Loaders that returned an error
    pub loader_errors: u64,
    /// Loaders that panicked
    pub faults: u64,
    /// Loaders that missed their deadline
    pub timeouts: u64,
    /// Keys currently in flight
    pub in_flight: usize,
}

impl CoalescerStats {
    /// Returns the coalescing ratio (0.0 to 1.0)
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.coalesced_calls as f64 / self.total_calls as f64
        }
    }

    /// Fraction of leader rounds served without running the loader
    pub fn store_hit_ratio(&self) -> f64 {
        let answered = self.store_hits + self.empty_hits;
        let rounds = answered + self.loads;
        if rounds == 0 {
            0.0
        } else {
            answered as f64 / rounds as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsCollector {
    total_calls: AtomicU64,
    coalesced_calls: AtomicU64,
    store_hits: AtomicU64,
    empty_hits: AtomicU64,
    loads: AtomicU64,
    loader_errors: AtomicU64,
    faults: AtomicU64,
    timeouts: AtomicU64,
}

impl StatsCollector {
    pub(crate) fn record_call(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_coalesced(&self) {
        self.coalesced_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_store_hit(&self) {
        self.store_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_empty_hit(&self) {
        self.empty_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_loader_error(&self) {
        self.loader_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, in_flight: usize) -> CoalescerStats {
        CoalescerStats {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            coalesced_calls: self.coalesced_calls.load(Ordering::Relaxed),
            store_hits: self.store_hits.load(Ordering::Relaxed),
            empty_hits: self.empty_hits.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            loader_errors: self.loader_errors.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            in_flight,
        }
    }
}
