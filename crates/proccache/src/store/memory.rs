//! In-process TTL store with per-entry deadlines
//!
//! Each entry carries its own deadline computed from the [`Expiration`] of
//! the write, so positive values, empty markers, and counters can live for
//! different lengths of time in the same map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use super::stats::{MetricsCollector, StoreStats};
use super::{CacheSlot, Expiration, TtlStore};
use crate::config::StoreConfig;
use crate::time::{Clock, SystemClock};

/// Entry stored in the map with its deadline
#[derive(Debug, Clone)]
struct StoredEntry<V> {
    slot: CacheSlot<V>,
    /// `None` means the entry never expires
    expires_at: Option<Instant>,
}

impl<V> StoredEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// Thread-safe in-memory [`TtlStore`]
///
/// # Type Parameters
/// - `V`: stored value type (must be `Clone`; reads hand out copies)
/// - `C`: clock used for deadlines (defaults to `SystemClock`)
///
/// # Example
/// ```
/// use std::time::Duration;
///
/// use proccache::{CacheSlot, Expiration, MemoryTtlStore, MockClock, StoreConfig, TtlStore};
///
/// let clock = MockClock::new();
/// let store = MemoryTtlStore::with_clock(StoreConfig::default(), clock.clone());
///
/// store.set("k", CacheSlot::Value(1), Expiration::After(Duration::from_secs(2)));
/// assert_eq!(store.get("k"), Some(CacheSlot::Value(1)));
///
/// clock.advance(Duration::from_secs(2));
/// assert_eq!(store.get("k"), None);
/// ```
pub struct MemoryTtlStore<V, C = SystemClock>
where
    C: Clock,
{
    entries: RwLock<HashMap<String, StoredEntry<V>>>,
    config: StoreConfig,
    metrics: MetricsCollector,
    clock: C,
}

impl<V> MemoryTtlStore<V, SystemClock> {
    /// Create a store driven by the system clock
    pub fn new(config: StoreConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<V, C> MemoryTtlStore<V, C>
where
    C: Clock,
{
    /// Create a store with a custom clock (useful for testing)
    pub fn with_clock(config: StoreConfig, clock: C) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
            metrics: MetricsCollector::new(),
            clock,
        }
    }

    /// Configuration this store was built with
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Number of entries held, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the store holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and reset the counters
    pub fn clear(&self) {
        self.entries.write().clear();
        self.metrics.reset();
    }

    /// Remove expired entries
    ///
    /// Returns the number of entries removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        drop(entries);

        if removed > 0 {
            self.metrics.record_expirations(removed);
        }
        removed
    }

    /// Get store statistics
    pub fn stats(&self) -> StoreStats {
        self.metrics.snapshot(self.len())
    }

    fn deadline(&self, expiration: Expiration) -> Option<Instant> {
        match expiration {
            Expiration::Never => None,
            // A zero default lifetime means entries stored with the default never expire
            Expiration::Default if self.config.default_ttl.is_zero() => None,
            Expiration::Default => self.clock.deadline_after(self.config.default_ttl),
            Expiration::After(ttl) => self.clock.deadline_after(ttl),
        }
    }
}

impl<V, C> MemoryTtlStore<V, C>
where
    V: Send + Sync + 'static,
    C: Clock,
{
    /// Start the background sweep for this store
    ///
    /// The janitor wakes every `cleanup_interval` and calls
    /// [`cleanup_expired`](Self::cleanup_expired). It only holds a weak
    /// reference, so it stops once the store is dropped, and it is aborted
    /// when the returned [`Janitor`] is dropped.
    ///
    /// Returns `None` when the interval is zero or no tokio runtime is
    /// running.
    pub fn spawn_janitor(self: &Arc<Self>) -> Option<Janitor> {
        let interval = self.config.cleanup_interval;
        if interval.is_zero() {
            return None;
        }
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let store = Arc::downgrade(self);

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip first immediate tick

            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let removed = store.cleanup_expired();
                if removed > 0 {
                    debug!(removed, remaining = store.len(), "Janitor swept expired entries");
                }
            }
        });

        Some(Janitor { handle })
    }
}

impl<V, C> TtlStore<V> for MemoryTtlStore<V, C>
where
    V: Clone + Send + Sync + 'static,
    C: Clock,
{
    fn get(&self, key: &str) -> Option<CacheSlot<V>> {
        let now = self.clock.now();
        let entries = self.entries.read();

        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.metrics.record_hit();
                Some(entry.slot.clone())
            }
            _ => {
                self.metrics.record_miss();
                None
            }
        }
    }

    fn set(&self, key: &str, slot: CacheSlot<V>, expiration: Expiration) {
        let expires_at = self.deadline(expiration);
        self.entries.write().insert(key.to_string(), StoredEntry { slot, expires_at });
        self.metrics.record_set();
    }

    fn remove(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.entries.write().remove(key).is_some_and(|entry| !entry.is_expired(now))
    }

    fn increment_or_init(&self, key: &str, delta: u32, ttl_on_init: Expiration) -> u32 {
        let now = self.clock.now();
        let mut entries = self.entries.write();

        if let Some(entry) = entries.get_mut(key) {
            if !entry.is_expired(now) {
                if let CacheSlot::Counter(count) = &mut entry.slot {
                    *count = count.wrapping_add(delta);
                    return *count;
                }
            }
        }

        let expires_at = self.deadline(ttl_on_init);
        entries.insert(key.to_string(), StoredEntry { slot: CacheSlot::Counter(delta), expires_at });
        drop(entries);

        self.metrics.record_set();
        delta
    }
}

/// Handle to a running janitor task; aborts the task on drop
#[derive(Debug)]
pub struct Janitor {
    handle: JoinHandle<()>,
}

impl Janitor {
    /// Whether the janitor task has exited
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Janitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
