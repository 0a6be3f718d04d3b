//! Time-to-live key/value store backing the coalescer
//!
//! The coalescer only needs a narrow contract, captured by [`TtlStore`]:
//! read a slot, write a slot with an expiration, drop a key, and bump a
//! counter atomically. [`MemoryTtlStore`] is the in-process implementation.
//!
//! # Slots
//!
//! A key holds a [`CacheSlot`]: a real value, the [`CacheSlot::EmptyMarker`]
//! sentinel ("the loader confirmed there is nothing here"), or a counter.
//! Keeping the marker as its own variant means no loader value can ever be
//! mistaken for it.
//!
//! # Expiry
//!
//! Expiry is passive: `get` treats an entry past its deadline as absent.
//! Reclaiming the memory is left to [`MemoryTtlStore::cleanup_expired`],
//! usually driven by the janitor from [`MemoryTtlStore::spawn_janitor`].
//!
//! ```
//! use std::time::Duration;
//!
//! use proccache::{CacheSlot, Expiration, MemoryTtlStore, StoreConfig, TtlStore};
//!
//! let store: MemoryTtlStore<String> = MemoryTtlStore::new(StoreConfig::default());
//! store.set("greeting", CacheSlot::Value("hi".to_string()), Expiration::Default);
//! assert_eq!(store.get("greeting"), Some(CacheSlot::Value("hi".to_string())));
//!
//! assert_eq!(store.increment_or_init("hits", 1, Expiration::After(Duration::from_secs(60))), 1);
//! assert_eq!(store.increment_or_init("hits", 2, Expiration::Never), 3);
//! ```

mod memory;
mod stats;

use std::time::Duration;

pub use memory::{Janitor, MemoryTtlStore};
pub use stats::StoreStats;

/// Contents of a store entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheSlot<V> {
    /// A value produced by a loader or set explicitly
    Value(V),
    /// The loader ran and found nothing
    EmptyMarker,
    /// Counter maintained by `increment_or_init`
    Counter(u32),
}

impl<V> CacheSlot<V> {
    /// Short name of the slot kind, used in errors and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Value(_) => "value",
            Self::EmptyMarker => "empty marker",
            Self::Counter(_) => "counter",
        }
    }

    /// Whether this slot is the negative-cache sentinel
    pub fn is_empty_marker(&self) -> bool {
        matches!(self, Self::EmptyMarker)
    }

    /// The value, if this slot holds one
    pub fn into_value(self) -> Option<V> {
        match self {
            Self::Value(value) => Some(value),
            Self::EmptyMarker | Self::Counter(_) => None,
        }
    }
}

/// Lifetime requested for a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiration {
    /// Use the store's configured default lifetime
    #[default]
    Default,
    /// Never expire
    Never,
    /// Expire after the given duration
    After(Duration),
}

impl Expiration {
    /// Map an optional caller TTL; `None` and zero both mean "store default"
    pub fn from_ttl(ttl: Option<Duration>) -> Self {
        match ttl {
            Some(ttl) if !ttl.is_zero() => Self::After(ttl),
            _ => Self::Default,
        }
    }
}

impl From<Duration> for Expiration {
    fn from(ttl: Duration) -> Self {
        Self::from_ttl(Some(ttl))
    }
}

/// Narrow store contract consumed by [`Group`](crate::coalesce::Group)
///
/// Implementations own their concurrency control; every method may be
/// called from many tasks at once and must not block on I/O for long.
pub trait TtlStore<V>: Send + Sync + 'static {
    /// Live slot for `key`; expired entries read as `None`
    fn get(&self, key: &str) -> Option<CacheSlot<V>>;

    /// Write `slot` under `key`, replacing whatever was there
    fn set(&self, key: &str, slot: CacheSlot<V>, expiration: Expiration);

    /// Drop `key`; returns whether a live entry was removed
    fn remove(&self, key: &str) -> bool;

    /// Atomically add `delta` to the counter at `key`
    ///
    /// A missing, expired, or non-counter entry is replaced by a counter
    /// initialized to `delta` with `ttl_on_init`. An existing counter keeps
    /// its deadline. Arithmetic wraps on overflow.
    fn increment_or_init(&self, key: &str, delta: u32, ttl_on_init: Expiration) -> u32;
}
