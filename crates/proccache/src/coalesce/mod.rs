//! Call-coalescing cache
//!
//! [`Group`] guarantees at most one loader execution per key at a time and
//! hands that execution's result to every caller that asked for the key
//! while it ran.
//!
//! # Architecture
//!
//! ```text
//! caller A ─┐                    ┌── store hit ─────────────┐
//!           │                    │                          │
//! caller B ─┼──► Group ──leader──┤                          ├──► result to A, B, C
//!           │      │             └── miss ─► launcher ─► loader (deadline)
//! caller C ─┘      │                                  │
//!                  └─ followers wait on the round ◄───┘ store value / empty marker
//! ```
//!
//! A round starts when a caller finds no call in flight for its key; that
//! caller becomes the leader. The leader consults the store, runs the
//! loader on a miss, writes the outcome back, and publishes it. Callers
//! arriving after publication start a fresh round and normally hit the
//! store.
//!
//! # Negative caching
//!
//! A loader that found nothing returns `Ok(None)`. The group then stores an
//! empty marker for [`EMPTY_MARK_TTL`], so repeated lookups of a missing key
//! do not reach the backing source. A loader that misses its deadline is
//! treated the same way. Errors and panics are never cached.

mod pending;
mod stats;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error, instrument, warn, Level};

pub use stats::CoalescerStats;

use self::pending::{Claim, InFlight};
use self::stats::StatsCollector;
use crate::config::ProcCacheConfig;
use crate::error::{BoxError, CacheError, CacheResult, ErrorClassification, ErrorSeverity};
use crate::launcher::{LauncherConfig, TaskLauncher, TaskOutcome};
use crate::store::{CacheSlot, Expiration, Janitor, MemoryTtlStore, TtlStore};

/// Lifetime of the empty marker written after a loader found nothing
pub const EMPTY_MARK_TTL: Duration = Duration::from_secs(5);

/// Call-coalescing cache over a [`TtlStore`]
///
/// # Type Parameters
/// - `V`: cached value type; cloned once per caller
/// - `S`: backing store (defaults to [`MemoryTtlStore`])
pub struct Group<V, S = MemoryTtlStore<V>> {
    in_flight: InFlight<V>,
    store: Arc<S>,
    launcher: TaskLauncher,
    loader_timeout: Duration,
    stats: StatsCollector,
    janitor: Option<Janitor>,
}

impl<V> Group<V, MemoryTtlStore<V>>
where
    V: Clone + Send + Sync + 'static,
{
    /// Build a group with an in-memory store and its own launcher
    ///
    /// Must be called from within a tokio runtime. Starts the store janitor
    /// unless `config.store.cleanup_interval` is zero.
    pub fn initialize(config: &ProcCacheConfig) -> CacheResult<Self> {
        config.validate()?;

        let launcher = TaskLauncher::new(LauncherConfig::new(config.pool_size))?;
        let store = Arc::new(MemoryTtlStore::new(config.store.clone()));
        let janitor = store.spawn_janitor();

        debug!(
            pool_size = config.pool_size,
            loader_timeout_ms = config.loader_timeout.as_millis() as u64,
            janitor = janitor.is_some(),
            "Coalescing group initialized"
        );

        let mut group = Self::new(store, launcher, config.loader_timeout);
        group.janitor = janitor;
        Ok(group)
    }
}

impl<V, S> Group<V, S>
where
    V: Clone + Send + Sync + 'static,
    S: TtlStore<V>,
{
    /// Build a group over an existing store and launcher
    pub fn new(store: Arc<S>, launcher: TaskLauncher, loader_timeout: Duration) -> Self {
        Self {
            in_flight: InFlight::new(),
            store,
            launcher,
            loader_timeout,
            stats: StatsCollector::default(),
            janitor: None,
        }
    }

    /// Tie a store janitor's lifetime to this group
    #[must_use]
    pub fn with_janitor(mut self, janitor: Janitor) -> Self {
        self.janitor = Some(janitor);
        self
    }

    /// Resolve `key` through the store or a single shared loader run
    ///
    /// Concurrent callers with the same key share one round: only the first
    /// (the leader) reads the store and, on a miss, runs `loader` on the
    /// launcher. Everyone in the round receives the leader's result.
    ///
    /// - `Ok(Some(v))`: a stored or freshly loaded value. Fresh values are
    ///   stored for `ttl` (`None` or zero means the store default).
    /// - `Ok(None)`: the key is confirmed absent, either from an empty
    ///   marker or because the loader returned `Ok(None)` or timed out.
    /// - `Err(_)`: the loader failed, panicked, or could not be launched,
    ///   or the key holds a counter. Nothing is stored.
    ///
    /// The loader keeps running after a timeout; its late result is
    /// discarded.
    pub async fn execute<F, Fut, E>(
        &self,
        key: &str,
        loader: F,
        ttl: Option<Duration>,
    ) -> CacheResult<Option<V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.stats.record_call();

        match self.in_flight.claim(key) {
            Claim::Follower(waiter) => {
                self.stats.record_coalesced();
                debug!(key, round = waiter.round(), "Joining in-flight call");
                waiter.wait().await
            }
            Claim::Leader(guard) => {
                let result = self.lead(key, guard.round(), loader, ttl).await;
                guard.publish(result.clone());
                result
            }
        }
    }

    /// Like [`execute`](Self::execute), folding every non-value outcome to
    /// `None`
    ///
    /// Failures are logged at a level following their
    /// [`ErrorSeverity`]. A loader that legitimately finds
    /// nothing should return `Ok(None)` so the absence is cached; returning
    /// an error instead sends every later call back to the loader.
    pub async fn get<F, Fut, E>(&self, key: &str, loader: F, ttl: Option<Duration>) -> Option<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        match self.execute(key, loader, ttl).await {
            Ok(value) => value,
            Err(err) => {
                log_lookup_failure(key, &err);
                None
            }
        }
    }

    /// Store `value` under `key` for `ttl` (`None` or zero means default)
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        self.store.set(key, CacheSlot::Value(value), Expiration::from_ttl(ttl));
    }

    /// Add `n` to the counter at `key`, initializing it to `n` with `ttl`
    /// when missing
    pub fn increment_u32(&self, key: &str, n: u32, ttl: Option<Duration>) -> u32 {
        self.store.increment_or_init(key, n, Expiration::from_ttl(ttl))
    }

    /// Drop the stored entry for `key`; an in-flight round is unaffected
    pub fn invalidate(&self, key: &str) -> bool {
        self.store.remove(key)
    }

    /// Backing store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Launcher running the loaders
    pub fn launcher(&self) -> &TaskLauncher {
        &self.launcher
    }

    /// Deadline applied to each loader run
    pub fn loader_timeout(&self) -> Duration {
        self.loader_timeout
    }

    /// Number of keys with a round in flight
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Coalescing statistics snapshot
    pub fn stats(&self) -> CoalescerStats {
        self.stats.snapshot(self.in_flight_count())
    }

    #[instrument(level = "debug", skip(self, loader, ttl))]
    async fn lead<F, Fut, E>(
        &self,
        key: &str,
        round: u64,
        loader: F,
        ttl: Option<Duration>,
    ) -> CacheResult<Option<V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        match self.store.get(key) {
            Some(CacheSlot::Value(value)) => {
                self.stats.record_store_hit();
                debug!("Store hit");
                return Ok(Some(value));
            }
            Some(CacheSlot::EmptyMarker) => {
                self.stats.record_empty_hit();
                debug!("Empty marker hit");
                return Ok(None);
            }
            Some(slot @ CacheSlot::Counter(_)) => {
                return Err(CacheError::TypeMismatch { key: key.to_string(), found: slot.kind() });
            }
            None => {}
        }

        self.stats.record_load();
        let loaded = self.load(key, loader).await?;

        match &loaded {
            Some(value) => {
                self.store.set(key, CacheSlot::Value(value.clone()), Expiration::from_ttl(ttl));
            }
            None => {
                self.store.set(key, CacheSlot::EmptyMarker, Expiration::After(EMPTY_MARK_TTL));
            }
        }
        debug!(found = loaded.is_some(), "Loader result stored");

        Ok(loaded)
    }

    async fn load<F, Fut, E>(&self, key: &str, loader: F) -> CacheResult<Option<V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handle = self.launcher.launch(async move {
            // The receiver is gone once the deadline passed
            let _ = tx.send(loader().await);
        })?;

        match tokio::time::timeout(self.loader_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => {
                self.stats.record_loader_error();
                Err(CacheError::loader(key, err))
            }
            Ok(Err(_)) => match handle.outcome().await {
                TaskOutcome::Faulted { diagnostic, .. } => {
                    self.stats.record_fault();
                    Err(CacheError::LoaderFaulted { key: key.to_string(), diagnostic })
                }
                TaskOutcome::Completed(()) | TaskOutcome::Cancelled => {
                    Err(CacheError::Abandoned { key: key.to_string() })
                }
            },
            Err(_) => {
                self.stats.record_timeout();
                warn!(
                    key,
                    timeout_ms = self.loader_timeout.as_millis() as u64,
                    "Loader timed out; treating key as absent"
                );
                Ok(None)
            }
        }
    }
}

/// Log level for a lookup failure swallowed by [`Group::get`]
fn lookup_failure_level(err: &CacheError) -> Level {
    match err.severity() {
        ErrorSeverity::Info => Level::DEBUG,
        ErrorSeverity::Warning => Level::WARN,
        ErrorSeverity::Error | ErrorSeverity::Critical => Level::ERROR,
    }
}

fn log_lookup_failure(key: &str, err: &CacheError) {
    let level = lookup_failure_level(err);
    let retryable = err.is_retryable();
    if level == Level::ERROR {
        error!(key, error = %err, retryable, "Cache lookup failed");
    } else if level == Level::WARN {
        warn!(key, error = %err, retryable, "Cache lookup failed");
    } else {
        debug!(key, error = %err, retryable, "Cache lookup failed");
    }
}

impl<V, S> std::fmt::Debug for Group<V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("in_flight", &self.in_flight.len())
            .field("loader_timeout", &self.loader_timeout)
            .field("launcher", &self.launcher)
            .field("janitor", &self.janitor.is_some())
            .finish()
    }
}
