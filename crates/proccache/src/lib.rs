//! In-process call-coalescing cache.
//!
//! `proccache` shields a slow backing source (a database query, a remote
//! call) from cache penetration and thundering herds:
//!
//! - concurrent callers for the same key share a single loader execution
//!   ([`coalesce::Group`]);
//! - positive results and confirmed-empty results are kept in a TTL store
//!   ([`store::MemoryTtlStore`]);
//! - every loader runs on a bounded, panic-isolated launcher
//!   ([`launcher::TaskLauncher`]) under a deadline.
//!
//! # Feature Tiers
//!
//! - `foundation`: errors, clock, configuration types
//! - `runtime` (default): store, launcher, coalescer
//! - `test-utils`: tracing bootstrap for tests
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use proccache::{Group, ProcCacheConfig};
//!
//! # async fn example() -> Result<(), proccache::CacheError> {
//! let config = ProcCacheConfig::with_pool_size(64);
//! let group: Group<String> = Group::initialize(&config)?;
//!
//! let name = group
//!     .get(
//!         "user:42",
//!         || async { Ok::<_, std::io::Error>(Some("Alice".to_string())) },
//!         Some(Duration::from_secs(60)),
//!     )
//!     .await;
//! assert_eq!(name.as_deref(), Some("Alice"));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Foundation tier
// -----------------------------------------------------------------
#[cfg(feature = "foundation")]
pub mod config;
#[cfg(feature = "foundation")]
pub mod error;
#[cfg(feature = "foundation")]
pub mod time;
#[cfg(feature = "foundation")]
pub mod utils;

// Runtime tier
// --------------------------------------------------------------------
#[cfg(feature = "runtime")]
pub mod coalesce;
#[cfg(feature = "runtime")]
pub mod launcher;
#[cfg(feature = "runtime")]
pub mod store;

// Testing utilities
// ---------------------------------------------------------------
#[cfg(feature = "runtime")]
pub mod testing;

// Re-export commonly used types and traits for convenience
// ------------------------
#[cfg(feature = "runtime")]
pub use coalesce::{CoalescerStats, Group, EMPTY_MARK_TTL};
#[cfg(feature = "foundation")]
pub use config::{ProcCacheConfig, StoreConfig, DEFAULT_LOADER_TIMEOUT};
#[cfg(feature = "foundation")]
pub use error::{
    BoxError, CacheError, CacheResult, ErrorClassification, ErrorSeverity, LaunchError,
    ParallelError,
};
#[cfg(feature = "runtime")]
pub use launcher::{
    FaultObserver, LaunchHandle, LauncherConfig, LauncherMetrics, TaskFault, TaskLauncher,
    TaskOutcome, TracingFaultObserver,
};
#[cfg(feature = "runtime")]
pub use store::{CacheSlot, Expiration, Janitor, MemoryTtlStore, StoreStats, TtlStore};
#[cfg(feature = "foundation")]
pub use time::{Clock, MockClock, SystemClock};
#[cfg(feature = "foundation")]
pub use utils::serde::duration_millis;
