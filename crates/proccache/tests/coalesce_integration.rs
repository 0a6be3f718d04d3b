//! Integration tests for the coalescing group
//!
//! Covers single-flight loading under concurrency, positive and negative
//! caching with a controlled clock, and how loader failures reach every
//! caller of a round.

#![cfg(feature = "runtime")]

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use proccache::testing::RecordingObserver;
use proccache::{
    assert_eventually_async, CacheError, CacheSlot, Expiration, Group, LaunchError,
    LauncherConfig, MemoryTtlStore, MockClock, ProcCacheConfig, StoreConfig, TaskLauncher,
    TtlStore, EMPTY_MARK_TTL,
};
use tokio::sync::{Notify, Semaphore};

type MockGroup = Group<String, MemoryTtlStore<String, MockClock>>;

fn mock_group(pool_size: usize) -> (Arc<MockGroup>, MockClock) {
    let clock = MockClock::new();
    let store = Arc::new(MemoryTtlStore::with_clock(
        StoreConfig::passive(Duration::from_secs(300)),
        clock.clone(),
    ));
    let launcher = TaskLauncher::new(LauncherConfig::new(pool_size)).unwrap();
    (Arc::new(Group::new(store, launcher, Duration::from_secs(3))), clock)
}

type LoadFuture = Pin<Box<dyn Future<Output = Result<Option<String>, io::Error>> + Send>>;

fn counting_loader(
    calls: &Arc<AtomicUsize>,
    value: Option<&'static str>,
) -> impl FnOnce() -> LoadFuture + Send + 'static {
    let calls = Arc::clone(calls);
    move || -> LoadFuture {
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, io::Error>(value.map(str::to_string))
        })
    }
}

/// Verifies that concurrent callers for one key share a single loader run.
///
/// # Test Steps
/// 1. Start 64 tasks calling `get` for the same key with a gated loader
/// 2. Release the loader once 63 callers are waiting on the round
/// 3. Verify every caller saw the value and the loader ran exactly once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_load() {
    let (group, _) = mock_group(16);
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());

    let mut handles = Vec::new();
    for _ in 0..64 {
        let group = Arc::clone(&group);
        let calls = Arc::clone(&calls);
        let gate = Arc::clone(&gate);
        handles.push(tokio::spawn(async move {
            group
                .get(
                    "hot-key",
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok::<_, io::Error>(Some("payload".to_string()))
                    },
                    None,
                )
                .await
        }));
    }

    assert_eventually_async!(Duration::from_secs(5), async {
        group.stats().coalesced_calls == 63
    });
    gate.notify_one();

    for handle in handles {
        assert_eq!(handle.await.unwrap().as_deref(), Some("payload"));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = group.stats();
    assert_eq!(stats.total_calls, 64);
    assert_eq!(stats.loads, 1);
    assert_eq!(stats.coalesced_calls, 63);
    assert_eq!(group.in_flight_count(), 0);
}

/// Verifies positive caching and expiry for the "user:42" scenario.
///
/// # Test Steps
/// 1. Load "Alice" with a 2s TTL
/// 2. Read again immediately and verify the loader did not run
/// 3. Advance the clock 2.5s and verify a new loader supplies "Bob"
#[tokio::test]
async fn test_user_42_positive_caching() {
    let (group, clock) = mock_group(4);
    let calls = Arc::new(AtomicUsize::new(0));
    let ttl = Some(Duration::from_secs(2));

    let first = group.get("user:42", counting_loader(&calls, Some("Alice")), ttl).await;
    assert_eq!(first.as_deref(), Some("Alice"));

    let second = group.get("user:42", counting_loader(&calls, Some("Alice")), ttl).await;
    assert_eq!(second.as_deref(), Some("Alice"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance(Duration::from_millis(2500));

    let third = group.get("user:42", counting_loader(&calls, Some("Bob")), ttl).await;
    assert_eq!(third.as_deref(), Some("Bob"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// Verifies negative caching for the "missing:1" scenario.
///
/// # Test Steps
/// 1. Load with a loader that finds nothing
/// 2. Within the empty-mark lifetime, verify a loader that would find data
///    is not consulted
/// 3. After the empty mark expires, verify the new data is returned
#[tokio::test]
async fn test_missing_1_negative_caching() {
    let (group, clock) = mock_group(4);
    let calls = Arc::new(AtomicUsize::new(0));

    let first = group.get("missing:1", counting_loader(&calls, None), None).await;
    assert_eq!(first, None);
    assert_eq!(group.store().get("missing:1"), Some(CacheSlot::EmptyMarker));

    clock.advance(Duration::from_secs(4));
    let second = group.get("missing:1", counting_loader(&calls, Some("found")), None).await;
    assert_eq!(second, None);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance(EMPTY_MARK_TTL);
    let third = group.get("missing:1", counting_loader(&calls, Some("found")), None).await;
    assert_eq!(third.as_deref(), Some("found"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let stats = group.stats();
    assert_eq!(stats.empty_hits, 1);
    assert_eq!(stats.loads, 2);
}

/// Verifies that an explicitly set value wins over a failing loader.
///
/// # Test Steps
/// 1. `set` a value
/// 2. `get` with a loader that always errors
/// 3. Verify the stored value is returned
#[tokio::test]
async fn test_set_then_get_with_failing_loader() {
    let (group, _) = mock_group(4);
    group.set("config:theme", "dark".to_string(), None);

    let value = group
        .get(
            "config:theme",
            || async { Err::<Option<String>, _>(io::Error::other("backend unavailable")) },
            None,
        )
        .await;

    assert_eq!(value.as_deref(), Some("dark"));
    assert_eq!(group.stats().loads, 0);
}

/// Verifies that a loader error reaches every caller of the round and is
/// not cached.
///
/// # Test Steps
/// 1. Start several callers against a gated failing loader
/// 2. Release it once the followers are waiting; verify each caller gets
///    `CacheError::Loader` and the loader ran once
/// 3. Verify the next call runs the loader again
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_loader_error_fans_out_and_is_not_cached() {
    let (group, _) = mock_group(8);
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let group = Arc::clone(&group);
        let calls = Arc::clone(&calls);
        let gate = Arc::clone(&gate);
        handles.push(tokio::spawn(async move {
            group
                .execute(
                    "flaky",
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Err::<Option<String>, _>(io::Error::other("db down"))
                    },
                    None,
                )
                .await
        }));
    }

    assert_eventually_async!(Duration::from_secs(5), async {
        group.stats().coalesced_calls == 7
    });
    gate.notify_one();

    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, CacheError::Loader { ref key, .. } if key == "flaky"));
        assert!(err.to_string().contains("db down"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(group.store().get("flaky"), None);

    let retry = group.get("flaky", counting_loader(&calls, Some("recovered")), None).await;
    assert_eq!(retry.as_deref(), Some("recovered"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

fn explode() -> Result<Option<String>, io::Error> {
    panic!("loader exploded")
}

/// Verifies that a panicking loader is contained and reported to callers.
///
/// # Test Steps
/// 1. Run a loader that panics
/// 2. Verify the caller gets `CacheError::LoaderFaulted`
/// 3. Verify the group keeps serving later calls
#[tokio::test(flavor = "multi_thread")]
async fn test_panicking_loader_is_contained() {
    let (group, _) = mock_group(2);

    let err = group.execute("boom", || async { explode() }, None).await.unwrap_err();
    assert!(matches!(err, CacheError::LoaderFaulted { ref diagnostic, .. } if diagnostic == "loader exploded"));
    assert_eq!(group.launcher().metrics().faulted, 1);

    let calls = Arc::new(AtomicUsize::new(0));
    let value = group.get("boom", counting_loader(&calls, Some("fine")), None).await;
    assert_eq!(value.as_deref(), Some("fine"));
}

/// Verifies the loader deadline for concurrent callers.
///
/// # Test Steps
/// 1. Build a group with a 50ms loader timeout
/// 2. Call `execute` from several tasks with a loader that never finishes in
///    time
/// 3. Verify every caller gets `Ok(None)` and an empty marker is stored
#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_is_treated_as_absent() {
    let clock = MockClock::new();
    let store = Arc::new(MemoryTtlStore::with_clock(StoreConfig::default(), clock));
    let launcher = TaskLauncher::new(LauncherConfig::new(4)).unwrap();
    let group: Arc<MockGroup> = Arc::new(Group::new(store, launcher, Duration::from_millis(50)));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let group = Arc::clone(&group);
        handles.push(tokio::spawn(async move {
            group
                .execute(
                    "slow",
                    || async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok::<_, io::Error>(Some("too late".to_string()))
                    },
                    None,
                )
                .await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), None);
    }
    assert_eq!(group.stats().timeouts, 1);
    assert_eq!(group.store().get("slow"), Some(CacheSlot::EmptyMarker));
}

/// Verifies that a loader finishing after its deadline never reaches the
/// store.
///
/// # Test Steps
/// 1. Run a loader that completes shortly after a 30ms deadline
/// 2. Wait until the loader task has actually finished
/// 3. Verify the empty marker is still stored and later calls see no value
#[tokio::test(flavor = "multi_thread")]
async fn test_late_loader_result_is_discarded() {
    let clock = MockClock::new();
    let store = Arc::new(MemoryTtlStore::with_clock(StoreConfig::default(), clock));
    let launcher = TaskLauncher::new(LauncherConfig::new(2)).unwrap();
    let group: MockGroup = Group::new(store, launcher, Duration::from_millis(30));
    let finished = Arc::new(AtomicBool::new(false));

    let done = Arc::clone(&finished);
    let value = group
        .execute(
            "report:slow",
            move || async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                done.store(true, Ordering::SeqCst);
                Ok::<_, io::Error>(Some("late".to_string()))
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(value, None);

    assert_eventually_async!(Duration::from_secs(5), async {
        finished.load(Ordering::SeqCst) && group.launcher().metrics().completed == 1
    });

    assert_eq!(group.store().get("report:slow"), Some(CacheSlot::EmptyMarker));
    let calls = Arc::new(AtomicUsize::new(0));
    let again = group.get("report:slow", counting_loader(&calls, Some("fresh")), None).await;
    assert_eq!(again, None);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(group.stats().timeouts, 1);
}

/// In-memory store whose first read blocks until the test opens its gate
struct GatedStore {
    inner: MemoryTtlStore<String>,
    gate: Mutex<Option<mpsc::Receiver<()>>>,
}

impl GatedStore {
    fn new(gate: mpsc::Receiver<()>) -> Self {
        Self { inner: MemoryTtlStore::new(StoreConfig::default()), gate: Mutex::new(Some(gate)) }
    }
}

impl TtlStore<String> for GatedStore {
    fn get(&self, key: &str) -> Option<CacheSlot<String>> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.recv_timeout(Duration::from_secs(5));
        }
        self.inner.get(key)
    }

    fn set(&self, key: &str, slot: CacheSlot<String>, expiration: Expiration) {
        self.inner.set(key, slot, expiration);
    }

    fn remove(&self, key: &str) -> bool {
        self.inner.remove(key)
    }

    fn increment_or_init(&self, key: &str, delta: u32, ttl_on_init: Expiration) -> u32 {
        self.inner.increment_or_init(key, delta, ttl_on_init)
    }
}

/// Verifies a round whose loader cannot be launched.
///
/// # Test Steps
/// 1. Occupy the only slot of the group's launcher
/// 2. Hold the leader in its store read until three followers have joined
/// 3. Verify every caller gets `CacheError::Launch`, nothing is stored, the
///    key leaves the in-flight map, and the observer saw one rejection
/// 4. Free the slot and verify the key loads normally
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_saturated_launcher_fails_whole_round() {
    let observer = Arc::new(RecordingObserver::default());
    let launcher = TaskLauncher::with_observer(LauncherConfig::new(1), observer.clone()).unwrap();
    let (open_gate, gate) = mpsc::channel();
    let group: Arc<Group<String, GatedStore>> = Arc::new(Group::new(
        Arc::new(GatedStore::new(gate)),
        launcher.clone(),
        Duration::from_secs(3),
    ));

    let release = Arc::new(Semaphore::new(0));
    let busy = {
        let release = Arc::clone(&release);
        launcher
            .launch(async move {
                let _ = release.acquire().await;
            })
            .unwrap()
    };

    let calls = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let group = Arc::clone(&group);
        let loader = counting_loader(&calls, Some("never"));
        handles.push(tokio::spawn(async move { group.execute("report:7", loader, None).await }));
    }

    assert_eventually_async!(Duration::from_secs(5), async {
        group.stats().coalesced_calls == 3
    });
    open_gate.send(()).unwrap();

    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, CacheError::Launch(LaunchError::Saturated { pool_size: 1 })));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(group.in_flight_count(), 0);
    assert_eq!(group.store().get("report:7"), None);
    assert_eq!(observer.rejections(), vec![LaunchError::Saturated { pool_size: 1 }]);

    release.add_permits(1);
    busy.outcome().await;
    let value = group.get("report:7", counting_loader(&calls, Some("ready")), None).await;
    assert_eq!(value.as_deref(), Some("ready"));
}

/// Verifies counter semantics through the group.
///
/// # Test Steps
/// 1. Increment a fresh key, then increment again
/// 2. Advance past the counter lifetime and increment once more
#[tokio::test]
async fn test_increment_u32() {
    let (group, clock) = mock_group(2);
    let ttl = Some(Duration::from_secs(60));

    assert_eq!(group.increment_u32("rate:10.0.0.1", 1, ttl), 1);
    assert_eq!(group.increment_u32("rate:10.0.0.1", 1, ttl), 2);
    assert_eq!(group.increment_u32("rate:10.0.0.1", 10, ttl), 12);

    clock.advance(Duration::from_secs(61));
    assert_eq!(group.increment_u32("rate:10.0.0.1", 1, ttl), 1);
}

/// Verifies `Group::initialize` from a configuration.
///
/// # Test Steps
/// 1. Initialize with a pool size and a short janitor interval
/// 2. Load a value and read it back
/// 3. Verify an invalid configuration is rejected
#[tokio::test(flavor = "multi_thread")]
async fn test_initialize_from_config() {
    let config = ProcCacheConfig::with_pool_size(8).store(
        StoreConfig::builder()
            .default_ttl(Duration::from_secs(60))
            .cleanup_interval(Duration::from_millis(100))
            .build(),
    );
    let group: Group<u64> = Group::initialize(&config).unwrap();

    let value = group.get("answer", || async { Ok::<_, io::Error>(Some(42)) }, None).await;
    assert_eq!(value, Some(42));
    assert_eq!(group.launcher().pool_size(), 8);
    assert_eq!(group.loader_timeout(), proccache::DEFAULT_LOADER_TIMEOUT);

    let err = Group::<u64>::initialize(&ProcCacheConfig::with_pool_size(0)).unwrap_err();
    assert!(matches!(err, CacheError::Config { .. }));
}
