//! Testing utilities and helpers
//!
//! - [`RecordingObserver`]: a [`FaultObserver`] that keeps what it saw
//! - [`init_test_tracing`]: idempotent subscriber setup for tests
//!   (`test-utils` feature)
//! - [`assert_eventually_async!`](crate::assert_eventually_async): poll an
//!   async condition until it holds or a deadline passes

// Test helpers panic by design when an expectation is not met
#![allow(clippy::missing_panics_doc)]

use parking_lot::Mutex;

use crate::error::LaunchError;
use crate::launcher::{FaultObserver, TaskFault};

/// Assert that an async condition becomes true within a timeout
///
/// ```no_run
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() {
/// let flag = Arc::new(AtomicBool::new(false));
/// let setter = Arc::clone(&flag);
/// tokio::spawn(async move { setter.store(true, Ordering::SeqCst) });
///
/// proccache::assert_eventually_async!(Duration::from_secs(1), async {
///     flag.load(Ordering::SeqCst)
/// });
/// # }
/// ```
#[macro_export]
macro_rules! assert_eventually_async {
    ($timeout:expr, $fut:expr) => {{
        let timeout_duration = $timeout;
        let result = tokio::time::timeout(timeout_duration, async {
            loop {
                if $fut.await {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await;

        assert!(result.is_ok(), "Condition did not become true within {:?}", timeout_duration);
    }};
}

/// Fault observer that records every fault and rejection
#[derive(Debug, Default)]
pub struct RecordingObserver {
    faults: Mutex<Vec<TaskFault>>,
    rejections: Mutex<Vec<LaunchError>>,
}

impl RecordingObserver {
    /// Faults seen so far, in arrival order
    pub fn faults(&self) -> Vec<TaskFault> {
        self.faults.lock().clone()
    }

    /// Rejections seen so far, in arrival order
    pub fn rejections(&self) -> Vec<LaunchError> {
        self.rejections.lock().clone()
    }
}

impl FaultObserver for RecordingObserver {
    fn on_fault(&self, fault: &TaskFault) {
        self.faults.lock().push(fault.clone());
    }

    fn on_rejected(&self, error: &LaunchError) {
        self.rejections.lock().push(error.clone());
    }
}

/// Install a test-friendly `tracing` subscriber once per process
///
/// Honors `RUST_LOG` and defaults to `proccache=debug`. Output goes through
/// the test writer so it is captured per test.
#[cfg(any(test, feature = "test-utils"))]
pub fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("proccache=debug"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Validates `RecordingObserver` bookkeeping.
    ///
    /// Assertions:
    /// - Confirms faults and rejections are kept in arrival order.
    #[test]
    fn test_recording_observer() {
        init_test_tracing();
        let observer = RecordingObserver::default();

        observer.on_fault(&TaskFault { task_id: 1, diagnostic: "a".into() });
        observer.on_fault(&TaskFault { task_id: 2, diagnostic: "b".into() });
        observer.on_rejected(&LaunchError::Saturated { pool_size: 1 });

        let ids: Vec<u64> = observer.faults().iter().map(|f| f.task_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(observer.rejections(), vec![LaunchError::Saturated { pool_size: 1 }]);
    }
}
