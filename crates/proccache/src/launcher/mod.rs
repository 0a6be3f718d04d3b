//! Panic-isolated task launcher on a bounded pool
//!
//! Every unit of asynchronous work in the crate (loader invocations,
//! fire-and-forget jobs, parallel batches) goes through a [`TaskLauncher`].
//! The launcher:
//!
//! - caps concurrency with a semaphore and never makes the submitter wait:
//!   when every slot is busy the submission is refused with
//!   [`LaunchError::Saturated`];
//! - runs each task under `catch_unwind`, so a panic becomes a
//!   [`TaskOutcome::Faulted`] reported to the [`FaultObserver`] instead of
//!   tearing down the worker.
//!
//! # Example
//!
//! ```
//! use proccache::{LauncherConfig, TaskLauncher, TaskOutcome};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), proccache::LaunchError> {
//! let launcher = TaskLauncher::new(LauncherConfig::new(4))?;
//!
//! let handle = launcher.launch(async { 21 * 2 })?;
//! assert_eq!(handle.outcome().await, TaskOutcome::Completed(42));
//!
//! let handle = launcher.launch::<_, ()>(async { panic!("boom") })?;
//! assert!(handle.outcome().await.is_faulted());
//! # Ok(())
//! # }
//! ```

mod observer;
mod parallel;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::debug;

pub use observer::{FaultObserver, TaskFault, TracingFaultObserver};

use crate::error::LaunchError;

/// Configuration for a [`TaskLauncher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherConfig {
    /// Maximum number of tasks running at once
    pub pool_size: usize,
}

impl LauncherConfig {
    /// Configuration with `pool_size` execution slots
    pub fn new(pool_size: usize) -> Self {
        Self { pool_size }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), LaunchError> {
        if self.pool_size == 0 {
            return Err(LaunchError::InvalidPoolSize);
        }
        Ok(())
    }
}

/// Final state of a launched task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome<T> {
    /// The task ran to completion
    Completed(T),
    /// The task panicked; the panic was contained
    Faulted { task_id: u64, diagnostic: String },
    /// The task was aborted or its runtime shut down before it finished
    Cancelled,
}

impl<T> TaskOutcome<T> {
    /// The task's output, if it completed
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Faulted { .. } | Self::Cancelled => None,
        }
    }

    /// Whether the task panicked
    pub fn is_faulted(&self) -> bool {
        matches!(self, Self::Faulted { .. })
    }
}

/// Handle to a task started by [`TaskLauncher::launch`]
///
/// Dropping the handle detaches the task; it keeps running.
#[derive(Debug)]
pub struct LaunchHandle<T> {
    task_id: u64,
    join: JoinHandle<TaskOutcome<T>>,
}

impl<T> LaunchHandle<T> {
    /// Launcher-assigned id of the task
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    /// Abort the task; its outcome becomes [`TaskOutcome::Cancelled`]
    pub fn abort(&self) {
        self.join.abort();
    }

    /// Wait for the task to finish
    pub async fn outcome(self) -> TaskOutcome<T> {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => TaskOutcome::Faulted {
                task_id: self.task_id,
                diagnostic: panic_message(err.into_panic().as_ref()),
            },
            Err(_) => TaskOutcome::Cancelled,
        }
    }
}

/// Point-in-time launcher counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LauncherMetrics {
    /// Tasks accepted for execution
    pub launched: u64,
    /// Tasks that ran to completion
    pub completed: u64,
    /// Tasks that panicked
    pub faulted: u64,
    /// Submissions refused (saturated or closed)
    pub rejected: u64,
    /// Tasks currently holding a slot
    pub active: usize,
    /// Total execution slots
    pub pool_size: usize,
}

impl LauncherMetrics {
    /// Fraction of slots in use (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.pool_size == 0 {
            return 0.0;
        }
        self.active as f64 / self.pool_size as f64
    }

    /// Check if every slot is busy
    pub fn is_at_capacity(&self) -> bool {
        self.active >= self.pool_size
    }
}

#[derive(Debug, Default)]
struct Counters {
    launched: AtomicU64,
    completed: AtomicU64,
    faulted: AtomicU64,
    rejected: AtomicU64,
}

struct LauncherInner {
    config: LauncherConfig,
    permits: Arc<Semaphore>,
    runtime: Handle,
    observer: Arc<dyn FaultObserver>,
    counters: Counters,
    next_task_id: AtomicU64,
}

/// Bounded, panic-isolated task launcher
///
/// Cheap to clone; clones share the pool, the observer, and the counters.
#[derive(Clone)]
pub struct TaskLauncher {
    inner: Arc<LauncherInner>,
}

impl std::fmt::Debug for TaskLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLauncher")
            .field("pool_size", &self.inner.config.pool_size)
            .field("available", &self.inner.permits.available_permits())
            .field("closed", &self.inner.permits.is_closed())
            .finish()
    }
}

impl TaskLauncher {
    /// Create a launcher that logs faults through `tracing`
    ///
    /// Must be called from within a tokio runtime; the runtime's handle is
    /// captured and every task is spawned onto it.
    pub fn new(config: LauncherConfig) -> Result<Self, LaunchError> {
        Self::with_observer(config, Arc::new(TracingFaultObserver))
    }

    /// Create a launcher reporting to a custom observer
    pub fn with_observer(
        config: LauncherConfig,
        observer: Arc<dyn FaultObserver>,
    ) -> Result<Self, LaunchError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| LaunchError::NoRuntime)?;

        debug!(pool_size = config.pool_size, "Task launcher started");
        Ok(Self {
            inner: Arc::new(LauncherInner {
                permits: Arc::new(Semaphore::new(config.pool_size)),
                runtime,
                observer,
                counters: Counters::default(),
                next_task_id: AtomicU64::new(1),
                config,
            }),
        })
    }

    /// Number of execution slots
    pub fn pool_size(&self) -> usize {
        self.inner.config.pool_size
    }

    /// Slots currently free
    pub fn available_slots(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Start `task` if a slot is free
    ///
    /// Never waits for a slot. A refused submission is counted and reported
    /// to the observer before the error is returned. The slot is released
    /// when the task finishes, panics, or is aborted.
    pub fn launch<F, T>(&self, task: F) -> Result<LaunchHandle<T>, LaunchError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = match Arc::clone(&self.inner.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(self.reject(LaunchError::Closed)),
            Err(TryAcquireError::NoPermits) => {
                return Err(self.reject(LaunchError::Saturated { pool_size: self.pool_size() }));
            }
        };

        let task_id = self.inner.next_task_id.fetch_add(1, Ordering::Relaxed);
        self.inner.counters.launched.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(&self.inner);
        let join = self.inner.runtime.spawn(async move {
            let _permit = permit;
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(value) => {
                    inner.counters.completed.fetch_add(1, Ordering::Relaxed);
                    TaskOutcome::Completed(value)
                }
                Err(payload) => {
                    inner.counters.faulted.fetch_add(1, Ordering::Relaxed);
                    let fault = TaskFault { task_id, diagnostic: panic_message(payload.as_ref()) };
                    inner.observer.on_fault(&fault);
                    TaskOutcome::Faulted { task_id, diagnostic: fault.diagnostic }
                }
            }
        });

        Ok(LaunchHandle { task_id, join })
    }

    /// Fire-and-forget launch
    ///
    /// A refused submission is reported to the observer like any other
    /// rejection and the task is dropped without running.
    pub fn go_safe<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Already counted and reported by `launch`
        let _ = self.launch(task);
    }

    /// Stop accepting new tasks; running tasks are unaffected
    pub fn close(&self) {
        self.inner.permits.close();
        debug!("Task launcher closed");
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    /// Snapshot of the launcher counters
    pub fn metrics(&self) -> LauncherMetrics {
        let counters = &self.inner.counters;
        let pool_size = self.pool_size();
        LauncherMetrics {
            launched: counters.launched.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            faulted: counters.faulted.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            active: pool_size.saturating_sub(self.available_slots()),
            pool_size,
        }
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    fn reject(&self, err: LaunchError) -> LaunchError {
        self.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
        self.inner.observer.on_rejected(&err);
        err
    }
}

/// Render a panic payload as text
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
