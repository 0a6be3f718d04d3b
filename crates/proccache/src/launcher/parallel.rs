//! Parallel error aggregation over the launcher

use std::future::Future;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::debug;

use super::{LaunchHandle, TaskLauncher, TaskOutcome};
use crate::error::ParallelError;

impl TaskLauncher {
    /// Run independent tasks concurrently and report the first failure
    ///
    /// Returns as soon as any task returns `Err` or panics, or with `Ok(())`
    /// once every task has succeeded. When several tasks fail, which one is
    /// reported depends on completion order.
    ///
    /// Tasks are never cancelled. After an early return the remaining
    /// outcomes are drained on the runtime in the background.
    ///
    /// Each task takes one pool slot. If a slot cannot be had, the tasks
    /// already started are handed to the drain, the rest are dropped
    /// unstarted, and [`ParallelError::Launch`] is returned.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    /// use std::sync::Arc;
    ///
    /// use proccache::{LauncherConfig, TaskLauncher};
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let launcher = TaskLauncher::new(LauncherConfig::new(8)).unwrap();
    /// let counter = Arc::new(AtomicUsize::new(0));
    ///
    /// let tasks = (0..5).map(|_| {
    ///     let counter = Arc::clone(&counter);
    ///     async move {
    ///         counter.fetch_add(1, Ordering::SeqCst);
    ///         Ok::<(), std::io::Error>(())
    ///     }
    /// });
    ///
    /// launcher.run_all(tasks).await.unwrap();
    /// assert_eq!(counter.load(Ordering::SeqCst), 5);
    /// # }
    /// ```
    pub async fn run_all<I, F, E>(&self, tasks: I) -> Result<(), ParallelError<E>>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Send + 'static,
    {
        let mut pending = FuturesUnordered::new();

        for task in tasks {
            match self.launch(task) {
                Ok(handle) => pending.push(LaunchHandle::outcome(handle)),
                Err(err) => {
                    self.drain(pending);
                    return Err(ParallelError::Launch(err));
                }
            }
        }

        let total = pending.len();
        while let Some(outcome) = pending.next().await {
            let failure = match outcome {
                TaskOutcome::Completed(Ok(())) => continue,
                TaskOutcome::Completed(Err(err)) => ParallelError::Task(err),
                TaskOutcome::Faulted { task_id, diagnostic } => {
                    ParallelError::Faulted { task_id, diagnostic }
                }
                // Aborts only happen on runtime shutdown; nothing to report
                TaskOutcome::Cancelled => continue,
            };
            debug!(total, remaining = pending.len(), "Parallel run failed early");
            self.drain(pending);
            return Err(failure);
        }

        Ok(())
    }

    fn drain<Fut, E>(&self, pending: FuturesUnordered<Fut>)
    where
        Fut: Future<Output = TaskOutcome<Result<(), E>>> + Send + 'static,
        E: Send + 'static,
    {
        if pending.is_empty() {
            return;
        }

        // Runs on the runtime directly so a saturated pool cannot starve it
        self.runtime().spawn(async move {
            let drained = pending.len();
            let failed = pending
                .filter(|outcome| {
                    futures::future::ready(!matches!(outcome, TaskOutcome::Completed(Ok(()))))
                })
                .count()
                .await;
            debug!(drained, failed, "Drained remaining parallel tasks");
        });
    }
}
