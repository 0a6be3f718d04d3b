//! Fault reporting seam for the task launcher

use tracing::{error, warn};

use crate::error::LaunchError;

/// A panic caught while a launched task was running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFault {
    /// Launcher-assigned id of the task that panicked
    pub task_id: u64,
    /// Panic payload rendered as text
    pub diagnostic: String,
}

/// Receives faults and rejections from a [`TaskLauncher`](super::TaskLauncher)
///
/// Called on the runtime worker that ran the task, so implementations must
/// be cheap and must not block.
pub trait FaultObserver: Send + Sync + 'static {
    /// A launched task panicked
    fn on_fault(&self, fault: &TaskFault);

    /// A fire-and-forget submission was refused and the task did not run
    fn on_rejected(&self, error: &LaunchError);
}

/// Default observer: logs faults at error level, rejections at warn level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingFaultObserver;

impl FaultObserver for TracingFaultObserver {
    fn on_fault(&self, fault: &TaskFault) {
        error!(task_id = fault.task_id, diagnostic = %fault.diagnostic, "Launched task panicked");
    }

    fn on_rejected(&self, error: &LaunchError) {
        warn!(error = %error, "Task submission rejected");
    }
}
