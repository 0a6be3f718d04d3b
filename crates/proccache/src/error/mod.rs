//! Error types for the coalescing cache and its task launcher
//!
//! # Error Handling Architecture
//!
//! 1. **[`CacheError`]**: everything a coalesced call can fail with. It is
//!    `Clone` because one leader's outcome is handed to every follower of the
//!    same round; loader errors are therefore held behind an `Arc`.
//!
//! 2. **[`LaunchError`]**: submission failures of the bounded task launcher
//!    (saturated, closed, misconfigured).
//!
//! 3. **[`ParallelError`]**: the single representative failure reported by
//!    [`TaskLauncher::run_all`](crate::launcher::TaskLauncher::run_all).
//!
//! 4. **[`ErrorClassification`]**: retryability and severity, so callers can
//!    decide whether to try the next round or page someone.
//!
//! ## What is never cached
//!
//! | Outcome | Variant | Cached? |
//! |---------|---------|---------|
//! | Loader returned `Err` | `Loader` | no |
//! | Loader panicked | `LoaderFaulted` | no |
//! | Submission rejected | `Launch` | no |
//! | Leader dropped mid-round | `Abandoned` | no |
//! | Loader returned `Ok(None)` | not an error | empty marker |
//! | Loader timed out | not an error | empty marker |

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Boxed error accepted from loaders and converted into [`CacheError::Loader`]
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Standard result type using [`CacheError`]
pub type CacheResult<T> = Result<T, CacheError>;

/// Failures surfaced by [`Group`](crate::coalesce::Group) operations
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Invalid or missing configuration
    #[error("configuration error{}: {message}", field_suffix(.field))]
    Config { message: String, field: Option<String> },

    /// The loader ran and returned an error; shared verbatim with every waiter
    #[error("loader for key '{key}' failed: {source}")]
    Loader { key: String, source: Arc<dyn std::error::Error + Send + Sync> },

    /// The loader panicked before producing a result
    #[error("loader for key '{key}' panicked: {diagnostic}")]
    LoaderFaulted { key: String, diagnostic: String },

    /// The leader of the round went away before publishing a result
    #[error("in-flight call for key '{key}' was abandoned before completion")]
    Abandoned { key: String },

    /// The key holds a slot of a different kind (e.g. a counter)
    #[error("key '{key}' holds a {found} entry, not a cached value")]
    TypeMismatch { key: String, found: &'static str },

    /// The loader could not be submitted to the launcher
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl CacheError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into(), field: None }
    }

    /// Create a configuration error attributed to a field
    pub fn config_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config { message: message.into(), field: Some(field.into()) }
    }

    /// Wrap a loader error for fan-out
    pub fn loader(key: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Loader { key: key.into(), source: Arc::from(source.into()) }
    }

    /// Key the failure is attributed to, if any
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Loader { key, .. }
            | Self::LoaderFaulted { key, .. }
            | Self::Abandoned { key }
            | Self::TypeMismatch { key, .. } => Some(key),
            Self::Config { .. } | Self::Launch(_) => None,
        }
    }
}

fn field_suffix(field: &Option<String>) -> String {
    field.as_ref().map(|f| format!(" in field '{f}'")).unwrap_or_default()
}

/// Submission failures of the bounded task launcher
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    /// A pool needs at least one execution slot
    #[error("pool size must be greater than 0")]
    InvalidPoolSize,

    /// The launcher was created outside a tokio runtime
    #[error("no tokio runtime available to launch tasks on")]
    NoRuntime,

    /// Every execution slot is busy; the task was not started
    #[error("task pool saturated ({pool_size} slots busy)")]
    Saturated { pool_size: usize },

    /// The launcher no longer accepts work
    #[error("task launcher is closed")]
    Closed,
}

/// Representative failure of a parallel run
///
/// When several tasks fail, which one is reported depends on completion
/// order and is intentionally unspecified.
#[derive(Debug, Error)]
pub enum ParallelError<E> {
    /// A task returned an error
    #[error("parallel task failed: {0}")]
    Task(E),

    /// A task panicked and produced no result
    #[error("parallel task {task_id} faulted: {diagnostic}")]
    Faulted { task_id: u64, diagnostic: String },

    /// A task could not be submitted
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl<E> ParallelError<E> {
    /// Task error, if this failure came from a task's own `Err`
    pub fn into_task_error(self) -> Option<E> {
        match self {
            Self::Task(err) => Some(err),
            Self::Faulted { .. } | Self::Launch(_) => None,
        }
    }
}

/// Classifies errors for retry and alerting decisions
pub trait ErrorClassification {
    /// Whether the same call may succeed in a later round
    fn is_retryable(&self) -> bool;

    /// Severity level for logging and alerting
    fn severity(&self) -> ErrorSeverity;

    /// Whether this error points at a bug or a broken invariant
    fn is_critical(&self) -> bool {
        self.severity() == ErrorSeverity::Critical
    }
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational, typically for debugging
    Info,
    /// Warning, should be monitored but not critical
    Warning,
    /// Error, requires attention and action
    Error,
    /// Critical, immediate action required
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl ErrorClassification for LaunchError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Saturated { .. })
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Saturated { .. } => ErrorSeverity::Warning,
            Self::Closed => ErrorSeverity::Info,
            Self::InvalidPoolSize | Self::NoRuntime => ErrorSeverity::Error,
        }
    }
}

impl ErrorClassification for CacheError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Loader { .. } | Self::Abandoned { .. } => true,
            Self::Launch(err) => err.is_retryable(),
            Self::Config { .. } | Self::LoaderFaulted { .. } | Self::TypeMismatch { .. } => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Config { .. } | Self::Loader { .. } | Self::TypeMismatch { .. } => {
                ErrorSeverity::Error
            }
            Self::LoaderFaulted { .. } => ErrorSeverity::Critical,
            Self::Abandoned { .. } => ErrorSeverity::Warning,
            Self::Launch(err) => err.severity(),
        }
    }
}
