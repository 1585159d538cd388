//! Error types used by the servisor runtime, services and tasks.
//!
//! This module defines two main error enums:
//!
//! - [`RuntimeError`]: errors raised by the runtime itself (dispatch, pool, boot).
//! - [`TaskError`]: errors raised by individual units of work (tasks, listeners, services).
//!
//! User code returns [`BoxError`]; the runtime converts it (and panics) into [`TaskError`]
//! before escalating it on the error channel. Both enums provide `as_label` for logs/metrics.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Boxed error returned by user code (tasks, listeners, services).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shared error attached to events and task handles.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Exit code recorded on a regular shutdown.
pub const EXIT_OK: i32 = 0;
/// Exit code used when the process terminates because of a fatal error.
pub const EXIT_FATAL: i32 = 1;
/// Exit code used when the runtime shuts down on memory pressure.
pub const EXIT_OOM: i32 = 127;

/// # Errors produced by the servisor runtime.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The same event instance was handed to the dispatcher twice.
    #[error("event on channel [{channel}] was already dispatched")]
    AlreadyDispatched {
        /// Channel name of the rejected event.
        channel: String,
    },

    /// The context is not attached to a live supervisor.
    #[error("context is not attached to a running supervisor")]
    Detached,

    /// The shared pool has been shut down; no new work is accepted.
    #[error("worker pool is closed")]
    PoolClosed,

    /// Waiting for lightweight tasks exceeded its timeout.
    #[error("timed out after {timeout:?} waiting for {pending} task(s)")]
    WaitTimeout {
        /// The timeout that elapsed.
        timeout: Duration,
        /// Number of tasks still running.
        pending: usize,
    },

    /// The worker pool could not be created.
    #[error("failed to bootstrap worker pool: {0}")]
    Bootstrap(#[source] std::io::Error),

    /// A configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    ConfigFile {
        /// Path of the file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file was read but could not be parsed.
    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        /// Path of the file.
        path: String,
        /// Parser error.
        #[source]
        source: BoxError,
    },

    /// Command-line arguments could not be decoded.
    #[error("invalid arguments: {0}")]
    Arguments(#[source] clap::Error),
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use servisor::RuntimeError;
    ///
    /// let err = RuntimeError::PoolClosed;
    /// assert_eq!(err.as_label(), "runtime_pool_closed");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::AlreadyDispatched { .. } => "runtime_already_dispatched",
            RuntimeError::Detached => "runtime_detached",
            RuntimeError::PoolClosed => "runtime_pool_closed",
            RuntimeError::WaitTimeout { .. } => "runtime_wait_timeout",
            RuntimeError::Bootstrap(_) => "runtime_bootstrap",
            RuntimeError::ConfigFile { .. } => "runtime_config_file",
            RuntimeError::ConfigParse { .. } => "runtime_config_parse",
            RuntimeError::Arguments(_) => "runtime_arguments",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            RuntimeError::AlreadyDispatched { channel } => {
                format!("re-dispatch rejected; channel={channel}")
            }
            RuntimeError::WaitTimeout { timeout, pending } => {
                format!("wait timeout after {timeout:?}; pending={pending}")
            }
            other => other.to_string(),
        }
    }
}

/// # Errors produced by a unit of work.
///
/// Tasks, listeners and services return [`BoxError`]; the runtime wraps what it
/// catches into one of these variants before escalating.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TaskError {
    /// The unit returned an error.
    #[error("execution failed: {error}")]
    Fail {
        /// The underlying error.
        #[source]
        error: BoxError,
    },

    /// The unit panicked.
    #[error("panicked: {info}")]
    Panicked {
        /// Panic message, if it was a string.
        info: String,
    },

    /// Unrecoverable condition; the process must terminate.
    #[error("fatal error (no recovery): {error}")]
    Fatal {
        /// The underlying error message.
        error: String,
    },

    /// The unit was cancelled before it could run.
    #[error("cancelled")]
    Canceled,
}

impl TaskError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use servisor::TaskError;
    ///
    /// let err = TaskError::Panicked { info: "boom".into() };
    /// assert_eq!(err.as_label(), "task_panicked");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Fail { .. } => "task_failed",
            TaskError::Panicked { .. } => "task_panicked",
            TaskError::Fatal { .. } => "task_fatal",
            TaskError::Canceled => "task_canceled",
        }
    }

    /// True if the process cannot safely continue after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            TaskError::Fatal { .. } => true,
            TaskError::Fail { error } => error.downcast_ref::<Fatal>().is_some(),
            _ => false,
        }
    }

    /// Wraps an error returned by user code.
    ///
    /// A boxed `TaskError` is unwrapped instead of nested.
    pub fn from_box(error: BoxError) -> Self {
        match error.downcast::<TaskError>() {
            Ok(task) => *task,
            Err(error) => TaskError::Fail { error },
        }
    }

    /// True if a shared error carries a fatal condition.
    pub fn is_fatal_shared(error: &SharedError) -> bool {
        if let Some(task) = error.downcast_ref::<TaskError>() {
            return task.is_fatal();
        }
        error.downcast_ref::<Fatal>().is_some()
    }

    /// Converts a caught panic payload.
    ///
    /// A panic carrying a [`Fatal`] value becomes [`TaskError::Fatal`].
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        if let Some(fatal) = payload.downcast_ref::<Fatal>() {
            return TaskError::Fatal {
                error: fatal.0.clone(),
            };
        }
        TaskError::Panicked {
            info: panic_message(payload.as_ref()),
        }
    }
}

/// Marker error for unrecoverable conditions.
///
/// Returned (boxed) from user code or used as a panic payload, it makes the
/// runtime log the failure and terminate the process with [`EXIT_FATAL`].
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct Fatal(pub String);

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs `f`, converting both `Err` and panics into [`TaskError`].
pub(crate) fn guarded<R>(f: impl FnOnce() -> Result<R, BoxError>) -> Result<R, TaskError> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(TaskError::from_box(error)),
        Err(payload) => Err(TaskError::from_panic(payload)),
    }
}
