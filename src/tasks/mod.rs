//! # Lightweight tasks.
//!
//! - [`TaskHandle`] completion handle for one unit of work on the shared pool
//! - [`Job`] boxed unit of work, for batches (`Context::run_all`, `run_await`)
//! - [`active_tasks`] process-wide count of tasks not yet finished

mod handle;

pub use handle::{DEFAULT_WAIT_TIMEOUT, Job, TaskHandle, active_tasks};
