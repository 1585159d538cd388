//! # Shared worker pool.
//!
//! One multi-thread tokio runtime per supervisor. User code (tasks, listeners,
//! services) runs on its blocking workers; scheduler loops run as async tasks.
//!
//! ## Rules
//! - Once closed, no new work is accepted ([`RuntimeError::PoolClosed`]).
//! - Shutdown from inside the runtime (or any async context) detaches instead
//!   of blocking: `shutdown_background`.
//! - `block_on` must not be called from an async task.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

use crate::error::RuntimeError;

pub(crate) struct Pool {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    closed: AtomicBool,
}

impl Pool {
    /// Builds the runtime; `None` keeps tokio's default worker count.
    pub(crate) fn new(worker_threads: Option<usize>) -> Result<Self, RuntimeError> {
        let mut builder = Builder::new_multi_thread();
        builder.enable_all().thread_name("servisor-worker");
        if let Some(n) = worker_threads {
            builder.worker_threads(n);
        }
        let runtime = builder.build().map_err(RuntimeError::Bootstrap)?;
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Runs blocking user code on the pool.
    pub(crate) fn spawn_blocking<F>(&self, f: F) -> Result<(), RuntimeError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            return Err(RuntimeError::PoolClosed);
        }
        drop(self.handle.spawn_blocking(f));
        Ok(())
    }

    /// Spawns an async task (scheduler loops, signal hook).
    pub(crate) fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, RuntimeError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_closed() {
            return Err(RuntimeError::PoolClosed);
        }
        Ok(self.handle.spawn(future))
    }

    /// Drives `future` to completion on the calling thread.
    pub(crate) fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    /// Closes the pool and shuts the runtime down, waiting up to `timeout`.
    pub(crate) fn shutdown(&self, timeout: Duration) {
        self.closed.store(true, Ordering::Release);
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };
        if Handle::try_current().is_ok() {
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(timeout);
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}
