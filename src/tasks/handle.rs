//! # Lightweight task handle.
//!
//! A [`TaskHandle`] tracks one unit of work running on the shared pool. It exposes
//! completion callbacks, blocking and async joins, and group waits.
//!
//! ## Completion flow
//! ```text
//! Context::run(job) ──► pool.spawn_blocking ──► guarded(job(&ctx))
//!                                                   │
//!                           ┌───────────────────────┴──────────────────┐
//!                     callbacks registered?                       no callbacks
//!                           │                                          │
//!                 cb(handle, Option<&error>)            error? ─► ctx.send_event_error
//! ```
//!
//! ## Rules
//! - Callbacks registered after completion fire immediately on the caller's thread.
//! - A failure with no callbacks is escalated through the owning context.
//! - [`active_tasks`] counts tasks that were spawned and have not completed yet.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::context::Context;
use crate::core::Pool;
use crate::error::{BoxError, RuntimeError, TaskError, guarded};

/// Default bound for blocking group waits.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

static ACTIVE_TASKS: AtomicUsize = AtomicUsize::new(0);

/// Number of lightweight tasks currently in flight (process-wide).
pub fn active_tasks() -> usize {
    ACTIVE_TASKS.load(Ordering::Acquire)
}

/// Unit of work accepted by [`Context::run`](crate::Context::run) and friends.
pub type Job = Box<dyn FnOnce(&Context) -> Result<(), BoxError> + Send + 'static>;

type Callback = Box<dyn FnOnce(&TaskHandle, Option<&Arc<TaskError>>) + Send + 'static>;

enum Completion {
    Running(Vec<Callback>),
    Finished(Option<Arc<TaskError>>),
}

struct TaskState {
    context: Context,
    completion: Mutex<Completion>,
    done: Condvar,
    notify: Notify,
}

/// Handle to a unit of work on the shared pool.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskState>,
}

impl TaskHandle {
    fn pending(context: Context) -> Self {
        Self {
            inner: Arc::new(TaskState {
                context,
                completion: Mutex::new(Completion::Running(Vec::new())),
                done: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Spawns `job` on the pool's blocking workers.
    pub(crate) fn spawn<F>(pool: &Pool, context: Context, job: F) -> Result<Self, RuntimeError>
    where
        F: FnOnce(&Context) -> Result<(), BoxError> + Send + 'static,
    {
        let handle = Self::pending(context);
        let worker = handle.clone();

        ACTIVE_TASKS.fetch_add(1, Ordering::AcqRel);
        let spawned = pool.spawn_blocking(move || {
            let outcome = guarded(|| job(&worker.inner.context));
            worker.complete(outcome.err());
        });
        if let Err(err) = spawned {
            ACTIVE_TASKS.fetch_sub(1, Ordering::AcqRel);
            return Err(err);
        }
        Ok(handle)
    }

    fn complete(&self, error: Option<TaskError>) {
        ACTIVE_TASKS.fetch_sub(1, Ordering::AcqRel);
        let error = error.map(Arc::new);

        let callbacks = {
            let mut completion = self.inner.completion.lock();
            match std::mem::replace(&mut *completion, Completion::Finished(error.clone())) {
                Completion::Running(callbacks) => callbacks,
                Completion::Finished(_) => Vec::new(),
            }
        };
        self.inner.done.notify_all();
        self.inner.notify.notify_waiters();

        if callbacks.is_empty() {
            if let Some(err) = error {
                self.inner.context.send_event_error(None, err);
            }
            return;
        }
        for callback in callbacks {
            self.invoke(callback, error.as_ref());
        }
    }

    fn invoke(&self, callback: Callback, error: Option<&Arc<TaskError>>) {
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(self, error)));
        if let Err(payload) = res {
            let err = TaskError::from_panic(payload);
            tracing::warn!(error = %err, "task completion callback panicked");
        }
    }

    /// Context the task runs with.
    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// Registers a completion callback.
    ///
    /// Fires immediately (on the caller's thread) if the task already finished.
    pub fn on_complete(
        &self,
        callback: impl FnOnce(&TaskHandle, Option<&Arc<TaskError>>) + Send + 'static,
    ) -> &Self {
        let finished = {
            let mut completion = self.inner.completion.lock();
            match &mut *completion {
                Completion::Running(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return self;
                }
                Completion::Finished(err) => err.clone(),
            }
        };
        self.invoke(Box::new(callback), finished.as_ref());
        self
    }

    /// True once the task finished (successfully or not).
    pub fn is_done(&self) -> bool {
        matches!(*self.inner.completion.lock(), Completion::Finished(_))
    }

    /// Error of a finished task.
    pub fn error(&self) -> Option<Arc<TaskError>> {
        match &*self.inner.completion.lock() {
            Completion::Finished(err) => err.clone(),
            Completion::Running(_) => None,
        }
    }

    /// Blocks until the task finished.
    pub fn wait(&self) -> &Self {
        let mut completion = self.inner.completion.lock();
        while matches!(*completion, Completion::Running(_)) {
            self.inner.done.wait(&mut completion);
        }
        self
    }

    /// Blocks until the task finished or `timeout` elapsed; returns `true` if it finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut completion = self.inner.completion.lock();
        while matches!(*completion, Completion::Running(_)) {
            if self
                .inner
                .done
                .wait_until(&mut completion, deadline)
                .timed_out()
            {
                return matches!(*completion, Completion::Finished(_));
            }
        }
        true
    }

    /// Resolves once the task finished.
    pub async fn finished(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_done() {
                return;
            }
            notified.await;
        }
    }

    /// Blocks until every handle finished, bounded by `timeout`.
    ///
    /// On timeout a fatal diagnostic is logged and [`RuntimeError::WaitTimeout`] returned.
    pub fn wait_for(handles: &[TaskHandle], timeout: Duration) -> Result<(), RuntimeError> {
        let deadline = Instant::now() + timeout;
        for handle in handles {
            let left = deadline.saturating_duration_since(Instant::now());
            if !handle.wait_timeout(left) {
                let pending = handles.iter().filter(|h| !h.is_done()).count();
                tracing::error!(
                    ?timeout,
                    pending,
                    "[fatal] lightweight tasks did not finish in time"
                );
                return Err(RuntimeError::WaitTimeout { timeout, pending });
            }
        }
        Ok(())
    }

    /// Returns immediately; `on_done` runs once the last handle finished.
    pub fn wait_for_then(handles: &[TaskHandle], on_done: impl FnOnce() + Send + 'static) {
        if handles.is_empty() {
            on_done();
            return;
        }
        let remaining = Arc::new(AtomicUsize::new(handles.len()));
        let on_done: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>> =
            Arc::new(Mutex::new(Some(Box::new(on_done))));

        for handle in handles {
            let remaining = Arc::clone(&remaining);
            let on_done = Arc::clone(&on_done);
            handle.on_complete(move |_, _| {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    if let Some(f) = on_done.lock().take() {
                        f();
                    }
                }
            });
        }
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("done", &self.is_done())
            .field("trace_id", &self.inner.context.trace_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn pool() -> Pool {
        Pool::new(Some(2)).unwrap()
    }

    #[test]
    fn wait_blocks_until_done() {
        let pool = pool();
        let flag = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&flag);
        let handle = TaskHandle::spawn(&pool, Context::root(), move |_| {
            std::thread::sleep(Duration::from_millis(20));
            f.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        handle.wait();
        assert!(flag.load(Ordering::SeqCst));
        assert!(handle.is_done());
        assert!(handle.error().is_none());
    }

    #[test]
    fn callbacks_receive_errors() {
        let pool = pool();
        let (tx, rx) = std::sync::mpsc::channel();
        let handle =
            TaskHandle::spawn(&pool, Context::root(), |_| Err("broken".into())).unwrap();
        handle.on_complete(move |_, err| {
            tx.send(err.map(|e| e.as_label())).unwrap();
        });
        let label = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(label, Some("task_failed"));
    }

    #[test]
    fn late_callback_fires_immediately() {
        let pool = pool();
        let handle = TaskHandle::spawn(&pool, Context::root(), |_| Ok(())).unwrap();
        handle.wait();
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        handle.on_complete(move |_, _| f.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn panics_become_errors() {
        let pool = pool();
        let handle = TaskHandle::spawn(&pool, Context::root(), |_| panic!("oops")).unwrap();
        handle.on_complete(|_, _| {});
        handle.wait();
        assert_eq!(handle.error().unwrap().as_label(), "task_panicked");
    }

    #[test]
    fn wait_for_times_out() {
        let pool = pool();
        let slow = TaskHandle::spawn(&pool, Context::root(), |_| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        })
        .unwrap();
        let err = TaskHandle::wait_for(&[slow.clone()], Duration::from_millis(20)).unwrap_err();
        assert_eq!(err.as_label(), "runtime_wait_timeout");
        assert!(TaskHandle::wait_for(&[slow], Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn wait_for_then_runs_after_last() {
        let pool = pool();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                TaskHandle::spawn(&pool, Context::root(), move |_| {
                    std::thread::sleep(Duration::from_millis(5 * i));
                    Ok(())
                })
                .unwrap()
            })
            .collect();
        let (tx, rx) = std::sync::mpsc::channel();
        let probe = handles.clone();
        TaskHandle::wait_for_then(&handles, move || {
            tx.send(probe.iter().all(TaskHandle::is_done)).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }

    #[test]
    fn wait_for_then_with_no_handles_is_immediate() {
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        TaskHandle::wait_for_then(&[], move || f.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn finished_resolves_in_async_code() {
        let pool = pool();
        let handle = TaskHandle::spawn(&pool, Context::root(), |_| {
            std::thread::sleep(Duration::from_millis(10));
            Ok(())
        })
        .unwrap();
        let h = handle.clone();
        pool.block_on(async move { h.finished().await });
        assert!(handle.is_done());
    }
}
