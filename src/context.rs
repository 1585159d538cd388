//! # Execution context.
//!
//! A [`Context`] is the per-unit-of-work namespace and the façade over the runtime:
//! key/value entries, a lazily created logger, task execution, scheduling,
//! event publishing, service lookup and failure escalation.
//!
//! ## Hierarchy
//! ```text
//! root (supervisor)
//!  ├─ "Echo"            new_context: copies entries, new trace id
//!  │   └─ "request"     new_context
//!  └─ "batch"           new_empty_context: no entries
//! ```
//! Children copy the parent's entries at creation; later writes never alias.
//! Every context shares the supervisor through a weak reference, so a context
//! that outlives its supervisor fails with [`RuntimeError::Detached`].
//!
//! ## Rules
//! - Keys are normalized (`.`, `-`, `+`, `:` → `_`, lowercase).
//! - A `put` of a string value notifies the context's [`Configurable`] observers
//!   (the logger is one) with a single-entry map.
//! - Escalating an error event that is already on `APP_ERROR`/`APP_UNHANDLED`
//!   logs it instead of publishing again.

use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use chrono::{NaiveTime, Weekday};
use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::config::{ConfigMap, Configurable, keys::normalize_key};
use crate::core::{Kernel, Scheduler, StopPredicate, Supervisor};
use crate::error::{BoxError, EXIT_FATAL, RuntimeError, SharedError, TaskError, guarded};
use crate::events::{
    APP_ERROR, APP_UNHANDLED, ChannelId, Event, EventBuilder, META_ORIGINAL_CHANNEL, Value,
};
use crate::logging::Logger;
use crate::logging::writer;
use crate::services::{Service, ServiceRef};
use crate::tasks::{Job, TaskHandle};

/// Poll interval of [`Context::service_wait`].
const SERVICE_POLL: Duration = Duration::from_millis(16);

struct Inner {
    owner: String,
    parent: Option<Context>,
    trace_id: String,
    entries: RwLock<IndexMap<String, Value>>,
    observers: RwLock<Vec<Arc<dyn Configurable>>>,
    logger: OnceLock<Arc<Logger>>,
    kernel: Weak<Kernel>,
}

/// Hierarchical per-unit-of-work namespace and runtime façade.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

fn new_trace_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

impl Context {
    fn with(owner: &str, parent: Option<Context>, entries: IndexMap<String, Value>, kernel: Weak<Kernel>) -> Self {
        Self {
            inner: Arc::new(Inner {
                owner: owner.to_string(),
                parent,
                trace_id: new_trace_id(),
                entries: RwLock::new(entries),
                observers: RwLock::new(Vec::new()),
                logger: OnceLock::new(),
                kernel,
            }),
        }
    }

    /// Detached root context (no supervisor).
    ///
    /// Entries, loggers and event building work; anything needing the runtime
    /// fails with [`RuntimeError::Detached`].
    pub fn root() -> Self {
        Self::with("root", None, IndexMap::new(), Weak::new())
    }

    /// Root context of a supervisor, seeded with the resolved configuration.
    pub(crate) fn attached(kernel: Weak<Kernel>, config: &ConfigMap) -> Self {
        let entries = config
            .iter()
            .map(|(k, v)| (k.clone(), Arc::new(v.clone()) as Value))
            .collect();
        Self::with("root", None, entries, kernel)
    }

    /// Child context with a copy of this context's entries.
    pub fn new_context(&self, owner: &str) -> Context {
        let entries = self.inner.entries.read().clone();
        Self::with(owner, Some(self.clone()), entries, self.inner.kernel.clone())
    }

    /// Child context without entries.
    pub fn new_empty_context(&self, owner: &str) -> Context {
        Self::with(owner, Some(self.clone()), IndexMap::new(), self.inner.kernel.clone())
    }

    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    pub fn parent(&self) -> Option<&Context> {
        self.inner.parent.as_ref()
    }

    pub fn trace_id(&self) -> &str {
        &self.inner.trace_id
    }

    /// Trace ids from this context up to the root.
    pub fn trace_ids(&self) -> Vec<String> {
        let mut ids = vec![self.inner.trace_id.clone()];
        let mut current = self.parent();
        while let Some(ctx) = current {
            ids.push(ctx.inner.trace_id.clone());
            current = ctx.parent();
        }
        ids
    }

    // ---- entries ----

    /// Stores a value; string values notify the observers.
    pub fn put<T: Any + Send + Sync>(&self, key: &str, value: T) -> &Self {
        let key = normalize_key(key);
        let value: Value = Arc::new(value);
        let text = value_text(&value);
        self.inner.entries.write().insert(key.clone(), value);

        if let Some(text) = text {
            let observers = self.inner.observers.read().clone();
            if !observers.is_empty() {
                let mut change = ConfigMap::new();
                change.insert(key, text);
                for observer in observers {
                    observer.on_config_change(&change);
                }
            }
        }
        self
    }

    /// Value downcast to `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.inner.entries.read().get(&normalize_key(key)).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Raw value.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.inner.entries.read().get(&normalize_key(key)).cloned()
    }

    /// String value (`String` or `&'static str` entries).
    pub fn get_string(&self, key: &str) -> Option<String> {
        value_text(&self.get_value(key)?)
    }

    /// String value parsed as `T`.
    pub fn get_as<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get_string(key)?.trim().parse().ok()
    }

    /// Parsed value or `default`.
    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get_as(key).unwrap_or(default)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.entries.read().contains_key(&normalize_key(key))
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.entries.write().shift_remove(&normalize_key(key))
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.entries.read().keys().cloned().collect()
    }

    /// String entries as a [`ConfigMap`].
    pub fn snapshot(&self) -> ConfigMap {
        self.inner
            .entries
            .read()
            .iter()
            .filter_map(|(k, v)| value_text(v).map(|t| (k.clone(), t)))
            .collect()
    }

    /// Attaches a config-change observer.
    pub fn add_observer(&self, observer: Arc<dyn Configurable>) -> &Self {
        self.inner.observers.write().push(observer);
        self
    }

    /// Logger of this context, created on first use.
    ///
    /// Inherits level and format from the nearest ancestor with a logger, else
    /// reads them from this context's entries.
    pub fn logger(&self) -> Arc<Logger> {
        self.inner
            .logger
            .get_or_init(|| {
                let logger = match self.ancestor_logger() {
                    Some(parent) => parent.child(&self.inner.owner, &self.inner.trace_id),
                    None => Logger::from_config(&self.inner.owner, &self.inner.trace_id, &self.snapshot()),
                };
                let logger = Arc::new(logger);
                self.add_observer(logger.clone());
                logger
            })
            .clone()
    }

    fn ancestor_logger(&self) -> Option<Arc<Logger>> {
        let mut current = self.parent();
        while let Some(ctx) = current {
            if let Some(logger) = ctx.inner.logger.get() {
                return Some(logger.clone());
            }
            current = ctx.parent();
        }
        None
    }

    // ---- runtime ----

    pub(crate) fn kernel(&self) -> Result<Arc<Kernel>, RuntimeError> {
        self.inner.kernel.upgrade().ok_or(RuntimeError::Detached)
    }

    /// Supervisor this context belongs to.
    pub fn supervisor(&self) -> Option<Supervisor> {
        self.inner.kernel.upgrade().map(Supervisor::from_kernel)
    }

    /// Runs `task` on the shared pool.
    pub fn run<F>(&self, task: F) -> Result<TaskHandle, RuntimeError>
    where
        F: FnOnce(&Context) -> Result<(), BoxError> + Send + 'static,
    {
        let kernel = self.kernel()?;
        TaskHandle::spawn(kernel.pool(), self.clone(), task)
    }

    /// Runs every job; stops at the first job that cannot be scheduled.
    pub fn run_all(&self, jobs: Vec<Job>) -> Result<Vec<TaskHandle>, RuntimeError> {
        jobs.into_iter().map(|job| self.run(job)).collect()
    }

    /// Runs `task` and calls `on_done` with its outcome.
    pub fn run_handled<F, D>(&self, task: F, on_done: D) -> Result<TaskHandle, RuntimeError>
    where
        F: FnOnce(&Context) -> Result<(), BoxError> + Send + 'static,
        D: FnOnce(&TaskHandle, Option<&Arc<TaskError>>) + Send + 'static,
    {
        let handle = self.run(task)?;
        handle.on_complete(on_done);
        Ok(handle)
    }

    /// Runs every job and blocks until all finished (bounded by the task wait timeout).
    pub fn run_await(&self, jobs: Vec<Job>) -> Result<Vec<TaskHandle>, RuntimeError> {
        let timeout = self.kernel()?.config().task_wait_timeout;
        let handles = self.run_all(jobs)?;
        TaskHandle::wait_for(&handles, timeout)?;
        Ok(handles)
    }

    /// Runs `task` once after `delay`.
    pub fn run_after<F>(&self, delay: Duration, task: F) -> Result<Arc<Scheduler>, RuntimeError>
    where
        F: FnOnce(&Context) -> Result<(), BoxError> + Send + 'static,
    {
        let kernel = self.kernel()?;
        kernel.schedulers().once(kernel.pool(), self, self.owner(), delay, task)
    }

    /// Runs `task` at a fixed rate until `until` returns `true` or a run fails.
    pub fn run_periodic<F>(
        &self,
        initial: Duration,
        period: Duration,
        task: F,
        until: Option<StopPredicate>,
    ) -> Result<Arc<Scheduler>, RuntimeError>
    where
        F: Fn(&Context) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let kernel = self.kernel()?;
        kernel
            .schedulers()
            .periodic(kernel.pool(), self, self.owner(), initial, period, task, until)
    }

    /// Runs `task` every day at `at` (local time).
    pub fn run_daily<F>(
        &self,
        at: NaiveTime,
        task: F,
        until: Option<StopPredicate>,
    ) -> Result<Arc<Scheduler>, RuntimeError>
    where
        F: Fn(&Context) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let kernel = self.kernel()?;
        kernel
            .schedulers()
            .wall_clock(kernel.pool(), self, self.owner(), at, None, task, until)
    }

    /// Runs `task` every week on `day` at `at` (local time).
    pub fn run_weekly<F>(
        &self,
        day: Weekday,
        at: NaiveTime,
        task: F,
        until: Option<StopPredicate>,
    ) -> Result<Arc<Scheduler>, RuntimeError>
    where
        F: Fn(&Context) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let kernel = self.kernel()?;
        kernel
            .schedulers()
            .wall_clock(kernel.pool(), self, self.owner(), at, Some(day), task, until)
    }

    // ---- events ----

    /// Starts building an event published from this context.
    pub fn new_event(&self, channel: ChannelId) -> EventBuilder {
        EventBuilder::new(self.clone(), channel)
    }

    /// Dispatches a built event (inline, or on the pool if asynchronous).
    pub fn publish(&self, event: &Arc<Event>) -> Result<(), RuntimeError> {
        self.kernel()?.publish(event)
    }

    /// Fire-and-forget targeted event.
    pub fn send_event<T: Any + Send + Sync>(&self, channel: ChannelId, payload: T) -> Result<(), RuntimeError> {
        self.new_event(channel).payload(payload).asynchronous(true).send().map(drop)
    }

    /// Fire-and-forget broadcast event.
    pub fn broadcast_event<T: Any + Send + Sync>(&self, channel: ChannelId, payload: T) -> Result<(), RuntimeError> {
        self.new_event(channel)
            .payload(payload)
            .broadcast(true)
            .asynchronous(true)
            .send()
            .map(drop)
    }

    /// Synchronous targeted event; inspect the returned event for a response.
    pub fn send_event_return<T: Any + Send + Sync>(
        &self,
        channel: ChannelId,
        payload: T,
    ) -> Result<Arc<Event>, RuntimeError> {
        self.new_event(channel).payload(payload).send()
    }

    /// Synchronous broadcast event.
    pub fn broadcast_event_return<T: Any + Send + Sync>(
        &self,
        channel: ChannelId,
        payload: T,
    ) -> Result<Arc<Event>, RuntimeError> {
        self.new_event(channel).payload(payload).broadcast(true).send()
    }

    /// Escalates a failure on `APP_ERROR`.
    ///
    /// When `payload` is an `Arc<Event>` already on the error or unhandled
    /// channel, the failure is logged instead.
    pub fn send_event_error(&self, payload: Option<Value>, error: SharedError) {
        let payload_type = match &payload {
            Some(p) if p.is::<Arc<Event>>() => std::any::type_name::<Arc<Event>>(),
            Some(_) => "dyn Any",
            None => "()",
        };
        self.escalate_with(payload, payload_type, error, |_| {});
    }

    /// Runs `f`; errors and panics are escalated and `None` returned.
    pub fn try_execute<R>(&self, f: impl FnOnce() -> Result<R, BoxError>) -> Option<R> {
        match guarded(f) {
            Ok(value) => Some(value),
            Err(err) => {
                self.send_event_error(None, Arc::new(err));
                None
            }
        }
    }

    pub(crate) fn escalate_with(
        &self,
        payload: Option<Value>,
        payload_type: &'static str,
        error: SharedError,
        before_publish: impl FnOnce(&Event),
    ) {
        if TaskError::is_fatal_shared(&error) {
            tracing::error!(owner = self.owner(), trace_id = self.trace_id(), %error, "[fatal] terminating");
            std::process::exit(EXIT_FATAL);
        }

        let source = payload
            .as_ref()
            .and_then(|p| p.downcast_ref::<Arc<Event>>())
            .cloned();
        if let Some(src) = &source {
            if src.is(APP_ERROR) || src.is(APP_UNHANDLED) {
                writer::log_escalation_loop(src, &error);
                return;
            }
        }

        let event = self
            .new_event(APP_ERROR)
            .payload_value(payload, payload_type)
            .error(error)
            .build();
        if let Some(src) = &source {
            event.put_meta(META_ORIGINAL_CHANNEL, src.channel());
        }

        before_publish(&event);
        if event.is_acknowledged() {
            return;
        }
        if let Err(err) = self.publish(&event) {
            tracing::debug!(error = %err, "error event not published");
            writer::log_unhandled(&event);
        }
    }

    // ---- services ----

    /// First ready service of type `S`.
    pub fn service<S: Service>(&self) -> Option<Arc<S>> {
        self.kernel().ok()?.services().find::<S>()
    }

    /// Polls for a ready service of type `S` until `timeout`.
    pub fn service_wait<S: Service>(&self, timeout: Duration) -> Option<Arc<S>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(found) = self.service::<S>() {
                return Some(found);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(SERVICE_POLL);
        }
    }

    /// Ready services in registration order.
    pub fn services(&self) -> Vec<ServiceRef> {
        self.kernel()
            .map(|k| k.services().services())
            .unwrap_or_default()
    }
}

fn value_text(value: &Value) -> Option<String> {
    if let Some(s) = value.downcast_ref::<String>() {
        return Some(s.clone());
    }
    value.downcast_ref::<&'static str>().map(|s| (*s).to_string())
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("owner", &self.inner.owner)
            .field("trace_id", &self.inner.trace_id)
            .field("entries", &self.inner.entries.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::keys;
    use parking_lot::Mutex;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn keys_are_normalized() {
        let ctx = Context::root();
        ctx.put("App.Name", "demo".to_string());
        assert_eq!(ctx.get_string("app_name").as_deref(), Some("demo"));
        assert_eq!(ctx.get_string("APP-NAME").as_deref(), Some("demo"));
        assert!(ctx.contains("app:name"));
    }

    #[test]
    fn typed_access() {
        let ctx = Context::root();
        ctx.put("port", "8080".to_string()).put("ratio", 0.5_f64);
        assert_eq!(ctx.get_as::<u16>("port"), Some(8080));
        assert_eq!(ctx.get_or::<u16>("missing", 1), 1);
        assert_eq!(ctx.get::<f64>("ratio").as_deref(), Some(&0.5));
        assert!(ctx.get::<u32>("ratio").is_none());
        assert_eq!(ctx.snapshot().len(), 1);
    }

    #[test]
    fn children_copy_entries() {
        let root = Context::root();
        root.put("shared", "a".to_string());
        let child = root.new_context("child");
        child.put("shared", "b".to_string());
        assert_eq!(root.get_string("shared").as_deref(), Some("a"));
        assert_eq!(child.get_string("shared").as_deref(), Some("b"));
        assert!(root.new_empty_context("empty").keys().is_empty());

        let ids = child.trace_ids();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[1], root.trace_id());
        assert_eq!(child.trace_id().len(), 16);
    }

    #[test]
    fn string_puts_notify_observers() {
        struct Recorder(Mutex<Vec<ConfigMap>>);
        impl Configurable for Recorder {
            fn on_config_change(&self, changes: &ConfigMap) {
                self.0.lock().push(changes.clone());
            }
        }

        let ctx = Context::root();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        ctx.add_observer(recorder.clone());
        ctx.put("Some.Key", "v".to_string());
        ctx.put("number", 3_u8);
        let seen = recorder.0.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].get("some_key").map(String::as_str), Some("v"));
    }

    #[test]
    fn logger_follows_context_config() {
        let ctx = Context::root();
        ctx.put(keys::LOG_LEVEL, "warn".to_string());
        let logger = ctx.logger();
        assert_eq!(logger.level(), LevelFilter::WARN);
        ctx.put(keys::LOG_LEVEL, "trace".to_string());
        assert_eq!(logger.level(), LevelFilter::TRACE);

        let child = ctx.new_empty_context("child");
        assert_eq!(child.logger().level(), LevelFilter::TRACE);
        assert_eq!(child.logger().name(), "child");
    }

    #[test]
    fn detached_contexts_report_it() {
        let ctx = Context::root();
        assert!(matches!(ctx.run(|_| Ok(())), Err(RuntimeError::Detached)));
        assert!(matches!(
            ctx.send_event_return(APP_ERROR, ()),
            Err(RuntimeError::Detached)
        ));
        assert!(ctx.service::<crate::logging::LogWriter>().is_none());
        assert!(ctx.supervisor().is_none());
    }

    #[test]
    fn try_execute_contains_failures() {
        let ctx = Context::root();
        assert_eq!(ctx.try_execute(|| Ok(3)), Some(3));
        assert_eq!(ctx.try_execute::<u8>(|| Err("bad".into())), None);
        assert_eq!(ctx.try_execute::<u8>(|| panic!("worse")), None);
    }
}
