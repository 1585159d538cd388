//! # Runtime kernel.
//!
//! The kernel is the shared state behind [`Supervisor`](super::Supervisor) and every
//! [`Context`]: pool, bus, service registry, schedulers and the typed config.
//!
//! ## Publish path
//! ```text
//! publish(event) ─► mark_sent ─┬─ async ─► pool task ─► deliver(event)
//!                              └─ sync  ─────────────► deliver(event)
//!
//! deliver(event):
//!   CONFIG_CHANGE (ConfigMap)          ─► merge into root, patch Config, Service::configure
//!   SERVICE_REGISTER (Start request)   ─► start service, respond(TaskHandle)
//!   SERVICE_UNREGISTER (Stop request)  ─► stop service, respond(bool)
//!   Bus::deliver(event)
//!   APP_SHUTDOWN                       ─► stop(code)
//! ```
//! Shutdown runs after the bus delivery so every party observes `APP_SHUTDOWN`
//! before services and schedulers are torn down.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use super::locked::LockedBool;
use super::memory::MemoryProbe;
use super::pool::Pool;
use super::scheduler::Schedulers;
use crate::config::{Config, ConfigMap};
use crate::context::Context;
use crate::error::{EXIT_OK, EXIT_OOM, RuntimeError};
use crate::events::{APP_OOM, APP_SHUTDOWN, Bus, CONFIG_CHANGE, Event, SERVICE_REGISTER, SERVICE_UNREGISTER};
use crate::services::{ServiceRegistry, ServiceRequest};
use crate::tasks::TaskHandle;

pub(crate) struct Kernel {
    config: RwLock<Config>,
    pool: Pool,
    bus: Bus,
    services: ServiceRegistry,
    schedulers: Schedulers,
    memory: Arc<dyn MemoryProbe>,
    root: Context,
    ready: LockedBool,
    exit: Mutex<Option<i32>>,
    stopped: Condvar,
}

impl Kernel {
    pub(crate) fn new(
        weak: Weak<Kernel>,
        entries: &ConfigMap,
        config: Config,
        pool: Pool,
        memory: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            pool,
            bus: Bus::new(),
            services: ServiceRegistry::new(),
            schedulers: Schedulers::new(),
            memory,
            root: Context::attached(weak, entries),
            ready: LockedBool::new(false),
            exit: Mutex::new(None),
            stopped: Condvar::new(),
        }
    }

    pub(crate) fn pool(&self) -> &Pool {
        &self.pool
    }

    pub(crate) fn bus(&self) -> &Bus {
        &self.bus
    }

    pub(crate) fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub(crate) fn schedulers(&self) -> &Schedulers {
        &self.schedulers
    }

    pub(crate) fn root(&self) -> &Context {
        &self.root
    }

    pub(crate) fn config(&self) -> Config {
        self.config.read().clone()
    }

    pub(crate) fn ready(&self) -> &LockedBool {
        &self.ready
    }

    pub(crate) fn exit_code(&self) -> Option<i32> {
        *self.exit.lock()
    }

    pub(crate) fn publish(self: &Arc<Self>, event: &Arc<Event>) -> Result<(), RuntimeError> {
        event.mark_sent()?;
        if event.is_async() {
            let kernel = Arc::clone(self);
            let event = Arc::clone(event);
            let ctx = event.context().clone();
            TaskHandle::spawn(&self.pool, ctx, move |_| {
                kernel.deliver(&event);
                Ok(())
            })?;
            return Ok(());
        }
        self.deliver(event);
        Ok(())
    }

    fn deliver(self: &Arc<Self>, event: &Arc<Event>) {
        if event.is(CONFIG_CHANGE) {
            if let Some(changes) = event.payload::<ConfigMap>() {
                self.apply_config(changes);
            }
        } else if !event.is_broadcast() {
            if let Some(request) = event.payload::<ServiceRequest>() {
                self.handle_request(event, request);
            }
        }

        self.bus.deliver(event, &self.services);

        if event.is(APP_SHUTDOWN) {
            let code = event.payload::<i32>().copied().unwrap_or(EXIT_OK);
            self.stop(code);
        }
    }

    fn apply_config(&self, changes: &ConfigMap) {
        for (key, value) in changes {
            self.root.put(key, value.clone());
        }
        self.config.write().apply(changes);
        let merged = self.root.snapshot();
        for entry in self.services.ready() {
            entry.service().configure(changes, &merged);
        }
        tracing::debug!(keys = changes.len(), "configuration changed");
    }

    fn handle_request(&self, event: &Event, request: &ServiceRequest) {
        match request {
            ServiceRequest::Start(service) if event.is(SERVICE_REGISTER) => {
                match self.services.start(event.context(), service.clone()) {
                    Ok(handle) => event.respond(handle),
                    Err(err) => {
                        tracing::warn!(service = service.name(), error = %err, "start request rejected");
                        event.acknowledge();
                    }
                }
            }
            ServiceRequest::Stop(name) if event.is(SERVICE_UNREGISTER) => {
                let stopped = self
                    .services
                    .find_by_name(name)
                    .is_some_and(|service| self.services.unregister(event.context(), &service));
                event.respond(stopped);
            }
            _ => {}
        }
    }

    /// Requests a graceful shutdown through `APP_SHUTDOWN`.
    pub(crate) fn request_shutdown(&self, code: i32) {
        if !self.ready.get() {
            return;
        }
        let sent = self
            .root
            .new_event(APP_SHUTDOWN)
            .payload(code)
            .broadcast(true)
            .send();
        if let Err(err) = sent {
            tracing::warn!(error = %err, "shutdown event not delivered; stopping directly");
            self.stop(code);
        }
    }

    /// Tears everything down once; returns `false` if not running.
    pub(crate) fn stop(&self, code: i32) -> bool {
        if !self.ready.set_if(true, false, || {}) {
            return false;
        }
        let cfg = self.config();
        tracing::info!(code, "supervisor stopping");

        self.services
            .stop_all(&self.root, cfg.parallel_shutdown, cfg.task_wait_timeout);
        self.schedulers.shutdown(&self.pool, cfg.shutdown_timeout);
        self.bus.clear();
        self.services.clear();
        self.pool.shutdown(cfg.shutdown_timeout);

        *self.exit.lock() = Some(code);
        self.stopped.notify_all();
        tracing::info!(code, "supervisor stopped");

        if cfg.production {
            std::process::exit(code);
        }
        true
    }

    /// Blocks until stopped; `None` waits forever. Returns `true` if stopped.
    pub(crate) fn wait_for_stop(&self, timeout: Option<Duration>) -> bool {
        let mut exit = self.exit.lock();
        match timeout {
            None => {
                while exit.is_none() {
                    self.stopped.wait(&mut exit);
                }
                true
            }
            Some(timeout) => {
                let deadline = std::time::Instant::now() + timeout;
                while exit.is_none() {
                    if self.stopped.wait_until(&mut exit, deadline).timed_out() {
                        break;
                    }
                }
                exit.is_some()
            }
        }
    }

    /// Memory check and scheduler sweep.
    pub(crate) fn cleanup(&self) {
        self.check_memory();
        let swept = self.schedulers.sweep(&self.root);
        if swept > 0 {
            tracing::trace!(swept, "terminated schedulers removed");
        }
    }

    fn check_memory(&self) {
        let Some(limit) = self.config.read().oom_limit() else {
            return;
        };
        let usage = self.memory.usage_percent();
        if usage <= limit {
            return;
        }
        let claimed = self
            .root
            .new_event(APP_OOM)
            .payload(usage)
            .broadcast(true)
            .send()
            .is_ok_and(|event| event.is_acknowledged());
        if !claimed {
            tracing::warn!(usage, limit, "memory threshold exceeded; shutting down");
            self.request_shutdown(EXIT_OOM);
        }
    }
}
