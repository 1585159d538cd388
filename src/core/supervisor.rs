//! # Supervisor: the runtime façade.
//!
//! A [`Supervisor`] is a cheap, clonable handle to the running kernel. It is
//! produced by [`SupervisorBuilder::build`](super::SupervisorBuilder::build),
//! which loads configuration and then calls `boot`.
//!
//! ## Boot sequence
//! ```text
//! build():
//!   ConfigLoader::load ─► Config ─► logging::init (app_log_install)
//!   Pool::new(app_worker_threads) ─► Kernel (root context, bus, registry, schedulers)
//!   subscribe builder listeners
//!   boot():
//!     app_params_print ─► print params (masked)
//!     help             ─► print help, stop(EXIT_OK)
//!     ready = true
//!     start services ─► TaskHandle::wait_for(app_task_wait_timeout_ms)
//!     heartbeat scheduler (APP_HEARTBEAT, payload Supervisor)
//!     cleanup scheduler   (memory check, scheduler sweep)
//!     signal hook         (feature "signals")
//!     broadcast APP_START
//! ```
//!
//! ## Shutdown path
//! ```text
//! shutdown() / signal / APP_OOM unclaimed
//!   └─► broadcast APP_SHUTDOWN(code)
//!         └─► listeners + services observe it
//!               └─► stop(code): services ─► schedulers ─► bus/registry ─► pool
//! ```
//!
//! ## Example
//! ```rust,no_run
//! use servisor::{APP_START, ConfigLoader, Supervisor};
//!
//! let supervisor = Supervisor::builder()
//!     .config(ConfigLoader::new().args(std::env::args().skip(1)))
//!     .listener(APP_START, |_event| {
//!         println!("started");
//!         Ok(())
//!     })
//!     .build()?;
//!
//! supervisor.wait_for_stop();
//! # Ok::<(), servisor::RuntimeError>(())
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::builder::SupervisorBuilder;
use super::kernel::Kernel;
use super::scheduler::Scheduler;
use crate::config::{Config, ConfigMap, keys};
use crate::context::Context;
use crate::error::{BoxError, EXIT_OK, RuntimeError};
use crate::events::{APP_HEARTBEAT, APP_START, ChannelId, Event, ListenerId};
use crate::services::{Service, ServiceRef};
use crate::tasks::TaskHandle;

/// Handle to a running runtime.
#[derive(Clone)]
pub struct Supervisor {
    kernel: Arc<Kernel>,
}

impl Supervisor {
    pub fn builder() -> SupervisorBuilder {
        SupervisorBuilder::new()
    }

    pub(crate) fn from_kernel(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    /// Root context.
    pub fn context(&self) -> &Context {
        self.kernel.root()
    }

    /// Child of the root context.
    pub fn new_context(&self, owner: &str) -> Context {
        self.kernel.root().new_context(owner)
    }

    /// Current typed configuration.
    pub fn config(&self) -> Config {
        self.kernel.config()
    }

    /// Resolved configuration entries as seen by the root context.
    pub fn config_entries(&self) -> ConfigMap {
        self.kernel.root().snapshot()
    }

    pub fn is_ready(&self) -> bool {
        self.kernel.ready().get()
    }

    /// Exit code recorded by the last stop.
    pub fn exit_code(&self) -> Option<i32> {
        self.kernel.exit_code()
    }

    /// Registers a listener for `channel`.
    pub fn subscribe<F>(&self, channel: ChannelId, listener: F) -> ListenerId
    where
        F: Fn(&Event) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.kernel.bus().subscribe(channel, Arc::new(listener))
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.kernel.bus().unsubscribe(id)
    }

    pub fn listener_count(&self) -> usize {
        self.kernel.bus().listener_count()
    }

    pub fn listener_count_of(&self, channel: ChannelId) -> usize {
        self.kernel.bus().listener_count_of(channel)
    }

    /// Dispatches currently running.
    pub fn in_flight(&self) -> usize {
        self.kernel.bus().in_flight()
    }

    /// Starts a service; a second start of the same instance is a no-op.
    pub fn start_service<S: Service>(&self, service: Arc<S>) -> Result<TaskHandle, RuntimeError> {
        self.kernel.services().start(self.kernel.root(), ServiceRef::new(service))
    }

    /// Stops and unregisters the service named `name`.
    pub fn stop_service(&self, name: &str) -> bool {
        let services = self.kernel.services();
        services
            .find_by_name(name)
            .is_some_and(|service| services.unregister(self.kernel.root(), &service))
    }

    pub fn service<S: Service>(&self) -> Option<Arc<S>> {
        self.kernel.services().find::<S>()
    }

    /// Ready services in registration order.
    pub fn services(&self) -> Vec<ServiceRef> {
        self.kernel.services().services()
    }

    pub fn schedulers(&self) -> Vec<Arc<Scheduler>> {
        self.kernel.schedulers().all()
    }

    pub fn scheduler_count(&self) -> usize {
        self.kernel.schedulers().len()
    }

    /// Graceful shutdown with [`EXIT_OK`].
    pub fn shutdown(&self) {
        self.shutdown_with(EXIT_OK);
    }

    /// Broadcasts `APP_SHUTDOWN` with `code`; the stop runs after every party saw it.
    pub fn shutdown_with(&self, code: i32) {
        self.kernel.request_shutdown(code);
    }

    /// Stops immediately without broadcasting `APP_SHUTDOWN`.
    pub fn stop(&self, code: i32) -> bool {
        self.kernel.stop(code)
    }

    /// Blocks until the runtime stopped; returns the exit code.
    pub fn wait_for_stop(&self) -> i32 {
        self.kernel.wait_for_stop(None);
        self.exit_code().unwrap_or(EXIT_OK)
    }

    /// Like [`wait_for_stop`](Self::wait_for_stop) with a bound; `None` on timeout.
    pub fn wait_for_stop_timeout(&self, timeout: Duration) -> Option<i32> {
        if self.kernel.wait_for_stop(Some(timeout)) {
            self.exit_code()
        } else {
            None
        }
    }

    /// Registered config keys and descriptions.
    pub fn help_text(&self) -> String {
        keys::help_text()
    }

    /// Resolved configuration with secrets masked.
    pub fn params_text(&self) -> String {
        keys::params_text(&self.config_entries())
    }

    pub(crate) fn boot(&self, services: Vec<ServiceRef>, handle_signals: bool) {
        let cfg = self.config();
        if cfg.print_params {
            println!("{}", self.params_text());
        }
        if cfg.help {
            println!("{}", self.help_text());
            self.kernel.ready().set(true);
            self.stop(EXIT_OK);
            return;
        }

        self.kernel.ready().set(true);
        tracing::info!(services = services.len(), "supervisor booting");

        let root = self.kernel.root();
        let handles: Vec<TaskHandle> = services
            .into_iter()
            .filter_map(|service| {
                let name = service.name().to_owned();
                self.kernel
                    .services()
                    .start(root, service)
                    .inspect_err(|err| tracing::error!(service = %name, error = %err, "service not started"))
                    .ok()
            })
            .collect();
        if let Err(err) = TaskHandle::wait_for(&handles, cfg.task_wait_timeout) {
            tracing::error!(error = %err, "services did not start in time");
        }

        self.install_schedulers(&cfg);
        if handle_signals {
            self.install_signal_hook();
        }

        if let Err(err) = root.new_event(APP_START).payload(self.clone()).broadcast(true).send() {
            tracing::warn!(error = %err, "APP_START not delivered");
        }
        tracing::info!("supervisor started");
    }

    fn install_schedulers(&self, cfg: &Config) {
        let pool = self.kernel.pool();
        let root = self.kernel.root();
        let schedulers = self.kernel.schedulers();

        let weak = Arc::downgrade(&self.kernel);
        let heartbeat = schedulers.periodic(
            pool,
            root,
            "heartbeat",
            cfg.heartbeat,
            cfg.heartbeat,
            move |ctx| {
                if let Some(kernel) = weak.upgrade() {
                    ctx.new_event(APP_HEARTBEAT)
                        .payload(Supervisor::from_kernel(kernel))
                        .broadcast(true)
                        .send()?;
                }
                Ok(())
            },
            None,
        );

        let weak = Arc::downgrade(&self.kernel);
        let cleanup = schedulers.periodic(
            pool,
            root,
            "cleanup",
            cfg.cleanup,
            cfg.cleanup,
            move |_| {
                if let Some(kernel) = weak.upgrade() {
                    kernel.cleanup();
                }
                Ok(())
            },
            None,
        );

        for installed in [heartbeat, cleanup] {
            if let Err(err) = installed {
                tracing::error!(error = %err, "runtime scheduler not installed");
            }
        }
    }

    #[cfg(feature = "signals")]
    fn install_signal_hook(&self) {
        let weak = Arc::downgrade(&self.kernel);
        let hook = self.kernel.pool().spawn(async move {
            if let Err(err) = super::shutdown::wait_for_shutdown_signal().await {
                tracing::warn!(error = %err, "signal listener not installed");
                return;
            }
            let Some(kernel) = weak.upgrade() else {
                return;
            };
            let requester = Arc::clone(&kernel);
            if let Err(err) = kernel.pool().spawn_blocking(move || requester.request_shutdown(EXIT_OK)) {
                tracing::debug!(error = %err, "shutdown request dropped");
            }
        });
        if let Err(err) = hook {
            tracing::warn!(error = %err, "signal hook not installed");
        }
    }

    #[cfg(not(feature = "signals"))]
    fn install_signal_hook(&self) {
        tracing::debug!("built without the signals feature; no signal hook");
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("ready", &self.is_ready())
            .field("services", &self.kernel.services().len())
            .field("listeners", &self.listener_count())
            .field("schedulers", &self.scheduler_count())
            .finish()
    }
}
