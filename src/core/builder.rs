//! # Builder for the runtime.
//!
//! [`SupervisorBuilder`] collects the configuration loader, boot services,
//! early listeners and a memory probe. `build` turns them into a booted
//! [`Supervisor`]:
//!
//! ```text
//! ConfigLoader::load ─► Config ─► logging::init ─► Pool ─► Kernel ─► boot
//! ```

use std::sync::Arc;

use super::kernel::Kernel;
use super::memory::{MemoryProbe, SystemMemory};
use super::pool::Pool;
use super::supervisor::Supervisor;
use crate::config::{Config, ConfigLoader};
use crate::error::{BoxError, RuntimeError};
use crate::events::{ChannelId, Event, Listener};
use crate::logging;
use crate::services::{Service, ServiceRef};

/// Builder for a [`Supervisor`].
///
/// `build` loads configuration, wires the kernel and boots it: services are
/// started, runtime schedulers installed and `APP_START` broadcast before it
/// returns.
pub struct SupervisorBuilder {
    loader: ConfigLoader,
    services: Vec<ServiceRef>,
    listeners: Vec<(ChannelId, Listener)>,
    memory: Option<Arc<dyn MemoryProbe>>,
    handle_signals: bool,
}

impl SupervisorBuilder {
    pub fn new() -> Self {
        Self {
            loader: ConfigLoader::new(),
            services: Vec::new(),
            listeners: Vec::new(),
            memory: None,
            handle_signals: cfg!(feature = "signals"),
        }
    }

    /// Replaces the configuration loader.
    pub fn config(mut self, loader: ConfigLoader) -> Self {
        self.loader = loader;
        self
    }

    /// Adds a process property (overrides file and environment, not CLI).
    pub fn property(mut self, key: &str, value: impl Into<String>) -> Self {
        self.loader = self.loader.property(key, value);
        self
    }

    /// Adds CLI arguments (highest precedence).
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.loader = self.loader.args(args);
        self
    }

    /// Service started during boot, in the order given.
    pub fn service<S: Service>(mut self, service: Arc<S>) -> Self {
        self.services.push(ServiceRef::new(service));
        self
    }

    /// Overrides the memory probe used by the OOM check.
    pub fn memory_probe(mut self, probe: impl MemoryProbe) -> Self {
        self.memory = Some(Arc::new(probe));
        self
    }

    /// Installs the OS signal hook (only with the `signals` feature).
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Listener subscribed before boot, so it sees `APP_START`.
    pub fn listener<F>(mut self, channel: ChannelId, listener: F) -> Self
    where
        F: Fn(&Event) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.listeners.push((channel, Arc::new(listener)));
        self
    }

    /// Loads configuration, builds the runtime and boots it.
    pub fn build(self) -> Result<Supervisor, RuntimeError> {
        let entries = self.loader.load()?;
        let config = Config::from_map(&entries);
        let log_install = config.log_install;
        if log_install && !logging::init(config.log_format, config.log_level) {
            tracing::debug!("global subscriber already installed");
        }

        let pool = Pool::new(config.worker_limit())?;
        let memory = self.memory.unwrap_or_else(|| Arc::new(SystemMemory::new()));
        let kernel = Arc::new_cyclic(|weak| Kernel::new(weak.clone(), &entries, config, pool, memory));

        if log_install {
            kernel.root().add_observer(Arc::new(logging::SubscriberControl));
        }
        for (channel, listener) in self.listeners {
            kernel.bus().subscribe(channel, listener);
        }

        let supervisor = Supervisor::from_kernel(kernel);
        supervisor.boot(self.services, self.handle_signals);
        Ok(supervisor)
    }
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
