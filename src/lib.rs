//! # servisor
//!
//! **Servisor** is an embeddable service runtime: a hierarchical execution
//! context, an in-process event bus with acknowledgement semantics, pluggable
//! services with a start/stop lifecycle, schedulers and a shared worker pool.
//!
//! User code is synchronous. Tasks, listeners and services run on the blocking
//! workers of one tokio runtime owned by the [`Supervisor`]; scheduler loops
//! are async tasks that hand each run to the pool and await it.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!  ConfigLoader (file < env < property < CLI, ${key:fallback})
//!        │
//!        ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Supervisor (runtime façade)                                      │
//! │  - root Context (config entries, logger, trace id)                │
//! │  - Bus (listeners per channel, copy-on-write)                     │
//! │  - ServiceRegistry (Service entries, LockedBool readiness)        │
//! │  - Schedulers (once / periodic / daily / weekly)                  │
//! │  - Pool (tokio runtime; user code on blocking workers)            │
//! └──────┬──────────────────┬──────────────────┬───────────────┬──────┘
//!        ▼                  ▼                  ▼               ▼
//!   Context::run      Context::publish   Context::run_*    heartbeat / cleanup
//!   (TaskHandle)      (Event)            (Scheduler)       (APP_HEARTBEAT, APP_OOM)
//!                           │
//!                           ▼
//!              ┌────────────────────────────┐
//!              │ dispatch: listeners first, │
//!              │ then services, stop at the │
//!              │ first acknowledgement      │
//!              │ (broadcast: visit all)     │
//!              └─────────────┬──────────────┘
//!                            ▼
//!              failures ─► APP_ERROR (META original channel)
//!                            │ unclaimed
//!                            ▼
//!                    logged as unhandled
//! ```
//!
//! ### Lifecycle
//! ```text
//! SupervisorBuilder::build()
//!   ├─► load config, init logging (app_log_install)
//!   ├─► ready = true, start services (SERVICE_REGISTER each)
//!   ├─► heartbeat + cleanup schedulers, signal hook
//!   └─► broadcast APP_START
//!
//! shutdown (call, OS signal, unclaimed APP_OOM)
//!   └─► broadcast APP_SHUTDOWN(code)
//!         ├─► stop services (sequential reverse order, or parallel)
//!         ├─► cancel schedulers, await, abort stragglers
//!         ├─► clear listeners and services
//!         └─► shut the pool down, record exit code
//! ```
//!
//! ## Features
//! | Area              | Description                                                  | Key types / traits                      |
//! |-------------------|--------------------------------------------------------------|-----------------------------------------|
//! | **Context**       | Hierarchical key/value store and runtime facade              | [`Context`]                             |
//! | **Events**        | Channels, envelopes, acknowledgement and responses           | [`Event`], [`ChannelId`]                |
//! | **Services**      | Pluggable units with start/stop lifecycle                    | [`Service`], [`ServiceRef`]             |
//! | **Tasks**         | Pool work with completion callbacks and joins                | [`TaskHandle`]                          |
//! | **Scheduling**    | One-shot, fixed-rate and wall-clock schedulers               | [`Scheduler`], [`StopPredicate`]        |
//! | **Configuration** | Layered loading, placeholders, typed view                    | [`ConfigLoader`], [`Config`]            |
//! | **Logging**       | `tracing`-backed per-context loggers                         | [`Logger`], [`LogFormat`]               |
//! | **Errors**        | Typed errors for the runtime and user work                   | [`RuntimeError`], [`TaskError`]         |
//!
//! ## Optional features
//! - `signals` (default): SIGINT/SIGTERM/SIGQUIT (Ctrl-C on Windows) trigger a graceful shutdown.
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use servisor::{BoxError, ConfigLoader, Context, Event, Service, Supervisor, register_channel_id};
//!
//! struct Greeter;
//!
//! impl Service for Greeter {
//!     fn start(&self, ctx: &Context) -> Result<(), BoxError> {
//!         ctx.logger().info("greeter ready");
//!         Ok(())
//!     }
//!
//!     fn stop(&self, _ctx: &Context) -> Result<(), BoxError> {
//!         Ok(())
//!     }
//!
//!     fn on_event(&self, event: &Event) -> Result<(), BoxError> {
//!         if let Some(name) = event.payload::<String>() {
//!             event.respond(format!("hello, {name}"));
//!         }
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let greet = register_channel_id("greet");
//!     let supervisor = Supervisor::builder()
//!         .config(ConfigLoader::new().args(std::env::args().skip(1)))
//!         .service(Arc::new(Greeter))
//!         .build()?;
//!
//!     let event = supervisor.context().send_event_return(greet, "world".to_string())?;
//!     println!("{:?}", event.response::<String>());
//!
//!     supervisor.shutdown();
//!     Ok(())
//! }
//! ```
mod context;
mod core;
mod error;
mod tasks;

pub mod config;
pub mod events;
pub mod logging;
pub mod services;

// ---- Public re-exports ----

pub use crate::config::{Config, ConfigLoader, ConfigMap, Configurable};
pub use crate::config::keys::{normalize_key, register_config_key};
pub use crate::context::Context;
pub use crate::core::{
    LockedBool, MemoryProbe, ScheduleKind, Scheduler, StopPredicate, Supervisor, SupervisorBuilder,
    SystemMemory, next_occurrence,
};
pub use crate::error::{BoxError, EXIT_FATAL, EXIT_OK, EXIT_OOM, Fatal, RuntimeError, SharedError, TaskError};
pub use crate::events::{
    APP_ERROR, APP_HEARTBEAT, APP_OOM, APP_SHUTDOWN, APP_START, APP_UNHANDLED, CONFIG_CHANGE,
    ChannelId, Event, EventBuilder, LOG, ListenerId, METRIC_UPDATE, SCHEDULER_REGISTER,
    SCHEDULER_UNREGISTER, SERVICE_REGISTER, SERVICE_UNREGISTER, Value, channel_id_of,
    event_name_of, register_channel_id,
};
pub use crate::logging::{LogFormat, Logger};
pub use crate::services::{MetricUpdate, Service, ServiceRef, ServiceRequest};
pub use crate::tasks::{DEFAULT_WAIT_TIMEOUT, Job, TaskHandle, active_tasks};
