//! Runtime core: kernel, pool, schedulers and the supervisor façade.
//!
//! The only entry point for users is [`Supervisor`] (built with
//! [`SupervisorBuilder`]); everything else here is wiring.
//!
//! Internal modules:
//! - [`kernel`]: shared state, publish path and stop sequence;
//! - [`pool`]: the tokio runtime user work runs on;
//! - [`scheduler`]: one-shot, periodic and wall-clock schedulers;
//! - [`locked`]: `LockedBool` state transitions;
//! - [`memory`]: memory usage probes for the OOM check;
//! - [`shutdown`]: OS signal handling (feature `signals`).

mod builder;
mod kernel;
mod locked;
mod memory;
mod pool;
mod scheduler;
#[cfg(feature = "signals")]
mod shutdown;
mod supervisor;

pub use builder::SupervisorBuilder;
pub use locked::LockedBool;
pub use memory::{MemoryProbe, SystemMemory};
pub use scheduler::{ScheduleKind, Scheduler, StopPredicate, next_occurrence};
pub use supervisor::Supervisor;

pub(crate) use kernel::Kernel;
pub(crate) use pool::Pool;
