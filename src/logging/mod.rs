//! Logging: per-context loggers, the global subscriber and default sinks.
//!
//! ## Contents
//! - [`Logger`] named logger with a runtime-adjustable level
//! - [`init`] installs the `tracing_subscriber` fmt/json subscriber
//! - [`SubscriberControl`] reloads its level and format on config changes
//! - [`LogRecord`] payload of the `LOG` channel
//! - [`LogWriter`] opt-in service printing lifecycle events

mod logger;
pub(crate) mod writer;

pub use logger::{
    LogFormat, Logger, SubscriberControl, init, installed_settings, parse_level, reload_format,
    reload_level,
};
pub use writer::{LogRecord, LogWriter};
