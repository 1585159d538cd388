//! # Default log writer and lifecycle printer.
//!
//! Sinks used by the dispatcher when nobody claimed an event:
//! - [`LogRecord`] events on `LOG` are written through `tracing`;
//! - unclaimed errors are logged with the original channel and payload description.
//!
//! [`LogWriter`] is an opt-in service that prints lifecycle events to stdout.
//! Use it for tests or demos.
//!
//! ## Example output
//! ```text
//! [app-start]
//! [service-registered] service="Echo"
//! [scheduler-registered] scheduler="heartbeat"
//! [config-change] keys=["app_log_level"]
//! [app-shutdown] code=0
//! ```

use std::fmt;

use tracing::Level;

use crate::config::ConfigMap;
use crate::context::Context;
use crate::core::Scheduler;
use crate::error::{BoxError, SharedError};
use crate::events::{
    APP_ERROR, APP_SHUTDOWN, APP_START, CONFIG_CHANGE, Event, SCHEDULER_REGISTER,
    SCHEDULER_UNREGISTER, SERVICE_REGISTER, SERVICE_UNREGISTER,
};
use crate::services::{Service, ServiceRef};

/// Payload of the `LOG` channel.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: Level,
    pub logger: String,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: Level, logger: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            logger: logger.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.level, self.logger, self.message)
    }
}

/// Writes an unclaimed `LOG` event.
pub(crate) fn write_record(event: &Event) {
    let Some(record) = event.payload::<LogRecord>() else {
        tracing::info!(event = %event.describe(), "log event");
        return;
    };
    let logger = record.logger.as_str();
    let message = record.message.as_str();
    match record.level {
        Level::ERROR => tracing::error!(logger, "{message}"),
        Level::WARN => tracing::warn!(logger, "{message}"),
        Level::INFO => tracing::info!(logger, "{message}"),
        Level::DEBUG => tracing::debug!(logger, "{message}"),
        Level::TRACE => tracing::trace!(logger, "{message}"),
    }
}

/// Logs an error event nobody acknowledged.
pub(crate) fn log_unhandled(event: &Event) {
    let error = event
        .error()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "<none>".to_string());
    tracing::error!(
        channel = %event.original_channel(),
        trace_id = event.context().trace_id(),
        payload = %event.describe(),
        error = %error,
        "unhandled error"
    );
}

/// Logs a failure raised while handling an error event.
pub(crate) fn log_escalation_loop(source: &Event, error: &SharedError) {
    tracing::error!(
        channel = %source.original_channel(),
        payload = %source.describe(),
        %error,
        "error while handling an error event"
    );
}

/// Opt-in service printing lifecycle events.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Service for LogWriter {
    fn name(&self) -> &str {
        "LogWriter"
    }

    fn start(&self, _ctx: &Context) -> Result<(), BoxError> {
        Ok(())
    }

    fn stop(&self, _ctx: &Context) -> Result<(), BoxError> {
        Ok(())
    }

    fn on_event(&self, e: &Event) -> Result<(), BoxError> {
        match e.channel() {
            c if c == APP_START => println!("[app-start]"),
            c if c == APP_SHUTDOWN => {
                println!("[app-shutdown] code={:?}", e.payload::<i32>().copied().unwrap_or(0));
            }
            c if c == SERVICE_REGISTER || c == SERVICE_UNREGISTER => {
                if let Some(service) = e.payload::<ServiceRef>() {
                    let tag = if c == SERVICE_REGISTER { "registered" } else { "unregistered" };
                    println!("[service-{tag}] service={:?}", service.name());
                }
            }
            c if c == SCHEDULER_REGISTER || c == SCHEDULER_UNREGISTER => {
                if let Some(scheduler) = e.payload::<std::sync::Arc<Scheduler>>() {
                    let tag = if c == SCHEDULER_REGISTER { "registered" } else { "unregistered" };
                    println!("[scheduler-{tag}] scheduler={:?}", scheduler.name());
                }
            }
            c if c == CONFIG_CHANGE => {
                if let Some(changes) = e.payload::<ConfigMap>() {
                    println!("[config-change] keys={:?}", changes.keys().collect::<Vec<_>>());
                }
            }
            c if c == APP_ERROR => {
                println!(
                    "[error] err={:?} payload={}",
                    e.error().map(|err| err.to_string()),
                    e.describe()
                );
            }
            _ => {}
        }
        Ok(())
    }
}
