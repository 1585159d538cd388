//! # Per-context logger on top of `tracing`.
//!
//! A [`Logger`] is created lazily by [`Context::logger`](crate::Context::logger).
//! It stamps every record with the owner name and the context trace id and keeps
//! a level that can be changed at runtime through `app_log_level`.
//!
//! The process-wide subscriber installed by [`init`] keeps its level filter and
//! its fmt layer behind `tracing_subscriber::reload`, so [`SubscriberControl`]
//! can swap both when `app_log_level` or `app_log_formatter` change.
//!
//! ```text
//! Registry
//!   ├─ reload::Layer<LevelFilter>       (app_log_level)
//!   └─ reload::Layer<Box<dyn Layer>>    (app_log_formatter: console | json)
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use parking_lot::RwLock;
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, Registry, reload};

use crate::config::{Configurable, ConfigMap, keys};

/// Output format of the process-wide subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable, one line per record.
    #[default]
    Console,
    /// One JSON object per record.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "console" | "plain" | "text" => Ok(LogFormat::Console),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Parses a level name (`error`, `warn`, `info`, `debug`, `trace`, `off`).
pub fn parse_level(value: &str) -> Option<LevelFilter> {
    LevelFilter::from_str(value.trim()).ok()
}

type Filtered = Layered<reload::Layer<LevelFilter, Registry>, Registry>;
type FormatLayer = Box<dyn Layer<Filtered> + Send + Sync>;

struct Installed {
    level: reload::Handle<LevelFilter, Registry>,
    format: reload::Handle<FormatLayer, Filtered>,
    current_format: RwLock<LogFormat>,
}

static INSTALLED: OnceLock<Installed> = OnceLock::new();

fn format_layer(format: LogFormat) -> FormatLayer {
    let layer = tracing_subscriber::fmt::layer().with_target(false);
    match format {
        LogFormat::Console => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// Installs the global `tracing` subscriber once.
///
/// Returns `false` if a subscriber was already installed.
pub fn init(format: LogFormat, level: LevelFilter) -> bool {
    let (level_layer, level_handle) = reload::Layer::new(level);
    let (fmt_layer, format_handle) = reload::Layer::new(format_layer(format));
    let installed = tracing_subscriber::registry()
        .with(level_layer)
        .with(fmt_layer)
        .try_init()
        .is_ok();
    installed
        && INSTALLED
            .set(Installed {
                level: level_handle,
                format: format_handle,
                current_format: RwLock::new(format),
            })
            .is_ok()
}

/// Changes the level of the subscriber installed by [`init`].
///
/// Returns `false` when no subscriber was installed or the reload failed.
pub fn reload_level(level: LevelFilter) -> bool {
    let Some(installed) = INSTALLED.get() else {
        return false;
    };
    match installed.level.reload(level) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(error = %err, "log level reload failed");
            false
        }
    }
}

/// Swaps the output format of the subscriber installed by [`init`].
pub fn reload_format(format: LogFormat) -> bool {
    let Some(installed) = INSTALLED.get() else {
        return false;
    };
    let mut current = installed.current_format.write();
    if *current == format {
        return true;
    }
    match installed.format.reload(format_layer(format)) {
        Ok(()) => {
            *current = format;
            true
        }
        Err(err) => {
            tracing::warn!(error = %err, "log format reload failed");
            false
        }
    }
}

/// Level and format of the installed subscriber, if [`init`] succeeded.
pub fn installed_settings() -> Option<(LevelFilter, LogFormat)> {
    let installed = INSTALLED.get()?;
    let level = installed.level.clone_current()?;
    Some((level, *installed.current_format.read()))
}

/// Applies `app_log_level` and `app_log_formatter` changes to the global subscriber.
///
/// Attached as an observer of the root context when `app_log_install` is set.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubscriberControl;

impl Configurable for SubscriberControl {
    fn on_config_change(&self, changes: &ConfigMap) {
        if let Some(level) = changes.get(keys::LOG_LEVEL).and_then(|v| parse_level(v)) {
            reload_level(level);
        }
        if let Some(format) = changes
            .get(keys::LOG_FORMATTER)
            .and_then(|v| v.parse::<LogFormat>().ok())
        {
            reload_format(format);
        }
    }
}

/// Named logger bound to a context.
pub struct Logger {
    name: String,
    trace_id: String,
    level: RwLock<LevelFilter>,
    format: RwLock<LogFormat>,
}

impl Logger {
    /// Creates a logger.
    pub fn new(
        name: impl Into<String>,
        trace_id: impl Into<String>,
        level: LevelFilter,
        format: LogFormat,
    ) -> Self {
        Self {
            name: name.into(),
            trace_id: trace_id.into(),
            level: RwLock::new(level),
            format: RwLock::new(format),
        }
    }

    /// Builds a logger from string config entries.
    pub(crate) fn from_config(name: &str, trace_id: &str, config: &ConfigMap) -> Self {
        let level = config
            .get(keys::LOG_LEVEL)
            .and_then(|v| parse_level(v))
            .unwrap_or(LevelFilter::INFO);
        let format = config
            .get(keys::LOG_FORMATTER)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        Self::new(name, trace_id, level, format)
    }

    /// Derives a logger inheriting level and format.
    pub(crate) fn child(&self, name: &str, trace_id: &str) -> Self {
        Self::new(name, trace_id, self.level(), self.format())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Current level.
    pub fn level(&self) -> LevelFilter {
        *self.level.read()
    }

    /// Changes the level.
    pub fn set_level(&self, level: LevelFilter) {
        *self.level.write() = level;
    }

    /// Current format.
    pub fn format(&self) -> LogFormat {
        *self.format.read()
    }

    /// True if records at `level` pass the logger's own filter.
    pub fn enabled(&self, level: Level) -> bool {
        level <= self.level()
    }

    /// Emits a record at `level`.
    pub fn log(&self, level: Level, message: impl fmt::Display) {
        if !self.enabled(level) {
            return;
        }
        let (name, trace_id) = (self.name.as_str(), self.trace_id.as_str());
        match level {
            Level::ERROR => tracing::error!(logger = name, trace_id, "{message}"),
            Level::WARN => tracing::warn!(logger = name, trace_id, "{message}"),
            Level::INFO => tracing::info!(logger = name, trace_id, "{message}"),
            Level::DEBUG => tracing::debug!(logger = name, trace_id, "{message}"),
            Level::TRACE => tracing::trace!(logger = name, trace_id, "{message}"),
        }
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.log(Level::ERROR, message);
    }

    pub fn warn(&self, message: impl fmt::Display) {
        self.log(Level::WARN, message);
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.log(Level::INFO, message);
    }

    pub fn debug(&self, message: impl fmt::Display) {
        self.log(Level::DEBUG, message);
    }

    pub fn trace(&self, message: impl fmt::Display) {
        self.log(Level::TRACE, message);
    }
}

impl Configurable for Logger {
    fn on_config_change(&self, changes: &ConfigMap) {
        if let Some(level) = changes.get(keys::LOG_LEVEL).and_then(|v| parse_level(v)) {
            self.set_level(level);
        }
        if let Some(format) = changes
            .get(keys::LOG_FORMATTER)
            .and_then(|v| v.parse::<LogFormat>().ok())
        {
            *self.format.write() = format;
        }
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("name", &self.name)
            .field("trace_id", &self.trace_id)
            .field("level", &self.level())
            .finish()
    }
}
