//! # Typed runtime configuration.
//!
//! [`Config`] is the typed view over the reserved keys of a [`ConfigMap`].
//! It is built once at boot and patched on every `CONFIG_CHANGE`.
//!
//! ## Sentinel values
//! - `oom_threshold <= 0` → memory check disabled
//! - `worker_threads = 0` → tokio default (one per core)

use std::str::FromStr;
use std::time::Duration;

use tracing::level_filters::LevelFilter;

use super::ConfigMap;
use super::keys;
use crate::logging::{LogFormat, parse_level};

/// Runtime configuration.
///
/// ## Field semantics
/// - `shutdown_timeout`: grace period for schedulers and the pool on stop
/// - `heartbeat` / `cleanup`: periods of the two built-in schedulers
/// - `task_wait_timeout`: bound for `run_await` and boot-time service waits
/// - `production`: exit the process with the recorded code after stop
#[derive(Clone, Debug)]
pub struct Config {
    /// Memory usage percentage that forces a shutdown.
    pub oom_threshold: f64,

    /// Grace period for schedulers and the worker pool on shutdown.
    pub shutdown_timeout: Duration,

    /// Stop services concurrently instead of in reverse order.
    pub parallel_shutdown: bool,

    /// Call `process::exit` once stopped.
    pub production: bool,

    pub heartbeat: Duration,
    pub cleanup: Duration,
    pub task_wait_timeout: Duration,
    pub worker_threads: usize,

    pub log_level: LevelFilter,
    pub log_format: LogFormat,
    /// Install the global `tracing` subscriber at boot.
    pub log_install: bool,

    /// Print help text instead of starting services.
    pub help: bool,
    /// Print the resolved configuration at boot.
    pub print_params: bool,
}

impl Config {
    /// Typed view over `map`; unknown or malformed values keep their defaults.
    pub fn from_map(map: &ConfigMap) -> Self {
        let mut cfg = Self::default();
        cfg.apply(map);
        cfg
    }

    /// Patches fields present in `changes`.
    pub fn apply(&mut self, changes: &ConfigMap) {
        if let Some(v) = parse::<f64>(changes, keys::OOM_SHUTDOWN_THRESHOLD) {
            self.oom_threshold = v;
        }
        if let Some(v) = parse_ms(changes, keys::THREAD_SHUTDOWN_TIMEOUT_MS) {
            self.shutdown_timeout = v;
        }
        if let Some(v) = parse_bool(changes, keys::SERVICE_SHUTDOWN_PARALLEL) {
            self.parallel_shutdown = v;
        }
        if let Some(v) = parse_bool(changes, keys::ENV_PROD) {
            self.production = v;
        }
        if let Some(v) = parse_ms(changes, keys::HEARTBEAT_MS).filter(|d| !d.is_zero()) {
            self.heartbeat = v;
        }
        if let Some(v) = parse_ms(changes, keys::CLEANUP_MS).filter(|d| !d.is_zero()) {
            self.cleanup = v;
        }
        if let Some(v) = parse_ms(changes, keys::TASK_WAIT_TIMEOUT_MS) {
            self.task_wait_timeout = v;
        }
        if let Some(v) = parse::<usize>(changes, keys::WORKER_THREADS) {
            self.worker_threads = v;
        }
        if let Some(v) = changes.get(keys::LOG_LEVEL).and_then(|v| parse_level(v)) {
            self.log_level = v;
        }
        if let Some(v) = parse::<LogFormat>(changes, keys::LOG_FORMATTER) {
            self.log_format = v;
        }
        if let Some(v) = parse_bool(changes, keys::LOG_INSTALL) {
            self.log_install = v;
        }
        if let Some(v) = parse_bool(changes, keys::HELP) {
            self.help = v;
        }
        if let Some(v) = parse_bool(changes, keys::PARAMS_PRINT) {
            self.print_params = v;
        }
    }

    /// OOM threshold as an `Option`.
    ///
    /// - `None` → memory check disabled
    /// - `Some(p)` → shut down above `p` percent
    #[inline]
    pub fn oom_limit(&self) -> Option<f64> {
        (self.oom_threshold > 0.0).then_some(self.oom_threshold)
    }

    /// Worker thread count as an `Option` (`None` = tokio default).
    #[inline]
    pub fn worker_limit(&self) -> Option<usize> {
        (self.worker_threads > 0).then_some(self.worker_threads)
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `oom_threshold = 98`
    /// - `shutdown_timeout = 500ms`
    /// - `heartbeat = cleanup = 256ms`
    /// - `task_wait_timeout = 10s`
    /// - sequential service shutdown, no process exit, info level
    fn default() -> Self {
        Self {
            oom_threshold: 98.0,
            shutdown_timeout: Duration::from_millis(500),
            parallel_shutdown: false,
            production: false,
            heartbeat: Duration::from_millis(256),
            cleanup: Duration::from_millis(256),
            task_wait_timeout: Duration::from_secs(10),
            worker_threads: 0,
            log_level: LevelFilter::INFO,
            log_format: LogFormat::Console,
            log_install: false,
            help: false,
            print_params: false,
        }
    }
}

fn parse<T: FromStr>(map: &ConfigMap, key: &str) -> Option<T> {
    map.get(key)?.trim().parse().ok()
}

fn parse_ms(map: &ConfigMap, key: &str) -> Option<Duration> {
    parse::<u64>(map, key).map(Duration::from_millis)
}

/// Lenient boolean: `true/false`, `yes/no`, `on/off`, `1/0`; empty means `true`.
pub fn parse_bool(map: &ConfigMap, key: &str) -> Option<bool> {
    match map.get(key)?.trim().to_ascii_lowercase().as_str() {
        "" | "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}
