//! # Reserved keys and the config-key registry.
//!
//! Keys are normalized before every lookup: `.`, `-`, `+` and `:` become `_` and
//! the result is lowercased, so `APP.LOG-LEVEL`, `app_log_level` and the
//! environment variable `APP_LOG_LEVEL` all address the same entry.
//!
//! Registered keys (with a description) are listed by the `help` flag.

use std::sync::LazyLock;

use indexmap::IndexMap;
use parking_lot::RwLock;

use super::ConfigMap;

pub const HELP: &str = "help";
pub const PARAMS_PRINT: &str = "app_params_print";
pub const OOM_SHUTDOWN_THRESHOLD: &str = "app_oom_shutdown_threshold";
pub const THREAD_SHUTDOWN_TIMEOUT_MS: &str = "app_thread_shutdown_timeout_ms";
pub const SERVICE_SHUTDOWN_PARALLEL: &str = "app_service_shutdown_parallel";
pub const ENV_PROD: &str = "app_env_prod";
pub const HEARTBEAT_MS: &str = "app_heartbeat_ms";
pub const CLEANUP_MS: &str = "app_cleanup_ms";
pub const TASK_WAIT_TIMEOUT_MS: &str = "app_task_wait_timeout_ms";
pub const WORKER_THREADS: &str = "app_worker_threads";
pub const LOG_LEVEL: &str = "app_log_level";
pub const LOG_FORMATTER: &str = "app_log_formatter";
pub const LOG_INSTALL: &str = "app_log_install";
pub const PROFILES: &str = "app_profiles";
pub const CONFIG_PATH: &str = "app_config_path";

const BUILTIN: [(&str, &str); 15] = [
    (HELP, "Lists all registered config keys"),
    (PARAMS_PRINT, "Prints the resolved configuration at startup"),
    (
        OOM_SHUTDOWN_THRESHOLD,
        "Memory usage percentage that triggers a shutdown (<= 0 disables)",
    ),
    (
        THREAD_SHUTDOWN_TIMEOUT_MS,
        "Grace period for schedulers and the worker pool on shutdown",
    ),
    (SERVICE_SHUTDOWN_PARALLEL, "Stops services in parallel"),
    (ENV_PROD, "Production mode: exit the process after shutdown"),
    (HEARTBEAT_MS, "Heartbeat period"),
    (CLEANUP_MS, "Memory check and scheduler sweep period"),
    (TASK_WAIT_TIMEOUT_MS, "Bound for blocking task group waits"),
    (WORKER_THREADS, "Worker threads of the shared pool (0 = default)"),
    (LOG_LEVEL, "Log level [error, warn, info, debug, trace, off]"),
    (LOG_FORMATTER, "Log format [console, json]"),
    (LOG_INSTALL, "Installs the global tracing subscriber"),
    (PROFILES, "Comma separated profiles loading application-<profile>.properties"),
    (CONFIG_PATH, "Path of the base properties file"),
];

const SECRET_MARKERS: [&str; 6] = ["auth", "credential", "password", "private", "secret", "token"];

static KEYS: LazyLock<RwLock<IndexMap<String, String>>> = LazyLock::new(|| RwLock::new(seeded()));

fn seeded() -> IndexMap<String, String> {
    BUILTIN
        .iter()
        .map(|(k, d)| (k.to_string(), d.to_string()))
        .collect()
}

/// Normalizes a key: separators become `_`, everything is lowercased.
///
/// ```rust
/// use servisor::normalize_key;
///
/// assert_eq!(normalize_key("App.Log-Level"), "app_log_level");
/// assert_eq!(normalize_key("a+b:c"), "a_b_c");
/// ```
pub fn normalize_key(key: &str) -> String {
    key.trim()
        .chars()
        .map(|c| match c {
            '.' | '-' | '+' | ':' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// Registers a key with a description for the help text; returns the normalized key.
pub fn register_config_key(key: &str, description: &str) -> String {
    let key = normalize_key(key);
    KEYS.write().insert(key.clone(), description.to_string());
    key
}

/// Registered keys and their descriptions.
pub fn config_keys() -> Vec<(String, String)> {
    KEYS.read()
        .iter()
        .map(|(k, d)| (k.clone(), d.clone()))
        .collect()
}

#[doc(hidden)]
pub fn reset_config_keys_for_tests() {
    *KEYS.write() = seeded();
}

/// True if the key looks like it holds a credential.
pub fn is_secret(key: &str) -> bool {
    let key = normalize_key(key);
    SECRET_MARKERS.iter().any(|m| key.contains(m))
}

/// Value as printed: secrets are masked.
pub fn masked(key: &str, value: &str) -> String {
    if is_secret(key) {
        "****".to_string()
    } else {
        value.to_string()
    }
}

/// Help text listing every registered key.
pub fn help_text() -> String {
    let keys = config_keys();
    let width = keys.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    let mut out = String::from("Configuration keys (file < env < property < --cli):\n");
    for (key, description) in keys {
        out.push_str(&format!("  {key:<width$}  {description}\n"));
    }
    out
}

/// Sorted `key=value` listing with secrets masked.
pub fn params_text(config: &ConfigMap) -> String {
    let mut entries: Vec<(&String, &String)> = config.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    let mut out = String::new();
    for (key, value) in entries {
        out.push_str(&format!("{key}={}\n", masked(key, value)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_masked() {
        assert_eq!(masked("db.password", "hunter2"), "****");
        assert_eq!(masked("API_TOKEN", "t"), "****");
        assert_eq!(masked("app_name", "demo"), "demo");
    }

    #[test]
    fn help_lists_builtins_and_custom_keys() {
        let key = register_config_key("Keys.Test-Custom", "custom test key");
        assert_eq!(key, "keys_test_custom");
        let help = help_text();
        assert!(help.contains(OOM_SHUTDOWN_THRESHOLD));
        assert!(help.contains("keys_test_custom"));
        assert!(help.contains("custom test key"));
    }

    #[test]
    fn params_are_sorted_and_masked() {
        let mut map = ConfigMap::new();
        map.insert("b_secret".into(), "x".into());
        map.insert("a".into(), "1".into());
        assert_eq!(params_text(&map), "a=1\nb_secret=****\n");
    }
}
