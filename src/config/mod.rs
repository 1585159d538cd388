//! Configuration: layered loading, typed view and the config-key registry.
//!
//! ## Contents
//! - [`ConfigMap`] normalized string entries
//! - [`ConfigLoader`] file < env < property < CLI layering with `${key:fallback}`
//! - [`Config`] typed runtime settings
//! - [`keys`] reserved keys, key registry, help and masking
//! - [`Configurable`] hook for objects that react to config changes

mod config;
pub mod keys;
mod loader;

pub use config::{Config, parse_bool};
pub use loader::{ConfigLoader, MAX_PLACEHOLDER_DEPTH, parse_args, parse_properties, parse_toml, resolve_placeholders};

/// Normalized key → raw string value, in insertion order.
pub type ConfigMap = indexmap::IndexMap<String, String>;

/// Receives configuration changes.
///
/// Attached to a [`Context`](crate::Context) with `add_observer`; every string
/// `put` on that context calls it with a single-entry map.
pub trait Configurable: Send + Sync + 'static {
    fn on_config_change(&self, changes: &ConfigMap);
}
