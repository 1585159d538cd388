//! # Process-wide channel registry.
//!
//! Channels are named integer ids for classes of events. Names are registered once
//! and resolve to the same [`ChannelId`] for the lifetime of the process.
//!
//! ## Rules
//! - `register_channel_id(name)` is idempotent: the same name returns the same id.
//! - Ids are assigned monotonically and never reused.
//! - Built-in lifecycle channels are seeded at fixed ids (`0..BUILTIN.len()`), so
//!   they are usable as constants.
//!
//! ```rust
//! use servisor::{channel_id_of, event_name_of, register_channel_id};
//!
//! let id = register_channel_id("ORDER_PLACED");
//! assert_eq!(register_channel_id("ORDER_PLACED"), id);
//! assert_eq!(event_name_of(id).as_deref(), Some("ORDER_PLACED"));
//! assert_eq!(channel_id_of("ORDER_PLACED"), Some(id));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use parking_lot::RwLock;

/// Stable integer identifier of an event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u32);

impl ChannelId {
    /// Raw numeric value.
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Registered name, or `#<id>` for unknown ids.
    pub fn name(self) -> String {
        event_name_of(self).unwrap_or_else(|| format!("#{}", self.0))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Application started (broadcast once boot completes).
pub const APP_START: ChannelId = ChannelId(0);
/// Application shutdown requested (broadcast; triggers graceful stop).
pub const APP_SHUTDOWN: ChannelId = ChannelId(1);
/// Service registered (broadcast after a successful start) or start request.
pub const SERVICE_REGISTER: ChannelId = ChannelId(2);
/// Service unregistered (broadcast after stop) or stop request.
pub const SERVICE_UNREGISTER: ChannelId = ChannelId(3);
/// Scheduler registered (broadcast).
pub const SCHEDULER_REGISTER: ChannelId = ChannelId(4);
/// Scheduler unregistered (broadcast).
pub const SCHEDULER_UNREGISTER: ChannelId = ChannelId(5);
/// Periodic heartbeat (broadcast, payload: `Supervisor`).
pub const APP_HEARTBEAT: ChannelId = ChannelId(6);
/// Configuration change (broadcast, payload: `ConfigMap`).
pub const CONFIG_CHANGE: ChannelId = ChannelId(7);
/// Escalated failure.
pub const APP_ERROR: ChannelId = ChannelId(8);
/// Escalation sink for errors nobody claimed.
pub const APP_UNHANDLED: ChannelId = ChannelId(9);
/// Memory pressure warning (broadcast; unacknowledged forces shutdown).
pub const APP_OOM: ChannelId = ChannelId(10);
/// Log records (payload: `LogRecord`); unclaimed records go to the default writer.
pub const LOG: ChannelId = ChannelId(11);
/// Metric updates (payload: `MetricUpdate`).
pub const METRIC_UPDATE: ChannelId = ChannelId(12);

const BUILTIN: [&str; 13] = [
    "APP_START",
    "APP_SHUTDOWN",
    "SERVICE_REGISTER",
    "SERVICE_UNREGISTER",
    "SCHEDULER_REGISTER",
    "SCHEDULER_UNREGISTER",
    "APP_HEARTBEAT",
    "CONFIG_CHANGE",
    "APP_ERROR",
    "APP_UNHANDLED",
    "APP_OOM",
    "LOG",
    "METRIC_UPDATE",
];

struct ChannelTable {
    by_name: HashMap<String, ChannelId>,
    names: Vec<String>,
}

impl ChannelTable {
    fn seeded() -> Self {
        let mut table = Self {
            by_name: HashMap::new(),
            names: Vec::new(),
        };
        for name in BUILTIN {
            table.insert(name);
        }
        table
    }

    fn insert(&mut self, name: &str) -> ChannelId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = ChannelId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.by_name.insert(name.to_string(), id);
        id
    }
}

static CHANNELS: LazyLock<RwLock<ChannelTable>> = LazyLock::new(|| RwLock::new(ChannelTable::seeded()));

/// Registers a channel name and returns its id (idempotent).
pub fn register_channel_id(name: &str) -> ChannelId {
    if let Some(id) = CHANNELS.read().by_name.get(name) {
        return *id;
    }
    CHANNELS.write().insert(name)
}

/// Returns the name registered for `id`.
pub fn event_name_of(id: ChannelId) -> Option<String> {
    CHANNELS.read().names.get(id.0 as usize).cloned()
}

/// Returns the id registered for `name`.
pub fn channel_id_of(name: &str) -> Option<ChannelId> {
    CHANNELS.read().by_name.get(name).copied()
}

/// Drops every custom channel and re-seeds the built-ins.
///
/// Test hook only: ids handed out before the reset become dangling.
#[doc(hidden)]
pub fn reset_channels_for_tests() {
    *CHANNELS.write() = ChannelTable::seeded();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_have_fixed_ids() {
        assert_eq!(channel_id_of("APP_START"), Some(APP_START));
        assert_eq!(channel_id_of("METRIC_UPDATE"), Some(METRIC_UPDATE));
        assert_eq!(event_name_of(APP_UNHANDLED).as_deref(), Some("APP_UNHANDLED"));
    }

    #[test]
    fn registration_is_idempotent() {
        let first = register_channel_id("channel-test-idempotent");
        for _ in 0..10 {
            assert_eq!(register_channel_id("channel-test-idempotent"), first);
        }
        assert_eq!(
            event_name_of(first).as_deref(),
            Some("channel-test-idempotent")
        );
    }

    #[test]
    fn ids_are_monotonic() {
        let a = register_channel_id("channel-test-mono-a");
        let b = register_channel_id("channel-test-mono-b");
        assert!(b > a);
        assert!(a.as_u32() >= BUILTIN.len() as u32);
    }

    #[test]
    fn unknown_ids_render_numerically() {
        assert_eq!(ChannelId::from_raw(u32::MAX).name(), format!("#{}", u32::MAX));
        assert_eq!(channel_id_of("channel-test-never-registered"), None);
    }
}
