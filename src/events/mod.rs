//! Events: channels, the event envelope and the dispatcher.
//!
//! ## Contents
//! - [`ChannelId`] and the channel registry ([`register_channel_id`], [`event_name_of`], [`channel_id_of`])
//! - built-in lifecycle channels ([`APP_START`], [`APP_SHUTDOWN`], ...)
//! - [`Event`] / [`EventBuilder`] envelope with acknowledgement and responses
//! - `Bus` listener registry and dispatch loop (internal)
//!
//! See `core/mod.rs` for the system-level wiring diagram.

mod bus;
mod channel;
mod event;

pub(crate) use bus::Bus;
pub use bus::{Listener, ListenerId};
pub use channel::{
    APP_ERROR, APP_HEARTBEAT, APP_OOM, APP_SHUTDOWN, APP_START, APP_UNHANDLED, CONFIG_CHANGE,
    ChannelId, LOG, METRIC_UPDATE, SCHEDULER_REGISTER, SCHEDULER_UNREGISTER, SERVICE_REGISTER,
    SERVICE_UNREGISTER, channel_id_of, event_name_of, register_channel_id,
    reset_channels_for_tests,
};
pub use event::{Event, EventBuilder, Value};
pub(crate) use event::META_ORIGINAL_CHANNEL;
