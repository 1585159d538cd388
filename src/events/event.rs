//! # Event envelope and acknowledgement protocol.
//!
//! An [`Event`] carries a channel id, an opaque payload, the originating
//! [`Context`] and the claim state used by the dispatcher:
//!
//! ```text
//! created ──► dispatching ──► acknowledged     (some handler called acknowledge()/respond())
//!                         └─► unacknowledged   (nobody claimed it; the event is lost)
//! ```
//!
//! ## Rules
//! - Acknowledgement is a one-way latch.
//! - An event is dispatched at most once; the second attempt fails.
//! - The channel only changes when an unclaimed error is re-routed to
//!   [`APP_UNHANDLED`](super::APP_UNHANDLED); the original id is kept in the scratch map.
//!
//! ## Example
//! ```rust
//! use servisor::{Context, register_channel_id};
//!
//! let ctx = Context::root();
//! let greet = register_channel_id("GREET");
//! let ev = ctx.new_event(greet).payload("hello".to_string()).build();
//!
//! assert_eq!(ev.payload::<String>().map(String::as_str), Some("hello"));
//! assert!(!ev.is_acknowledged());
//! ev.respond(42_u32);
//! assert!(ev.is_acknowledged());
//! assert_eq!(ev.response::<u32>().as_deref(), Some(&42));
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;

use super::channel::{ChannelId, event_name_of};
use crate::context::Context;
use crate::error::{RuntimeError, SharedError};

/// Opaque, shareable value (payloads, responses, context entries).
pub type Value = Arc<dyn Any + Send + Sync>;

type ResponseFn = Box<dyn Fn(&Event) + Send + Sync>;

/// Scratch key holding the channel an escalated error originated from.
pub(crate) const META_ORIGINAL_CHANNEL: &str = "original_channel";

/// Message envelope dispatched through the bus.
pub struct Event {
    channel: AtomicU32,
    created_at: SystemTime,
    context: Context,
    payload: Option<Value>,
    payload_type: &'static str,
    broadcast: bool,
    asynchronous: bool,
    acknowledged: AtomicBool,
    sent: AtomicBool,
    response: Mutex<Option<Value>>,
    on_response: Option<ResponseFn>,
    error: Mutex<Option<SharedError>>,
    scratch: Mutex<HashMap<String, Value>>,
}

impl Event {
    /// Current channel id.
    #[inline]
    pub fn channel(&self) -> ChannelId {
        ChannelId::from_raw(self.channel.load(Ordering::Acquire))
    }

    /// Registered name of the current channel.
    pub fn channel_name(&self) -> String {
        self.channel().name()
    }

    /// True if the event is on channel `id`.
    #[inline]
    pub fn is(&self, id: ChannelId) -> bool {
        self.channel() == id
    }

    /// Creation timestamp.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Context the event was published from.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Payload downcast to `T`.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_deref()?.downcast_ref::<T>()
    }

    /// Raw payload.
    pub fn payload_value(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Type name of the payload (`"()"` when absent).
    pub fn payload_type(&self) -> &'static str {
        self.payload_type
    }

    /// True if every handler is visited regardless of acknowledgement.
    pub fn is_broadcast(&self) -> bool {
        self.broadcast
    }

    /// True if the event is dispatched on the pool instead of the caller's thread.
    pub fn is_async(&self) -> bool {
        self.asynchronous
    }

    /// Claims the event.
    pub fn acknowledge(&self) {
        self.acknowledged.store(true, Ordering::Release);
    }

    /// True once any handler claimed the event.
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::Acquire)
    }

    /// Stores a response, acknowledges the event and notifies the response receiver.
    pub fn respond<T: Any + Send + Sync>(&self, value: T) {
        *self.response.lock() = Some(Arc::new(value));
        self.acknowledge();
        if let Some(receiver) = &self.on_response {
            receiver(self);
        }
    }

    /// Response downcast to `T`.
    pub fn response<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let value = self.response.lock().clone()?;
        value.downcast::<T>().ok()
    }

    /// True if a response was stored.
    pub fn has_response(&self) -> bool {
        self.response.lock().is_some()
    }

    /// Error attached to the event (escalations, failed requests).
    pub fn error(&self) -> Option<SharedError> {
        self.error.lock().clone()
    }

    /// Attaches an error.
    pub fn set_error(&self, error: SharedError) {
        *self.error.lock() = Some(error);
    }

    /// Stores cross-cutting metadata.
    pub fn put_meta<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.scratch.lock().insert(key.into(), Arc::new(value));
    }

    /// Reads cross-cutting metadata.
    pub fn meta<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.scratch.lock().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Channel the event was published on before any re-routing.
    pub fn original_channel(&self) -> ChannelId {
        self.meta::<ChannelId>(META_ORIGINAL_CHANNEL)
            .map(|id| *id)
            .unwrap_or_else(|| self.channel())
    }

    /// One-line description used in logs.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "channel={} payload={}",
            self.channel_name(),
            self.payload_type
        );
        if let Some(text) = self.payload_text() {
            out.push_str(&format!(" value={text:?}"));
        }
        if let Some(inner) = self.payload::<Arc<Event>>() {
            out.push_str(&format!(" source=[{}]", inner.describe()));
        }
        out
    }

    fn payload_text(&self) -> Option<String> {
        if let Some(s) = self.payload::<String>() {
            return Some(s.clone());
        }
        self.payload::<&'static str>().map(|s| (*s).to_string())
    }

    /// Marks the event as sent; fails if it already was.
    pub(crate) fn mark_sent(&self) -> Result<(), RuntimeError> {
        if self.sent.swap(true, Ordering::AcqRel) {
            return Err(RuntimeError::AlreadyDispatched {
                channel: self.channel_name(),
            });
        }
        Ok(())
    }

    /// Moves the event to `channel`, remembering where it came from.
    pub(crate) fn reroute(&self, channel: ChannelId) {
        {
            let mut scratch = self.scratch.lock();
            scratch
                .entry(META_ORIGINAL_CHANNEL.to_string())
                .or_insert_with(|| Arc::new(self.channel()));
        }
        self.channel.store(channel.as_u32(), Ordering::Release);
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("channel", &event_name_of(self.channel()))
            .field("payload", &self.payload_type)
            .field("broadcast", &self.broadcast)
            .field("async", &self.asynchronous)
            .field("acknowledged", &self.is_acknowledged())
            .finish()
    }
}

/// Builder for [`Event`], obtained from [`Context::new_event`].
#[must_use]
pub struct EventBuilder {
    context: Context,
    channel: ChannelId,
    payload: Option<Value>,
    payload_type: &'static str,
    broadcast: bool,
    asynchronous: bool,
    on_response: Option<ResponseFn>,
    error: Option<SharedError>,
}

impl EventBuilder {
    pub(crate) fn new(context: Context, channel: ChannelId) -> Self {
        Self {
            context,
            channel,
            payload: None,
            payload_type: "()",
            broadcast: false,
            asynchronous: false,
            on_response: None,
            error: None,
        }
    }

    /// Sets the payload.
    pub fn payload<T: Any + Send + Sync>(mut self, payload: T) -> Self {
        self.payload_type = std::any::type_name::<T>();
        self.payload = Some(Arc::new(payload));
        self
    }

    /// Sets an already shared payload.
    pub fn payload_value(mut self, payload: Option<Value>, type_name: &'static str) -> Self {
        self.payload_type = if payload.is_some() { type_name } else { "()" };
        self.payload = payload;
        self
    }

    /// Visits every handler regardless of acknowledgement.
    pub fn broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Dispatches on the pool instead of the caller's thread.
    pub fn asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }

    /// Registers a receiver invoked on every [`Event::respond`].
    pub fn on_response(mut self, receiver: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.on_response = Some(Box::new(receiver));
        self
    }

    /// Attaches an error.
    pub fn error(mut self, error: SharedError) -> Self {
        self.error = Some(error);
        self
    }

    /// Builds the event without dispatching it.
    pub fn build(self) -> Arc<Event> {
        Arc::new(Event {
            channel: AtomicU32::new(self.channel.as_u32()),
            created_at: SystemTime::now(),
            context: self.context,
            payload: self.payload,
            payload_type: self.payload_type,
            broadcast: self.broadcast,
            asynchronous: self.asynchronous,
            acknowledged: AtomicBool::new(false),
            sent: AtomicBool::new(false),
            response: Mutex::new(None),
            on_response: self.on_response,
            error: Mutex::new(self.error),
            scratch: Mutex::new(HashMap::new()),
        })
    }

    /// Builds and publishes the event through its context.
    pub fn send(self) -> Result<Arc<Event>, RuntimeError> {
        let context = self.context.clone();
        let event = self.build();
        context.publish(&event)?;
        Ok(event)
    }
}
