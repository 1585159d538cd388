//! # Listener registry and dispatcher.
//!
//! [`Bus`] keeps a copy-on-write map of channel listeners and implements the
//! dispatch algorithm shared by every event in the process.
//!
//! ## Architecture
//! ```text
//! Kernel::publish(event) ──► Bus::deliver(event, services)
//!                                 │
//!                                 ├─► listeners[channel]  (registration order)
//!                                 ├─► ready services      (registration order)
//!                                 │     stop at first ack unless broadcast
//!                                 │
//!                                 ├─ LOG, unclaimed       ─► default writer
//!                                 └─ APP_ERROR, unclaimed ─► reroute to APP_UNHANDLED
//!                                                              ├─► listeners + services (targeted)
//!                                                              └─► still unclaimed: log it
//! ```
//!
//! ## Rules
//! - Readers never lock: `deliver` works on an [`ArcSwap`] snapshot.
//! - Every handler runs guarded; a failure is escalated and the next handler still runs.
//! - A service failure first offers the error to the service's `on_failure`.
//! - The in-flight counter covers the whole delivery, including the unhandled fallback.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use arc_swap::ArcSwap;

use super::channel::{APP_ERROR, APP_UNHANDLED, ChannelId, LOG};
use super::event::Event;
use crate::error::{BoxError, guarded};
use crate::logging::writer;
use crate::services::ServiceRegistry;

/// Event listener callback.
pub type Listener = Arc<dyn Fn(&Event) -> Result<(), BoxError> + Send + Sync + 'static>;

/// Token returned by [`Bus::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId {
    channel: ChannelId,
    seq: u64,
}

impl ListenerId {
    /// Channel the listener is registered on.
    pub fn channel(&self) -> ChannelId {
        self.channel
    }
}

#[derive(Clone)]
struct Registered {
    id: ListenerId,
    listener: Listener,
}

type ListenerMap = HashMap<ChannelId, Arc<[Registered]>>;

/// Channel-keyed listener registry plus the dispatch loop.
pub(crate) struct Bus {
    listeners: ArcSwap<ListenerMap>,
    next_seq: AtomicU64,
    in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Bus {
    pub(crate) fn new() -> Self {
        Self {
            listeners: ArcSwap::from_pointee(HashMap::new()),
            next_seq: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Appends a listener to `channel`.
    pub(crate) fn subscribe(&self, channel: ChannelId, listener: Listener) -> ListenerId {
        let id = ListenerId {
            channel,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let entry = Registered { id, listener };
        self.listeners.rcu(|current| {
            let mut next = ListenerMap::clone(current);
            let mut list: Vec<Registered> = next
                .get(&channel)
                .map(|l| l.to_vec())
                .unwrap_or_default();
            list.push(entry.clone());
            next.insert(channel, list.into());
            next
        });
        id
    }

    /// Removes a listener; returns `false` if it was not registered.
    pub(crate) fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut removed = false;
        self.listeners.rcu(|current| {
            removed = false;
            let mut next = ListenerMap::clone(current);
            if let Some(list) = next.get(&id.channel) {
                let kept: Vec<Registered> =
                    list.iter().filter(|r| r.id != id).cloned().collect();
                removed = kept.len() != list.len();
                if kept.is_empty() {
                    next.remove(&id.channel);
                } else {
                    next.insert(id.channel, kept.into());
                }
            }
            next
        });
        removed
    }

    /// Total number of registered listeners.
    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.load().values().map(|l| l.len()).sum()
    }

    /// Listeners registered on `channel`.
    pub(crate) fn listener_count_of(&self, channel: ChannelId) -> usize {
        self.listeners.load().get(&channel).map_or(0, |l| l.len())
    }

    /// Deliveries currently running.
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Drops every listener.
    pub(crate) fn clear(&self) {
        self.listeners.store(Arc::new(HashMap::new()));
    }

    /// Runs the dispatch algorithm for an event already marked as sent.
    pub(crate) fn deliver(&self, event: &Arc<Event>, services: &ServiceRegistry) {
        let _guard = InFlight::enter(&self.in_flight);

        self.visit(event, services, event.is_broadcast());
        if event.is_acknowledged() {
            return;
        }
        if event.is(LOG) {
            writer::write_record(event);
        } else if event.is(APP_ERROR) {
            event.reroute(APP_UNHANDLED);
            if !self.visit(event, services, false) {
                writer::log_unhandled(event);
            }
        }
    }

    /// Offers the event to listeners, then to ready services; returns the claim state.
    fn visit(&self, event: &Arc<Event>, services: &ServiceRegistry, broadcast: bool) -> bool {
        if !broadcast && event.is_acknowledged() {
            return true;
        }

        let listeners = self.listeners.load().get(&event.channel()).cloned();
        for registered in listeners.iter().flat_map(|l| l.iter()) {
            if let Err(err) = guarded(|| (registered.listener)(event)) {
                event
                    .context()
                    .send_event_error(Some(Arc::new(Arc::clone(event))), Arc::new(err));
            }
            if !broadcast && event.is_acknowledged() {
                return true;
            }
        }

        for entry in services.ready() {
            if let Err(err) = guarded(|| entry.service().on_event(event)) {
                entry.fail(event, err);
            }
            if !broadcast && event.is_acknowledged() {
                return true;
            }
        }
        event.is_acknowledged()
    }
}
