//! # Service registry and lifecycle.
//!
//! The registry owns one [`ServiceEntry`] per service instance (deduplicated by
//! pointer) and drives the readiness transitions.
//!
//! ## Architecture
//! ```text
//! start(ctx, svc) ─► entry_for(svc) ─► ctx.run(
//!                         ready.try_set_if(false → true,
//!                             entry still tracked? else retry with a fresh entry
//!                             svc.start(ctx), failed ─► drop entry
//!                             visible = true
//!                             broadcast SERVICE_REGISTER)
//!                         ├─ ok     ─► METRIC_UPDATE (startup duration)
//!                         └─ failed ─► on_failure, escalate)
//!
//! unregister(ctx, svc) ─► remove entry ─► ready.set_if(true → false,
//!                                             visible = false
//!                                             svc.stop(ctx) (logged)
//!                                             broadcast SERVICE_UNREGISTER)
//! ```
//!
//! ## Rules
//! - Concurrent starts of one instance run `start` once and broadcast once.
//! - A failed start drops its entry inside the readiness critical section, so a
//!   start queued on the same lock never revives an untracked entry.
//! - Dispatch reads `visible` (an atomic mirror of readiness) and never takes the lock.
//! - Stop errors and panics are logged, never propagated.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;

use super::service::{MetricUpdate, Service, ServiceRef};
use crate::context::Context;
use crate::core::LockedBool;
use crate::error::{RuntimeError, TaskError, guarded};
use crate::events::{APP_ERROR, ChannelId, Event, METRIC_UPDATE, SERVICE_REGISTER, SERVICE_UNREGISTER};
use crate::tasks::TaskHandle;

/// Registered service with its readiness state.
pub(crate) struct ServiceEntry {
    service: ServiceRef,
    ready: LockedBool,
    visible: AtomicBool,
}

impl ServiceEntry {
    fn new(service: ServiceRef) -> Self {
        Self {
            service,
            ready: LockedBool::new(false),
            visible: AtomicBool::new(false),
        }
    }

    pub(crate) fn service(&self) -> &dyn Service {
        self.service.service()
    }

    fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Acquire)
    }

    /// Offers a failure to the service, then escalates it unless claimed.
    pub(crate) fn fail(&self, source: &Arc<Event>, err: TaskError) {
        let source_ctx = source.context().clone();
        let service = self.service.clone();
        source_ctx.escalate_with(
            Some(Arc::new(Arc::clone(source))),
            std::any::type_name::<Arc<Event>>(),
            Arc::new(err),
            move |error_event| {
                if service.service().on_failure(error_event).is_some() {
                    tracing::debug!(service = service.name(), "on_failure returned a value");
                }
            },
        );
    }
}

/// Copy-on-write list of service entries.
#[derive(Clone)]
pub(crate) struct ServiceRegistry {
    entries: Arc<ArcSwap<Vec<Arc<ServiceEntry>>>>,
}

impl ServiceRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Arc::new(ArcSwap::from_pointee(Vec::new())),
        }
    }

    /// Existing entry for the instance, or a new (not ready) one.
    fn entry_for(&self, service: &ServiceRef) -> Arc<ServiceEntry> {
        let key = service.key();
        let mut found = None;
        self.entries.rcu(|current| {
            if let Some(entry) = current.iter().find(|e| e.service.key() == key) {
                found = Some(Arc::clone(entry));
                return Arc::clone(current);
            }
            let entry = Arc::new(ServiceEntry::new(service.clone()));
            found = Some(Arc::clone(&entry));
            let mut next = Vec::clone(current);
            next.push(entry);
            Arc::new(next)
        });
        found.unwrap_or_else(|| Arc::new(ServiceEntry::new(service.clone())))
    }

    fn remove(&self, key: usize) -> Option<Arc<ServiceEntry>> {
        let mut removed = None;
        self.entries.rcu(|current| {
            removed = current.iter().find(|e| e.service.key() == key).cloned();
            if removed.is_none() {
                return Arc::clone(current);
            }
            Arc::new(
                current
                    .iter()
                    .filter(|e| e.service.key() != key)
                    .cloned()
                    .collect::<Vec<_>>(),
            )
        });
        removed
    }

    /// Ready entries in registration order.
    pub(crate) fn ready(&self) -> Vec<Arc<ServiceEntry>> {
        self.entries
            .load()
            .iter()
            .filter(|e| e.is_visible())
            .cloned()
            .collect()
    }

    /// Ready services.
    pub(crate) fn services(&self) -> Vec<ServiceRef> {
        self.ready().iter().map(|e| e.service.clone()).collect()
    }

    /// First ready service of type `S`.
    pub(crate) fn find<S: Service>(&self) -> Option<Arc<S>> {
        self.ready().iter().find_map(|e| e.service.downcast::<S>())
    }

    /// Registered service with this name (ready or starting).
    pub(crate) fn find_by_name(&self, name: &str) -> Option<ServiceRef> {
        self.entries
            .load()
            .iter()
            .find(|e| e.service.name() == name)
            .map(|e| e.service.clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub(crate) fn clear(&self) {
        self.entries.store(Arc::new(Vec::new()));
    }

    fn is_tracked(&self, entry: &Arc<ServiceEntry>) -> bool {
        self.entries.load().iter().any(|e| Arc::ptr_eq(e, entry))
    }

    fn remove_entry(&self, entry: &Arc<ServiceEntry>) {
        self.entries.rcu(|current| {
            current
                .iter()
                .filter(|e| !Arc::ptr_eq(e, entry))
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    /// Starts the service on the pool.
    pub(crate) fn start(&self, ctx: &Context, service: ServiceRef) -> Result<TaskHandle, RuntimeError> {
        let first = self.entry_for(&service);
        let registry = self.clone();
        let owner = ctx.new_context(service.name());

        owner.run(move |ctx| {
            let mut entry = first;
            loop {
                let begin = Instant::now();
                let outcome = entry.ready.try_set_if(false, true, || {
                    if !registry.is_tracked(&entry) {
                        return Err(StartError::Superseded);
                    }
                    if let Err(err) = guarded(|| entry.service().start(ctx)) {
                        registry.remove_entry(&entry);
                        return Err(StartError::Failed(err));
                    }
                    entry.visible.store(true, Ordering::Release);
                    announce(ctx, SERVICE_REGISTER, entry.service.clone(), false);
                    Ok(())
                });

                match outcome {
                    None => return Ok(()),
                    // A failed start dropped this entry while we waited for its lock.
                    Some(Err(StartError::Superseded)) => entry = registry.entry_for(&service),
                    Some(Ok(())) => {
                        let took = begin.elapsed();
                        tracing::info!(service = entry.service.name(), ?took, "service started");
                        let metric = MetricUpdate::new(format!("service.{}.start", entry.service.name()), took);
                        announce(ctx, METRIC_UPDATE, metric, true);
                        return Ok(());
                    }
                    Some(Err(StartError::Failed(err))) => {
                        tracing::warn!(service = entry.service.name(), error = %err, "service failed to start");
                        report_start_failure(ctx, &entry, err);
                        return Ok(());
                    }
                }
            }
        })
    }

    /// Removes the service and stops it if it was ready.
    pub(crate) fn unregister(&self, ctx: &Context, service: &ServiceRef) -> bool {
        let Some(entry) = self.remove(service.key()) else {
            return false;
        };
        entry.ready.set_if(true, false, || {
            entry.visible.store(false, Ordering::Release);
            if let Err(err) = guarded(|| entry.service().stop(ctx)) {
                tracing::warn!(service = entry.service.name(), error = %err, "service stop failed");
            }
            announce(ctx, SERVICE_UNREGISTER, entry.service.clone(), false);
        })
    }

    /// Stops every service: reverse order, or all at once when `parallel`.
    pub(crate) fn stop_all(&self, ctx: &Context, parallel: bool, timeout: Duration) {
        let entries: Vec<Arc<ServiceEntry>> = self.entries.load().iter().cloned().collect();
        if !parallel {
            for entry in entries.iter().rev() {
                self.unregister(ctx, &entry.service);
            }
            return;
        }

        let mut handles = Vec::with_capacity(entries.len());
        for entry in entries {
            let registry = self.clone();
            match ctx.run(move |ctx| {
                registry.unregister(ctx, &entry.service);
                Ok(())
            }) {
                Ok(handle) => handles.push(handle),
                Err(err) => tracing::error!(error = %err, "[fatal] could not schedule service stop"),
            }
        }
        if TaskHandle::wait_for(&handles, timeout).is_err() {
            tracing::error!("[fatal] parallel service shutdown did not complete");
        }
        if handles.iter().any(|h| h.error().is_some()) {
            tracing::error!("[fatal] parallel service shutdown failed");
        }
    }
}

enum StartError {
    Superseded,
    Failed(TaskError),
}

/// Broadcasts a lifecycle event; a detached context or closed pool is only logged.
fn announce<T: Any + Send + Sync>(ctx: &Context, channel: ChannelId, payload: T, asynchronous: bool) {
    let sent = ctx
        .new_event(channel)
        .payload(payload)
        .broadcast(true)
        .asynchronous(asynchronous)
        .send();
    if let Err(err) = sent {
        tracing::debug!(%channel, error = %err, "lifecycle broadcast dropped");
    }
}

/// Builds the error event for a failed start, offers it to `on_failure`, then escalates.
fn report_start_failure(ctx: &Context, entry: &ServiceEntry, err: TaskError) {
    let service = entry.service.clone();
    ctx.escalate_with(
        Some(Arc::new(entry.service.clone())),
        std::any::type_name::<ServiceRef>(),
        Arc::new(err),
        move |error_event| {
            debug_assert!(error_event.is(APP_ERROR));
            if service.service().on_failure(error_event).is_some() {
                tracing::debug!(service = service.name(), "on_failure returned a value");
            }
        },
    );
}
