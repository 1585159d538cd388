//! # Service contract.
//!
//! A [`Service`] is a long-lived unit with a start/stop lifecycle that also
//! receives events and escalated failures.
//!
//! ```text
//! unregistered ──start──► starting ──ok──► ready ──stop──► stopping ──► unregistered
//!                              └──err──► unregistered (error escalated)
//! ```
//!
//! Services are plain synchronous code; the runtime calls them on pool workers.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConfigMap;
use crate::context::Context;
use crate::error::BoxError;
use crate::events::{Event, Value};

/// Pluggable service.
///
/// # Example
/// ```rust
/// use servisor::{BoxError, Context, Event, Service};
///
/// struct Cache;
///
/// impl Service for Cache {
///     fn start(&self, _ctx: &Context) -> Result<(), BoxError> { Ok(()) }
///     fn stop(&self, _ctx: &Context) -> Result<(), BoxError> { Ok(()) }
/// }
///
/// assert!(Cache.name().ends_with("Cache"));
/// ```
pub trait Service: Send + Sync + 'static {
    /// Name used in logs and for stop requests.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Brings the service up. Runs at most once per readiness transition.
    fn start(&self, ctx: &Context) -> Result<(), BoxError>;

    /// Brings the service down. Errors are logged, never propagated.
    fn stop(&self, ctx: &Context) -> Result<(), BoxError>;

    /// Receives events after the listeners of the channel.
    fn on_event(&self, _event: &Event) -> Result<(), BoxError> {
        Ok(())
    }

    /// Receives an escalated failure attributed to this service.
    ///
    /// Acknowledging the error event keeps it off the error channel. The
    /// returned value is reserved; the runtime only logs whether one was given.
    fn on_failure(&self, _error: &Event) -> Option<Value> {
        None
    }

    /// Configuration changed; `merged` is the root configuration after the change.
    fn configure(&self, _changes: &ConfigMap, _merged: &ConfigMap) {}
}

/// Shared, type-erased service reference.
///
/// Keeps an `Any` view next to the trait object so callers can get the
/// concrete type back with [`ServiceRef::downcast`].
#[derive(Clone)]
pub struct ServiceRef {
    service: Arc<dyn Service>,
    any: Arc<dyn Any + Send + Sync>,
}

impl ServiceRef {
    pub fn new<S: Service>(service: Arc<S>) -> Self {
        Self {
            any: service.clone(),
            service,
        }
    }

    pub fn name(&self) -> &str {
        self.service.name()
    }

    /// Trait object view.
    pub fn service(&self) -> &dyn Service {
        self.service.as_ref()
    }

    /// Concrete service, if it is an `S`.
    pub fn downcast<S: Service>(&self) -> Option<Arc<S>> {
        self.any.clone().downcast::<S>().ok()
    }

    /// True if both references point to the same instance.
    pub fn same(&self, other: &ServiceRef) -> bool {
        self.key() == other.key()
    }

    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.any) as *const () as usize
    }
}

impl fmt::Debug for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServiceRef").field(&self.name()).finish()
    }
}

impl<S: Service> From<Arc<S>> for ServiceRef {
    fn from(service: Arc<S>) -> Self {
        ServiceRef::new(service)
    }
}

/// Payload of a targeted `SERVICE_REGISTER` / `SERVICE_UNREGISTER` request.
#[derive(Debug, Clone)]
pub enum ServiceRequest {
    /// Start (and register) the service.
    Start(ServiceRef),
    /// Stop the registered service with this name.
    Stop(String),
}

/// Payload of `METRIC_UPDATE`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricUpdate {
    pub name: String,
    pub value: Duration,
}

impl MetricUpdate {
    pub fn new(name: impl Into<String>, value: Duration) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}
