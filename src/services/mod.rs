//! Services: the pluggable unit contract and its registry.
//!
//! - [`Service`] start/stop/on_event/on_failure/configure contract
//! - [`ServiceRef`] shared handle with downcasting
//! - [`ServiceRequest`] event-driven start/stop payload
//! - [`MetricUpdate`] payload of `METRIC_UPDATE`

mod registry;
mod service;

pub(crate) use registry::ServiceRegistry;
pub use service::{MetricUpdate, Service, ServiceRef, ServiceRequest};
