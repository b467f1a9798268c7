//! Reconciliation of load-balancer desired state.
//!
//! An orchestration layer hands the [`Manager`] full snapshots of the
//! desired services, flows and endpoints of one logical gateway. The
//! manager diffs each snapshot against what it programmed last time and
//! drives a [`LoadBalancerInstance`] to converge.
//!
//! # Invariants
//!
//! - All operations are idempotent: the same snapshot twice is a no-op the
//!   second time
//! - An endpoint keeps its slot identifier for as long as its identity is
//!   desired and its slot was not reclaimed
//! - At most one endpoint per service holds a given slot
//! - One failing unit (endpoint, flow, service deletion) never blocks the
//!   others; failures are aggregated into one error per call

mod error;
mod instance;
mod manager;
mod model;
mod slots;

pub use error::ReconcileError;
pub use instance::{BoxError, Flow, LoadBalancerInstance, ServiceInstance};
pub use manager::Manager;
pub use model::{
    flow_key, EndpointSpec, FlowSpec, Protocol, ServiceSpec, DEFAULT_MAX_ENDPOINTS,
};
pub use slots::lowest_free_slot;
