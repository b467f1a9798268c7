//! Capability traits of a load-balancer instance.
//!
//! Any engine (the nfqlb driver, an in-process library, an RPC client or a
//! test double) that implements these traits can sit behind the manager.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::model::{FlowSpec, Protocol};

/// Error type crossing the capability boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Read access to a flow selector.
pub trait Flow: Send + Sync {
    /// Name of the flow as known to the load balancer.
    fn name(&self) -> &str;

    fn source_cidrs(&self) -> &[String];

    fn destination_cidrs(&self) -> &[String];

    fn source_port_ranges(&self) -> &[String];

    fn destination_port_ranges(&self) -> &[String];

    fn protocols(&self) -> Vec<Protocol>;

    fn priority(&self) -> i32;

    fn byte_matches(&self) -> &[String];
}

/// Adds and deletes services within a load-balancer instance.
#[async_trait]
pub trait LoadBalancerInstance: Send + Sync {
    /// Add a service sized for `max_targets` slots. Returns the existing
    /// handle if the service is already present.
    async fn add_service(
        &self,
        name: &str,
        max_targets: u32,
    ) -> Result<Arc<dyn ServiceInstance>, BoxError>;

    /// Delete a service and everything attached to it (targets and flows).
    /// No-op if the service does not exist.
    async fn delete_service(&self, name: &str) -> Result<(), BoxError>;
}

/// A service instantiated by the load-balancer instance.
#[async_trait]
pub trait ServiceInstance: Send + Sync {
    fn name(&self) -> &str;

    /// Number of slots the service was created with.
    fn max_targets(&self) -> u32;

    /// Add or replace a flow selecting this service.
    async fn add_flow(&self, flow: &dyn Flow) -> Result<(), BoxError>;

    /// Delete a flow selecting this service.
    async fn delete_flow(&self, flow: &dyn Flow) -> Result<(), BoxError>;

    /// Activate `slot` and route it to `addresses`. No-op if already active.
    async fn add_target(&self, addresses: &[IpAddr], slot: u32) -> Result<(), BoxError>;

    /// Deactivate `slot` and remove its routes. No-op if not active.
    async fn delete_target(&self, addresses: &[IpAddr], slot: u32) -> Result<(), BoxError>;
}

/// A desired flow as programmed by the manager: same selectors, but named
/// by its identity key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct KeyedFlow {
    pub key: String,
    pub spec: FlowSpec,
}

impl KeyedFlow {
    pub fn new(spec: FlowSpec) -> Self {
        Self {
            key: spec.key(),
            spec,
        }
    }
}

impl Flow for KeyedFlow {
    fn name(&self) -> &str {
        &self.key
    }

    fn source_cidrs(&self) -> &[String] {
        &self.spec.source_cidrs
    }

    fn destination_cidrs(&self) -> &[String] {
        &self.spec.destination_cidrs
    }

    fn source_port_ranges(&self) -> &[String] {
        &self.spec.source_port_ranges
    }

    fn destination_port_ranges(&self) -> &[String] {
        &self.spec.destination_port_ranges
    }

    fn protocols(&self) -> Vec<Protocol> {
        self.spec.protocols.clone()
    }

    fn priority(&self) -> i32 {
        self.spec.priority
    }

    fn byte_matches(&self) -> &[String] {
        &self.spec.byte_matches
    }
}
