//! Desired-state model consumed from the orchestration layer.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Slots per service when none is requested.
pub const DEFAULT_MAX_ENDPOINTS: u32 = 100;

fn default_max_endpoints() -> u32 {
    DEFAULT_MAX_ENDPOINTS
}

/// A named logical backend group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unique service name.
    pub name: String,

    /// Maximum number of endpoints (and therefore slots) the service holds.
    #[serde(default = "default_max_endpoints")]
    pub max_endpoints: u32,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_endpoints: DEFAULT_MAX_ENDPOINTS,
        }
    }

    pub fn with_max_endpoints(mut self, max_endpoints: u32) -> Self {
        self.max_endpoints = max_endpoints;
        self
    }
}

/// Transport protocols a flow can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[serde(alias = "TCP")]
    Tcp,
    #[serde(alias = "UDP")]
    Udp,
    #[serde(alias = "SCTP")]
    Sctp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A traffic-selection rule binding matching traffic to one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSpec {
    /// Flow name, unique per service.
    pub name: String,

    /// Source CIDRs, e.g. `["124.0.0.0/24", "2001::/32"]`.
    #[serde(default)]
    pub source_cidrs: Vec<String>,

    /// Destination CIDRs (the VIPs).
    #[serde(default)]
    pub destination_cidrs: Vec<String>,

    /// Source port ranges, e.g. `["35000-35500", "40000"]`.
    #[serde(default)]
    pub source_port_ranges: Vec<String>,

    #[serde(default)]
    pub destination_port_ranges: Vec<String>,

    pub protocols: Vec<Protocol>,

    #[serde(default)]
    pub priority: i32,

    /// Raw byte matches on the L4 header.
    #[serde(default)]
    pub byte_matches: Vec<String>,

    /// Name of the service receiving the traffic.
    pub service: String,
}

impl FlowSpec {
    /// Identity key of the flow: `<flow-name>.<service-name>`.
    pub fn key(&self) -> String {
        flow_key(&self.name, &self.service)
    }
}

/// Build the identity key of a flow.
pub fn flow_key(flow: &str, service: &str) -> String {
    format!("{flow}.{service}")
}

/// One addressable backend unit of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// Durable identity (e.g. a workload UID).
    pub identity: String,

    /// Addresses of the endpoint, v4 and/or v6.
    pub addresses: Vec<IpAddr>,

    /// Whether the endpoint may receive traffic.
    #[serde(default)]
    pub ready: bool,

    /// Slot identifier assigned upstream, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<u32>,
}

impl EndpointSpec {
    pub fn new(identity: impl Into<String>, addresses: Vec<IpAddr>) -> Self {
        Self {
            identity: identity.into(),
            addresses,
            ready: true,
            slot: None,
        }
    }

    pub fn with_ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    pub fn with_slot(mut self, slot: u32) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Order-independent comparison of the address lists.
    pub fn same_addresses(&self, other: &[IpAddr]) -> bool {
        if self.addresses.len() != other.len() {
            return false;
        }

        let mut mine = self.addresses.clone();
        let mut theirs = other.to_vec();
        mine.sort();
        theirs.sort();
        mine == theirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_key() {
        let flow = FlowSpec {
            name: "f1".to_string(),
            source_cidrs: vec![],
            destination_cidrs: vec!["20.0.0.1/32".to_string()],
            source_port_ranges: vec![],
            destination_port_ranges: vec![],
            protocols: vec![Protocol::Tcp],
            priority: 1,
            byte_matches: vec![],
            service: "svc-a".to_string(),
        };
        assert_eq!(flow.key(), "f1.svc-a");
    }

    #[test]
    fn test_same_addresses_ignores_order() {
        let endpoint = EndpointSpec::new(
            "uid-1",
            vec!["10.0.0.1".parse().unwrap(), "2000::1".parse().unwrap()],
        );

        assert!(endpoint.same_addresses(&["2000::1".parse().unwrap(), "10.0.0.1".parse().unwrap()]));
        assert!(!endpoint.same_addresses(&["10.0.0.1".parse().unwrap()]));
        assert!(!endpoint.same_addresses(&[
            "10.0.0.1".parse().unwrap(),
            "2000::2".parse().unwrap()
        ]));
    }

    #[test]
    fn test_service_spec_defaults() {
        let spec: ServiceSpec = serde_json::from_str(r#"{"name":"svc-a"}"#).unwrap();
        assert_eq!(spec.max_endpoints, DEFAULT_MAX_ENDPOINTS);
    }

    #[test]
    fn test_flow_spec_accepts_uppercase_protocols() {
        let flow: FlowSpec = serde_json::from_str(
            r#"{"name":"f1","protocols":["TCP","udp"],"service":"svc-a"}"#,
        )
        .unwrap();
        assert_eq!(flow.protocols, vec![Protocol::Tcp, Protocol::Udp]);
        assert!(flow.destination_cidrs.is_empty());
    }
}
