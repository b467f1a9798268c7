//! Desired-state manager for one logical gateway.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ReconcileError;
use crate::instance::{KeyedFlow, LoadBalancerInstance, ServiceInstance};
use crate::model::{EndpointSpec, FlowSpec, ServiceSpec};
use crate::slots::lowest_free_slot;

/// An endpoint whose slot is active in the load balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveEndpoint {
    identity: String,
    addresses: Vec<IpAddr>,
    slot: u32,
}

impl ActiveEndpoint {
    /// Returns true if `wanted` can keep this endpoint's slot untouched.
    fn unchanged(&self, wanted: &EndpointSpec) -> bool {
        wanted.ready
            && wanted.slot.is_none_or(|slot| slot == self.slot)
            && wanted.same_addresses(&self.addresses)
    }
}

#[derive(Default)]
struct ManagerState {
    /// Key: service name.
    services: BTreeMap<String, Arc<dyn ServiceInstance>>,

    /// Key: `<flow-name>.<service-name>`.
    flows: BTreeMap<String, KeyedFlow>,

    /// Key: service name.
    endpoints: BTreeMap<String, Vec<ActiveEndpoint>>,
}

/// Converges a load-balancer instance onto desired services, flows and
/// endpoints.
///
/// `set_services`, `set_flows` and `set_endpoints` are serialized by one
/// lock; concurrent callers wait for each other.
pub struct Manager {
    load_balancer: Arc<dyn LoadBalancerInstance>,
    state: Mutex<ManagerState>,
}

impl Manager {
    pub fn new(load_balancer: Arc<dyn LoadBalancerInstance>) -> Self {
        Self {
            load_balancer,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Add the services not yet present and delete the ones no longer
    /// desired.
    ///
    /// A failure to add a service aborts the call. Deletions are best-effort:
    /// a service that fails to delete is kept and retried on the next call.
    pub async fn set_services(&self, services: &[ServiceSpec]) -> Result<(), ReconcileError> {
        let mut state = self.state.lock().await;
        let mut errors = Vec::new();

        let desired: BTreeMap<&str, &ServiceSpec> = services
            .iter()
            .map(|service| (service.name.as_str(), service))
            .collect();

        let stale: Vec<String> = state
            .services
            .keys()
            .filter(|name| !desired.contains_key(name.as_str()))
            .cloned()
            .collect();

        for name in stale {
            info!(service = %name, "Deleting service");

            if let Err(source) = self.load_balancer.delete_service(&name).await {
                warn!(service = %name, error = %source, "Failed to delete service");
                errors.push(ReconcileError::DeleteService {
                    service: name,
                    source,
                });
                continue;
            }

            state.services.remove(&name);
            state.endpoints.remove(&name);
        }

        // Flows of deleted services went away with them.
        let ManagerState {
            services: live,
            flows,
            ..
        } = &mut *state;
        flows.retain(|_, flow| live.contains_key(&flow.spec.service));

        for spec in desired.values() {
            if state.services.contains_key(&spec.name) {
                continue;
            }

            info!(
                service = %spec.name,
                max_endpoints = spec.max_endpoints,
                "Adding service"
            );

            let instance = self
                .load_balancer
                .add_service(&spec.name, spec.max_endpoints)
                .await
                .map_err(|source| ReconcileError::AddService {
                    service: spec.name.clone(),
                    source,
                })?;

            state.services.insert(spec.name.clone(), instance);
            state.endpoints.insert(spec.name.clone(), Vec::new());
        }

        ReconcileError::from_errors(errors)
    }

    /// Program every desired flow and delete the ones no longer desired.
    ///
    /// Flows referencing an unknown service are skipped.
    pub async fn set_flows(&self, flows: &[FlowSpec]) -> Result<(), ReconcileError> {
        let mut state = self.state.lock().await;
        let mut errors = Vec::new();

        let mut desired: BTreeMap<String, KeyedFlow> = BTreeMap::new();
        for spec in flows {
            if !state.services.contains_key(&spec.service) {
                debug!(
                    flow = %spec.name,
                    service = %spec.service,
                    "Skipping flow for unknown service"
                );
                continue;
            }

            let flow = KeyedFlow::new(spec.clone());
            desired.insert(flow.key.clone(), flow);
        }

        let removed: Vec<String> = state
            .flows
            .keys()
            .filter(|key| !desired.contains_key(*key))
            .cloned()
            .collect();

        for key in removed {
            let Some(flow) = state.flows.remove(&key) else {
                continue;
            };
            let Some(service) = state.services.get(&flow.spec.service).cloned() else {
                continue;
            };

            info!(flow = %key, "Deleting flow");
            if let Err(source) = service.delete_flow(&flow).await {
                warn!(flow = %key, error = %source, "Failed to delete flow");
                errors.push(ReconcileError::DeleteFlow { flow: key, source });
            }
        }

        for (key, flow) in desired {
            let Some(service) = state.services.get(&flow.spec.service).cloned() else {
                continue;
            };

            debug!(flow = %key, service = %flow.spec.service, "Setting flow");
            if let Err(source) = service.add_flow(&flow).await {
                warn!(flow = %key, error = %source, "Failed to set flow");
                errors.push(ReconcileError::AddFlow {
                    flow: key.clone(),
                    source,
                });
            }

            state.flows.insert(key, flow);
        }

        ReconcileError::from_errors(errors)
    }

    /// Converge the active slots of `service` onto `endpoints`.
    ///
    /// Unchanged ready endpoints keep their slot without touching the load
    /// balancer. Changed ones are deactivated and re-added. New ready
    /// endpoints get their pre-assigned slot, their previous slot if it is
    /// still free, or the lowest free one.
    pub async fn set_endpoints(
        &self,
        service: &str,
        endpoints: &[EndpointSpec],
    ) -> Result<(), ReconcileError> {
        let mut state = self.state.lock().await;

        let instance = state
            .services
            .get(service)
            .cloned()
            .ok_or_else(|| ReconcileError::ServiceNotFound(service.to_string()))?;
        let previous = state
            .endpoints
            .get(service)
            .cloned()
            .ok_or_else(|| ReconcileError::ServiceNotFound(service.to_string()))?;

        let mut desired: HashMap<&str, &EndpointSpec> = HashMap::new();
        for endpoint in endpoints {
            desired.entry(endpoint.identity.as_str()).or_insert(endpoint);
        }

        let mut errors = Vec::new();
        let mut active: Vec<ActiveEndpoint> = Vec::new();
        let mut previous_slots: HashMap<&str, u32> = HashMap::new();

        for endpoint in &previous {
            match desired.get(endpoint.identity.as_str()) {
                Some(wanted) if endpoint.unchanged(wanted) => {
                    active.push(endpoint.clone());
                    continue;
                }
                Some(_) => {
                    previous_slots.insert(endpoint.identity.as_str(), endpoint.slot);
                }
                None => {}
            }

            debug!(
                service,
                endpoint = %endpoint.identity,
                slot = endpoint.slot,
                "Removing target"
            );

            if let Err(source) = instance
                .delete_target(&endpoint.addresses, endpoint.slot)
                .await
            {
                warn!(
                    service,
                    endpoint = %endpoint.identity,
                    slot = endpoint.slot,
                    error = %source,
                    "Failed to delete target"
                );
                errors.push(ReconcileError::DeleteTarget {
                    service: service.to_string(),
                    endpoint: endpoint.identity.clone(),
                    slot: endpoint.slot,
                    source,
                });
                // Still active: keep holding the slot and retry next call.
                active.push(endpoint.clone());
            }
        }

        let mut taken: BTreeSet<u32> = active.iter().map(|endpoint| endpoint.slot).collect();
        let retained: HashSet<String> = active
            .iter()
            .map(|endpoint| endpoint.identity.clone())
            .collect();
        let mut seen: HashSet<&str> = HashSet::new();

        for wanted in endpoints {
            if !seen.insert(wanted.identity.as_str()) || retained.contains(&wanted.identity) {
                continue;
            }

            if !wanted.ready || wanted.addresses.is_empty() {
                debug!(
                    service,
                    endpoint = %wanted.identity,
                    ready = wanted.ready,
                    "Skipping endpoint"
                );
                continue;
            }

            let slot = match pick_slot(
                service,
                wanted,
                previous_slots.get(wanted.identity.as_str()).copied(),
                &taken,
                instance.max_targets(),
            ) {
                Ok(slot) => slot,
                Err(e) => {
                    warn!(service, endpoint = %wanted.identity, error = %e, "Dropping endpoint");
                    errors.push(e);
                    continue;
                }
            };

            debug!(service, endpoint = %wanted.identity, slot, "Adding target");

            if let Err(source) = instance.add_target(&wanted.addresses, slot).await {
                warn!(
                    service,
                    endpoint = %wanted.identity,
                    slot,
                    error = %source,
                    "Failed to add target"
                );
                errors.push(ReconcileError::AddTarget {
                    service: service.to_string(),
                    endpoint: wanted.identity.clone(),
                    slot,
                    source,
                });
                continue;
            }

            taken.insert(slot);
            active.push(ActiveEndpoint {
                identity: wanted.identity.clone(),
                addresses: wanted.addresses.clone(),
                slot,
            });
        }

        state.endpoints.insert(service.to_string(), active);

        ReconcileError::from_errors(errors)
    }

    /// Names of the services currently managed.
    pub async fn services(&self) -> Vec<String> {
        self.state.lock().await.services.keys().cloned().collect()
    }

    /// Identity keys of the flows currently programmed.
    pub async fn flows(&self) -> Vec<String> {
        self.state.lock().await.flows.keys().cloned().collect()
    }

    /// Slot held by each active endpoint of `service`, keyed by identity.
    pub async fn endpoint_slots(&self, service: &str) -> Option<BTreeMap<String, u32>> {
        let state = self.state.lock().await;
        state.endpoints.get(service).map(|endpoints| {
            endpoints
                .iter()
                .map(|endpoint| (endpoint.identity.clone(), endpoint.slot))
                .collect()
        })
    }
}

fn pick_slot(
    service: &str,
    wanted: &EndpointSpec,
    previous: Option<u32>,
    taken: &BTreeSet<u32>,
    max_targets: u32,
) -> Result<u32, ReconcileError> {
    let free = |slot: &u32| *slot < max_targets && !taken.contains(slot);

    match wanted.slot {
        Some(slot) if free(&slot) => Ok(slot),
        Some(slot) => Err(ReconcileError::SlotUnavailable {
            service: service.to_string(),
            endpoint: wanted.identity.clone(),
            slot,
        }),
        None => previous
            .filter(free)
            .or_else(|| lowest_free_slot(taken, max_targets))
            .ok_or_else(|| ReconcileError::Capacity {
                service: service.to_string(),
                endpoint: wanted.identity.clone(),
                max_targets,
            }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::instance::{BoxError, Flow};
    use crate::model::Protocol;

    type CallLog = Arc<StdMutex<Vec<String>>>;

    #[derive(Default)]
    struct MockLoadBalancer {
        calls: CallLog,
        fail_add: HashSet<String>,
        fail_delete: HashSet<String>,
        fail_slots: Arc<StdMutex<HashSet<u32>>>,
    }

    impl MockLoadBalancer {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn take_calls(&self) -> Vec<String> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }
    }

    struct MockService {
        name: String,
        max_targets: u32,
        calls: CallLog,
        fail_slots: Arc<StdMutex<HashSet<u32>>>,
    }

    #[async_trait]
    impl LoadBalancerInstance for MockLoadBalancer {
        async fn add_service(
            &self,
            name: &str,
            max_targets: u32,
        ) -> Result<Arc<dyn ServiceInstance>, BoxError> {
            if self.fail_add.contains(name) {
                return Err("range exhausted".into());
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("add_service {name} {max_targets}"));
            Ok(Arc::new(MockService {
                name: name.to_string(),
                max_targets,
                calls: Arc::clone(&self.calls),
                fail_slots: Arc::clone(&self.fail_slots),
            }))
        }

        async fn delete_service(&self, name: &str) -> Result<(), BoxError> {
            if self.fail_delete.contains(name) {
                return Err("shm busy".into());
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("delete_service {name}"));
            Ok(())
        }
    }

    #[async_trait]
    impl ServiceInstance for MockService {
        fn name(&self) -> &str {
            &self.name
        }

        fn max_targets(&self) -> u32 {
            self.max_targets
        }

        async fn add_flow(&self, flow: &dyn Flow) -> Result<(), BoxError> {
            self.calls.lock().unwrap().push(format!(
                "add_flow {} {}",
                flow.name(),
                flow.destination_cidrs().join(",")
            ));
            Ok(())
        }

        async fn delete_flow(&self, flow: &dyn Flow) -> Result<(), BoxError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("delete_flow {}", flow.name()));
            Ok(())
        }

        async fn add_target(&self, addresses: &[IpAddr], slot: u32) -> Result<(), BoxError> {
            if self.fail_slots.lock().unwrap().contains(&slot) {
                return Err("activate failed".into());
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("add_target {} {slot} {}", self.name, join(addresses)));
            Ok(())
        }

        async fn delete_target(&self, addresses: &[IpAddr], slot: u32) -> Result<(), BoxError> {
            if self.fail_slots.lock().unwrap().contains(&slot) {
                return Err("deactivate failed".into());
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("delete_target {} {slot} {}", self.name, join(addresses)));
            Ok(())
        }
    }

    fn join(addresses: &[IpAddr]) -> String {
        addresses
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    fn endpoint(identity: &str, address: &str) -> EndpointSpec {
        EndpointSpec::new(identity, vec![address.parse().unwrap()])
    }

    fn flow(name: &str, service: &str, destination: &str) -> FlowSpec {
        FlowSpec {
            name: name.to_string(),
            source_cidrs: vec![],
            destination_cidrs: vec![destination.to_string()],
            source_port_ranges: vec![],
            destination_port_ranges: vec![],
            protocols: vec![Protocol::Tcp],
            priority: 1,
            byte_matches: vec![],
            service: service.to_string(),
        }
    }

    async fn manager_with(lb: MockLoadBalancer, services: &[ServiceSpec]) -> (Manager, Arc<MockLoadBalancer>) {
        let lb = Arc::new(lb);
        let manager = Manager::new(lb.clone());
        manager.set_services(services).await.unwrap();
        lb.take_calls();
        (manager, lb)
    }

    #[tokio::test]
    async fn test_set_services_adds_and_deletes() {
        let lb = Arc::new(MockLoadBalancer::default());
        let manager = Manager::new(lb.clone());

        manager
            .set_services(&[
                ServiceSpec::new("svc-a").with_max_endpoints(2),
                ServiceSpec::new("svc-b"),
            ])
            .await
            .unwrap();
        assert_eq!(manager.services().await, vec!["svc-a", "svc-b"]);

        manager
            .set_services(&[ServiceSpec::new("svc-b")])
            .await
            .unwrap();
        assert_eq!(manager.services().await, vec!["svc-b"]);
        assert_eq!(
            lb.calls(),
            vec![
                "add_service svc-a 2",
                "add_service svc-b 100",
                "delete_service svc-a",
            ]
        );
    }

    #[tokio::test]
    async fn test_set_services_add_failure_is_fatal() {
        let lb = MockLoadBalancer {
            fail_add: ["svc-b".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let lb = Arc::new(lb);
        let manager = Manager::new(lb.clone());

        let err = manager
            .set_services(&[ServiceSpec::new("svc-a"), ServiceSpec::new("svc-b")])
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::AddService { ref service, .. } if service == "svc-b"));
        assert_eq!(manager.services().await, vec!["svc-a"]);
    }

    #[tokio::test]
    async fn test_set_services_delete_failure_keeps_service() {
        let lb = MockLoadBalancer {
            fail_delete: ["svc-a".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let (manager, _lb) = manager_with(lb, &[ServiceSpec::new("svc-a"), ServiceSpec::new("svc-b")]).await;

        let err = manager.set_services(&[]).await.unwrap_err();

        assert!(matches!(err, ReconcileError::DeleteService { ref service, .. } if service == "svc-a"));
        assert_eq!(manager.services().await, vec!["svc-a"]);
    }

    #[tokio::test]
    async fn test_set_services_drops_flows_of_deleted_service() {
        let (manager, lb) = manager_with(
            MockLoadBalancer::default(),
            &[ServiceSpec::new("svc-a"), ServiceSpec::new("svc-b")],
        )
        .await;

        manager
            .set_flows(&[
                flow("f1", "svc-a", "20.0.0.1/32"),
                flow("f2", "svc-b", "20.0.0.2/32"),
            ])
            .await
            .unwrap();
        assert_eq!(manager.flows().await, vec!["f1.svc-a", "f2.svc-b"]);

        manager
            .set_services(&[ServiceSpec::new("svc-b")])
            .await
            .unwrap();
        assert_eq!(manager.flows().await, vec!["f2.svc-b"]);

        lb.take_calls();
        manager
            .set_flows(&[flow("f2", "svc-b", "20.0.0.2/32")])
            .await
            .unwrap();
        assert_eq!(lb.calls(), vec!["add_flow f2.svc-b 20.0.0.2/32"]);
    }

    #[tokio::test]
    async fn test_set_flows_diff() {
        let (manager, lb) = manager_with(MockLoadBalancer::default(), &[ServiceSpec::new("svc-a")]).await;

        manager
            .set_flows(&[
                flow("f1", "svc-a", "20.0.0.1/32"),
                flow("orphan", "svc-missing", "20.0.0.9/32"),
            ])
            .await
            .unwrap();
        assert_eq!(manager.flows().await, vec!["f1.svc-a"]);

        manager
            .set_flows(&[flow("f2", "svc-a", "20.0.0.2/32")])
            .await
            .unwrap();

        assert_eq!(
            lb.calls(),
            vec![
                "add_flow f1.svc-a 20.0.0.1/32",
                "delete_flow f1.svc-a",
                "add_flow f2.svc-a 20.0.0.2/32",
            ]
        );
    }

    #[tokio::test]
    async fn test_set_endpoints_unknown_service() {
        let manager = Manager::new(Arc::new(MockLoadBalancer::default()));
        let err = manager
            .set_endpoints("svc-a", &[endpoint("uid-1", "10.0.0.1")])
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::ServiceNotFound(_)));
    }

    #[tokio::test]
    async fn test_set_endpoints_is_stable() {
        let (manager, lb) = manager_with(
            MockLoadBalancer::default(),
            &[ServiceSpec::new("svc-a").with_max_endpoints(2)],
        )
        .await;
        let endpoints = [endpoint("uid-1", "10.0.0.1"), endpoint("uid-2", "10.0.0.2")];

        manager.set_endpoints("svc-a", &endpoints).await.unwrap();
        assert_eq!(
            lb.take_calls(),
            vec!["add_target svc-a 0 10.0.0.1", "add_target svc-a 1 10.0.0.2"]
        );

        manager.set_endpoints("svc-a", &endpoints).await.unwrap();
        assert!(lb.calls().is_empty());
    }

    #[tokio::test]
    async fn test_set_endpoints_capacity() {
        let (manager, lb) = manager_with(
            MockLoadBalancer::default(),
            &[ServiceSpec::new("svc-a").with_max_endpoints(2)],
        )
        .await;

        let err = manager
            .set_endpoints(
                "svc-a",
                &[
                    endpoint("uid-1", "10.0.0.1"),
                    endpoint("uid-2", "10.0.0.2"),
                    endpoint("uid-3", "10.0.0.3"),
                ],
            )
            .await
            .unwrap_err();

        assert_eq!(lb.calls().len(), 2);
        let failures = err.errors();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures[0],
            ReconcileError::Capacity { endpoint, max_targets: 2, .. } if endpoint == "uid-3"
        ));
        assert_eq!(manager.endpoint_slots("svc-a").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_set_endpoints_address_change_reactivates_same_slot() {
        let (manager, lb) = manager_with(MockLoadBalancer::default(), &[ServiceSpec::new("svc-a")]).await;

        manager
            .set_endpoints("svc-a", &[endpoint("uid-1", "10.0.0.1"), endpoint("uid-2", "10.0.0.2")])
            .await
            .unwrap();
        lb.take_calls();

        manager
            .set_endpoints("svc-a", &[endpoint("uid-1", "10.0.0.1"), endpoint("uid-2", "10.0.0.20")])
            .await
            .unwrap();

        assert_eq!(
            lb.calls(),
            vec!["delete_target svc-a 1 10.0.0.2", "add_target svc-a 1 10.0.0.20"]
        );
    }

    #[tokio::test]
    async fn test_set_endpoints_not_ready_and_removed() {
        let (manager, lb) = manager_with(MockLoadBalancer::default(), &[ServiceSpec::new("svc-a")]).await;

        manager
            .set_endpoints("svc-a", &[endpoint("uid-1", "10.0.0.1"), endpoint("uid-2", "10.0.0.2")])
            .await
            .unwrap();
        lb.take_calls();

        manager
            .set_endpoints(
                "svc-a",
                &[
                    endpoint("uid-2", "10.0.0.2").with_ready(false),
                    endpoint("uid-3", "10.0.0.3"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(
            lb.calls(),
            vec![
                "delete_target svc-a 0 10.0.0.1",
                "delete_target svc-a 1 10.0.0.2",
                "add_target svc-a 0 10.0.0.3",
            ]
        );
        let slots = manager.endpoint_slots("svc-a").await.unwrap();
        assert_eq!(slots, BTreeMap::from([("uid-3".to_string(), 0)]));
    }

    #[tokio::test]
    async fn test_set_endpoints_pre_assigned_slots() {
        let (manager, _lb) = manager_with(
            MockLoadBalancer::default(),
            &[ServiceSpec::new("svc-a").with_max_endpoints(4)],
        )
        .await;

        let err = manager
            .set_endpoints(
                "svc-a",
                &[
                    endpoint("uid-1", "10.0.0.1").with_slot(3),
                    endpoint("uid-2", "10.0.0.2").with_slot(3),
                    endpoint("uid-3", "10.0.0.3").with_slot(9),
                    endpoint("uid-4", "10.0.0.4"),
                ],
            )
            .await
            .unwrap_err();

        let slots = manager.endpoint_slots("svc-a").await.unwrap();
        assert_eq!(
            slots,
            BTreeMap::from([("uid-1".to_string(), 3), ("uid-4".to_string(), 0)])
        );
        assert_eq!(err.errors().len(), 2);
        assert!(err.errors().iter().all(|e| e.is_capacity()));
    }

    #[tokio::test]
    async fn test_set_endpoints_failed_activation_is_retried() {
        let lb = MockLoadBalancer::default();
        lb.fail_slots.lock().unwrap().insert(0);
        let (manager, lb) = manager_with(lb, &[ServiceSpec::new("svc-a")]).await;
        let endpoints = [endpoint("uid-1", "10.0.0.1")];

        let err = manager.set_endpoints("svc-a", &endpoints).await.unwrap_err();
        assert!(matches!(err, ReconcileError::AddTarget { slot: 0, .. }));
        assert!(manager.endpoint_slots("svc-a").await.unwrap().is_empty());

        lb.fail_slots.lock().unwrap().clear();
        manager.set_endpoints("svc-a", &endpoints).await.unwrap();
        assert_eq!(lb.calls(), vec!["add_target svc-a 0 10.0.0.1"]);
    }

    #[tokio::test]
    async fn test_set_endpoints_failed_deactivation_keeps_slot() {
        let (manager, lb) =
            manager_with(MockLoadBalancer::default(), &[ServiceSpec::new("svc-a")]).await;
        manager
            .set_endpoints("svc-a", &[endpoint("uid-1", "10.0.0.1")])
            .await
            .unwrap();
        lb.fail_slots.lock().unwrap().insert(0);

        let err = manager
            .set_endpoints("svc-a", &[endpoint("uid-2", "10.0.0.2")])
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::DeleteTarget { slot: 0, .. }));
        assert_eq!(
            manager.endpoint_slots("svc-a").await,
            Some(BTreeMap::from([
                ("uid-1".to_string(), 0),
                ("uid-2".to_string(), 1),
            ]))
        );
    }
}
