//! A service instantiated in nfqlb.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use slb_networking::SlotRange;
use slb_reconcile::{BoxError, Flow, ServiceInstance};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{flow_set_command, NfqlbError, Shared};

/// One nfqlb shared-memory table and the targets activated in it.
///
/// Slot `n` is activated with forwarding mark `offset + n`; packets carrying
/// that mark are policy-routed to the addresses of the target.
pub struct NfqlbService {
    name: String,
    range: SlotRange,
    shared: Arc<Shared>,

    /// Key: slot. Value: addresses of the target.
    targets: Mutex<BTreeMap<u32, Vec<IpAddr>>>,
}

impl NfqlbService {
    pub(crate) fn new(name: &str, range: SlotRange, shared: Arc<Shared>) -> Self {
        Self {
            name: name.to_string(),
            range,
            shared,
            targets: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_targets(&self) -> u32 {
        self.range.size
    }

    /// Forwarding mark of slot 0.
    pub fn offset(&self) -> u32 {
        self.range.start
    }

    pub fn slot_range(&self) -> SlotRange {
        self.range
    }

    pub fn fwmark(&self, slot: u32) -> u32 {
        self.range.start + slot
    }

    /// Snapshot of the active targets.
    pub async fn targets(&self) -> BTreeMap<u32, Vec<IpAddr>> {
        self.targets.lock().await.clone()
    }

    /// Program `flow` towards this service, then refresh the VIP sets.
    pub async fn add_flow(&self, flow: &dyn Flow) -> Result<(), NfqlbError> {
        info!(service = %self.name, flow = flow.name(), "Setting flow");

        let command = flow_set_command(self.shared.nfqlb(), &self.name, flow);
        self.shared
            .runner
            .run(&command)
            .await
            .map_err(|source| NfqlbError::FlowSet {
                flow: flow.name().to_string(),
                source,
            })?;

        self.shared.update_destination_cidrs().await
    }

    pub async fn delete_flow(&self, flow: &dyn Flow) -> Result<(), NfqlbError> {
        self.delete_flow_by_name(flow.name()).await
    }

    pub(crate) async fn delete_flow_by_name(&self, name: &str) -> Result<(), NfqlbError> {
        info!(service = %self.name, flow = name, "Deleting flow");

        let command = self
            .shared
            .nfqlb()
            .args(["flow-delete".to_string(), format!("--name={name}")]);

        match self.shared.runner.run(&command).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(source) => {
                return Err(NfqlbError::FlowDelete {
                    flow: name.to_string(),
                    source,
                })
            }
        }

        self.shared.update_destination_cidrs().await
    }

    /// Activate `slot` and route its mark to `addresses`. No-op if the slot
    /// is already active.
    ///
    /// Route failures are logged only: the self-heal loop retries them.
    pub async fn add_target(&self, addresses: &[IpAddr], slot: u32) -> Result<(), NfqlbError> {
        if slot >= self.range.size {
            return Err(NfqlbError::TargetLimit {
                service: self.name.clone(),
                slot,
                max_targets: self.range.size,
            });
        }

        let mut targets = self.targets.lock().await;
        if targets.contains_key(&slot) {
            return Ok(());
        }

        let fwmark = self.fwmark(slot);
        info!(service = %self.name, slot, fwmark, ips = ?addresses, "Adding target");

        let command = self.shared.nfqlb().args([
            "activate".to_string(),
            format!("--index={slot}"),
            format!("--shm={}", self.name),
            fwmark.to_string(),
        ]);
        self.shared
            .runner
            .run(&command)
            .await
            .map_err(|source| NfqlbError::Activate {
                service: self.name.clone(),
                slot,
                source,
            })?;

        targets.insert(slot, addresses.to_vec());

        for address in addresses {
            if let Err(e) = self.shared.routing.create_policy_route(fwmark, *address).await {
                warn!(
                    service = %self.name,
                    fwmark,
                    ip = %address,
                    error = %e,
                    "Failed to create policy route, will retry in next heal"
                );
            }
        }

        Ok(())
    }

    /// Deactivate `slot` and remove its routes. No-op if the slot is not
    /// active.
    ///
    /// Routes are removed for the addresses the slot was activated with,
    /// which are the ones actually programmed.
    pub async fn delete_target(&self, addresses: &[IpAddr], slot: u32) -> Result<(), NfqlbError> {
        let mut targets = self.targets.lock().await;
        let Some(active) = targets.remove(&slot) else {
            return Ok(());
        };

        if active.as_slice() != addresses {
            info!(
                service = %self.name,
                slot,
                requested = ?addresses,
                active = ?active,
                "Deleting target with its active addresses"
            );
        }

        if let Err(e) = self.deactivate(slot, &active).await {
            // Still active in nfqlb: the next call retries.
            targets.insert(slot, active);
            return Err(e);
        }

        Ok(())
    }

    /// Deactivate every slot. Each failure is logged and the rest carry on;
    /// slots that failed stay recorded for the next attempt.
    pub(crate) async fn release_targets(&self) -> Result<(), NfqlbError> {
        let mut targets = self.targets.lock().await;
        let slots: Vec<u32> = targets.keys().copied().collect();
        let mut errors = Vec::new();

        for slot in slots {
            let Some(addresses) = targets.remove(&slot) else {
                continue;
            };

            if let Err(e) = self.deactivate(slot, &addresses).await {
                warn!(service = %self.name, slot, error = %e, "Failed to release target");
                targets.insert(slot, addresses);
                errors.push(e);
            }
        }

        NfqlbError::from_errors(errors)
    }

    /// Re-assert the policy route of every active target.
    ///
    /// The targets lock is held for the whole pass, so a slot deactivated
    /// concurrently never gets its route back.
    pub(crate) async fn heal_routes(&self) {
        let targets = self.targets.lock().await;

        for (&slot, addresses) in targets.iter() {
            let fwmark = self.fwmark(slot);

            for address in addresses {
                if let Err(e) = self.shared.routing.create_policy_route(fwmark, *address).await {
                    warn!(
                        service = %self.name,
                        fwmark,
                        ip = %address,
                        error = %e,
                        "Failed to create policy route, will retry in next heal"
                    );
                }
            }
        }
    }

    async fn deactivate(&self, slot: u32, addresses: &[IpAddr]) -> Result<(), NfqlbError> {
        let fwmark = self.fwmark(slot);
        info!(service = %self.name, slot, fwmark, ips = ?addresses, "Deleting target");

        let command = self.shared.nfqlb().args([
            "deactivate".to_string(),
            format!("--index={slot}"),
            format!("--shm={}", self.name),
        ]);
        match self.shared.runner.run(&command).await {
            Ok(_) => {}
            // The shared memory is already gone, and the slot with it.
            Err(e) if e.is_not_found() => {}
            Err(source) => {
                return Err(NfqlbError::Deactivate {
                    service: self.name.clone(),
                    slot,
                    source,
                })
            }
        }

        for address in addresses {
            if let Err(e) = self.shared.routing.delete_policy_route(fwmark, *address).await {
                warn!(
                    service = %self.name,
                    fwmark,
                    ip = %address,
                    error = %e,
                    "Failed to delete policy route"
                );
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ServiceInstance for NfqlbService {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_targets(&self) -> u32 {
        self.range.size
    }

    async fn add_flow(&self, flow: &dyn Flow) -> Result<(), BoxError> {
        Ok(NfqlbService::add_flow(self, flow).await?)
    }

    async fn delete_flow(&self, flow: &dyn Flow) -> Result<(), BoxError> {
        Ok(NfqlbService::delete_flow(self, flow).await?)
    }

    async fn add_target(&self, addresses: &[IpAddr], slot: u32) -> Result<(), BoxError> {
        Ok(NfqlbService::add_target(self, addresses, slot).await?)
    }

    async fn delete_target(&self, addresses: &[IpAddr], slot: u32) -> Result<(), BoxError> {
        Ok(NfqlbService::delete_target(self, addresses, slot).await?)
    }
}

#[cfg(test)]
mod tests {
    use slb_reconcile::Protocol;

    use super::*;
    use crate::nfqlb::{NfqLoadBalancer, NfqlbConfig, NfqlbFlow};
    use crate::testing::FakeHost;

    async fn setup(max_targets: u32) -> (Arc<FakeHost>, NfqLoadBalancer, Arc<NfqlbService>) {
        let host = Arc::new(FakeHost::new());
        let lb = NfqLoadBalancer::new(NfqlbConfig::default(), host.clone())
            .await
            .unwrap();
        let service = lb.add_service("svc-a", max_targets).await.unwrap();
        host.clear_commands();
        (host, lb, service)
    }

    fn flow(name: &str, destinations: &[&str]) -> NfqlbFlow {
        NfqlbFlow {
            name: name.to_string(),
            service: String::new(),
            matches_count: 0,
            source_cidrs: vec![],
            destination_cidrs: destinations.iter().map(ToString::to_string).collect(),
            source_port_ranges: vec![],
            destination_port_ranges: vec![],
            protocols: vec![Protocol::Tcp],
            priority: 1,
            byte_matches: vec![],
        }
    }

    fn addresses(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_add_target_activates_and_routes() {
        let (host, _lb, service) = setup(4).await;

        service
            .add_target(&addresses(&["10.0.0.1", "2000::1"]), 2)
            .await
            .unwrap();

        assert!(host
            .commands()
            .contains(&"nfqlb activate --index=2 --shm=svc-a 5002".to_string()));
        assert_eq!(host.active_slots("svc-a"), BTreeMap::from([(2, 5002)]));
        assert_eq!(
            host.policy_routes(),
            vec![
                (5002, "10.0.0.1".parse().unwrap()),
                (5002, "2000::1".parse().unwrap()),
            ]
        );
    }

    #[tokio::test]
    async fn test_add_target_twice_then_delete_once() {
        let (host, _lb, service) = setup(4).await;
        let target = addresses(&["10.0.0.1"]);

        service.add_target(&target, 0).await.unwrap();
        service.add_target(&target, 0).await.unwrap();

        let activations = host
            .commands()
            .iter()
            .filter(|command| command.contains(" activate "))
            .count();
        assert_eq!(activations, 1);

        service.delete_target(&target, 0).await.unwrap();

        assert!(host.active_slots("svc-a").is_empty());
        assert!(host.policy_routes().is_empty());
        assert!(service.targets().await.is_empty());

        // Already inactive.
        service.delete_target(&target, 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_add_target_rejects_out_of_range_slot() {
        let (host, _lb, service) = setup(2).await;

        let err = service
            .add_target(&addresses(&["10.0.0.1"]), 2)
            .await
            .unwrap_err();

        assert!(matches!(err, NfqlbError::TargetLimit { slot: 2, max_targets: 2, .. }));
        assert!(host.commands().is_empty());
    }

    #[tokio::test]
    async fn test_add_target_route_failure_is_not_fatal() {
        let (host, _lb, service) = setup(2).await;
        host.fail_on("route add");

        service
            .add_target(&addresses(&["10.0.0.1"]), 0)
            .await
            .unwrap();

        assert_eq!(host.active_slots("svc-a"), BTreeMap::from([(0, 5000)]));
        assert!(host.policy_routes().is_empty());
        assert_eq!(service.targets().await.len(), 1);
    }

    #[tokio::test]
    async fn test_add_target_activation_failure() {
        let (host, _lb, service) = setup(2).await;
        host.fail_on("activate");

        let err = service
            .add_target(&addresses(&["10.0.0.1"]), 0)
            .await
            .unwrap_err();

        assert!(matches!(err, NfqlbError::Activate { slot: 0, .. }));
        assert!(service.targets().await.is_empty());
        assert!(host.policy_routes().is_empty());
    }

    #[tokio::test]
    async fn test_delete_target_failure_keeps_slot() {
        let (host, _lb, service) = setup(2).await;
        let target = addresses(&["10.0.0.1"]);
        service.add_target(&target, 0).await.unwrap();
        host.fail_on("deactivate");

        let err = service.delete_target(&target, 0).await.unwrap_err();

        assert!(matches!(err, NfqlbError::Deactivate { slot: 0, .. }));
        assert_eq!(service.targets().await, BTreeMap::from([(0, target.clone())]));
        assert_eq!(host.policy_routes(), vec![(5000, target[0])]);

        host.clear_failures();
        service.delete_target(&target, 0).await.unwrap();

        assert!(host.active_slots("svc-a").is_empty());
        assert!(host.policy_routes().is_empty());
        assert!(host.rules().is_empty());
    }

    #[tokio::test]
    async fn test_release_targets_keeps_failed_slots() {
        let (host, _lb, service) = setup(2).await;
        service.add_target(&addresses(&["10.0.0.1"]), 0).await.unwrap();
        service.add_target(&addresses(&["10.0.0.2"]), 1).await.unwrap();
        host.fail_on("deactivate --index=1");

        let err = service.release_targets().await.unwrap_err();

        assert!(matches!(err, NfqlbError::Deactivate { slot: 1, .. }));
        assert_eq!(
            service.targets().await,
            BTreeMap::from([(1, addresses(&["10.0.0.2"]))])
        );
        assert_eq!(host.active_slots("svc-a"), BTreeMap::from([(1, 5001)]));
        assert_eq!(host.policy_routes(), vec![(5001, "10.0.0.2".parse().unwrap())]);

        host.clear_failures();
        service.release_targets().await.unwrap();

        assert!(service.targets().await.is_empty());
        assert!(host.active_slots("svc-a").is_empty());
        assert!(host.policy_routes().is_empty());
    }

    #[tokio::test]
    async fn test_flows_drive_vip_sets() {
        let (host, _lb, service) = setup(2).await;

        service
            .add_flow(&flow("f1.svc-a", &["20.0.0.1/32", "40.0.0.0/24", "2000::1/128"]))
            .await
            .unwrap();
        service
            .add_flow(&flow("f2.svc-a", &["20.0.0.2/32"]))
            .await
            .unwrap();

        assert_eq!(host.flow_names(), vec!["f1.svc-a", "f2.svc-a"]);
        assert_eq!(
            host.set_elements(crate::netfilter::IPV4_VIP_SET),
            vec!["20.0.0.1", "20.0.0.2"]
        );
        assert_eq!(
            host.set_elements(crate::netfilter::IPV6_VIP_SET),
            vec!["2000::1"]
        );

        service.delete_flow(&flow("f1.svc-a", &[])).await.unwrap();

        assert_eq!(host.flow_names(), vec!["f2.svc-a"]);
        assert_eq!(
            host.set_elements(crate::netfilter::IPV4_VIP_SET),
            vec!["20.0.0.2"]
        );
        assert!(host.set_elements(crate::netfilter::IPV6_VIP_SET).is_empty());
    }

    #[tokio::test]
    async fn test_add_flow_failure_leaves_sets_untouched() {
        let (host, _lb, service) = setup(2).await;
        host.fail_on("flow-set");

        let err = service
            .add_flow(&flow("f1.svc-a", &["20.0.0.1/32"]))
            .await
            .unwrap_err();

        assert!(matches!(err, NfqlbError::FlowSet { .. }));
        assert!(host.set_elements(crate::netfilter::IPV4_VIP_SET).is_empty());
    }
}
