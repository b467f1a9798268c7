//! Packet classification with nftables.
//!
//! One `inet` table holds two interval sets of VIPs (one per address
//! family) and two chains queueing packets destined to those VIPs to the
//! load-balancer netfilter queues:
//!
//! - `nfqlb` at prerouting, for traffic arriving from outside
//! - `nfqlb-local` at output, for ICMP errors generated by this host
//!   (e.g. fragmentation needed towards a lower-MTU next hop)
//!
//! Set contents are updated by diffing against what the kernel currently
//! holds, never by replacing the whole set.

mod set;

use std::sync::Arc;

use slb_networking::{HostDestinations, IpInterval, QueueRange};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::exec::{CommandRunner, CommandSpec, ExecError};

pub use set::Family;
use set::{element_list, parse_set_elements, SetDiff};

pub const TABLE_NAME: &str = "table-nfqlb";
pub const CHAIN_NAME: &str = "nfqlb";
pub const LOCAL_CHAIN_NAME: &str = "nfqlb-local";
pub const IPV4_VIP_SET: &str = "ipv4-vips";
pub const IPV6_VIP_SET: &str = "ipv6-vips";

/// Errors from packet classification operations.
#[derive(Debug, Error)]
pub enum NetfilterError {
    #[error("failed to configure table table-nfqlb: {source}")]
    Configure {
        #[source]
        source: ExecError,
    },

    #[error("failed to list set {set}: {source}")]
    List {
        set: &'static str,
        #[source]
        source: ExecError,
    },

    #[error("failed to parse elements of set {set}: {reason}")]
    Parse { set: &'static str, reason: String },

    #[error("failed to update set {set}: {source}")]
    Update {
        set: &'static str,
        #[source]
        source: ExecError,
    },

    #[error("failed to delete table table-nfqlb: {source}")]
    Delete {
        #[source]
        source: ExecError,
    },

    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<NetfilterError>),
}

/// The nftables table steering VIP traffic to the netfilter queues.
pub struct NetfilterQueue {
    runner: Arc<dyn CommandRunner>,
    queue: QueueRange,
    fanout: bool,

    /// Serializes read-diff-write cycles on the sets.
    update_lock: Mutex<()>,
}

impl NetfilterQueue {
    /// Create (or re-create) the table, its sets and chains.
    ///
    /// Existing set contents survive; chains are flushed and their rules
    /// re-added.
    pub async fn new(
        runner: Arc<dyn CommandRunner>,
        queue: QueueRange,
        fanout: bool,
    ) -> Result<Self, NetfilterError> {
        let netfilter = Self {
            runner,
            queue,
            fanout,
            update_lock: Mutex::new(()),
        };

        netfilter.configure().await?;
        Ok(netfilter)
    }

    async fn configure(&self) -> Result<(), NetfilterError> {
        let command = nft_script(self.ruleset());
        self.runner
            .run(&command)
            .await
            .map_err(|source| NetfilterError::Configure { source })?;

        info!(
            table = TABLE_NAME,
            queue = %self.queue,
            fanout = self.fanout,
            "Netfilter table configured"
        );
        Ok(())
    }

    fn ruleset(&self) -> String {
        let mut verdict = format!("counter queue num {}", self.queue.nft_notation());
        if self.fanout {
            verdict.push_str(" fanout");
        }

        let mut script = format!("add table inet {TABLE_NAME}\n");

        for family in [Family::Ipv4, Family::Ipv6] {
            script.push_str(&format!(
                "add set inet {TABLE_NAME} {} {{ type {}; flags interval; }}\n",
                family.set_name(),
                family.key_type(),
            ));
        }

        script.push_str(&format!(
            "add chain inet {TABLE_NAME} {CHAIN_NAME} {{ type filter hook prerouting priority filter; policy accept; }}\n\
             flush chain inet {TABLE_NAME} {CHAIN_NAME}\n\
             add rule inet {TABLE_NAME} {CHAIN_NAME} ip daddr @{IPV4_VIP_SET} {verdict}\n\
             add rule inet {TABLE_NAME} {CHAIN_NAME} ip6 daddr @{IPV6_VIP_SET} {verdict}\n"
        ));

        script.push_str(&format!(
            "add chain inet {TABLE_NAME} {LOCAL_CHAIN_NAME} {{ type filter hook output priority filter; policy accept; }}\n\
             flush chain inet {TABLE_NAME} {LOCAL_CHAIN_NAME}\n\
             add rule inet {TABLE_NAME} {LOCAL_CHAIN_NAME} meta l4proto icmp ip daddr @{IPV4_VIP_SET} {verdict}\n\
             add rule inet {TABLE_NAME} {LOCAL_CHAIN_NAME} meta l4proto ipv6-icmp ip6 daddr @{IPV6_VIP_SET} {verdict}\n"
        ));

        script
    }

    /// Mirror the host-exact CIDRs of `cidrs` into the VIP sets.
    ///
    /// Anything that is not a single address (/32, /128) or does not parse is
    /// ignored. Each family is updated independently; failures are combined.
    pub async fn set_destination_cidrs<S>(&self, cidrs: &[S]) -> Result<(), NetfilterError>
    where
        S: AsRef<str> + Sync,
    {
        let _guard = self.update_lock.lock().await;

        let destinations = HostDestinations::from_cidrs(cidrs);
        let mut errors = Vec::new();

        for (family, desired) in [
            (Family::Ipv4, destinations.ipv4_intervals()),
            (Family::Ipv6, destinations.ipv6_intervals()),
        ] {
            if let Err(e) = self.update_set(family, &desired).await {
                errors.push(e);
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(NetfilterError::Multiple(errors)),
        }
    }

    async fn update_set(&self, family: Family, desired: &[IpInterval]) -> Result<(), NetfilterError> {
        let set = family.set_name();
        let current = self.elements(family).await?;
        let diff = SetDiff::new(&current, desired);

        if diff.is_empty() {
            return Ok(());
        }

        // Deletions and additions never overlap, so two transactions are safe.
        for (action, elements) in [("delete", &diff.delete), ("add", &diff.add)] {
            if elements.is_empty() {
                continue;
            }

            let script = format!(
                "{action} element inet {TABLE_NAME} {set} {}\n",
                element_list(elements)
            );
            self.runner
                .run(&nft_script(script))
                .await
                .map_err(|source| NetfilterError::Update { set, source })?;
        }

        debug!(
            set,
            deleted = diff.delete.len(),
            added = diff.add.len(),
            "VIP set updated"
        );
        Ok(())
    }

    /// Current contents of the VIP set of `family`.
    pub async fn elements(&self, family: Family) -> Result<Vec<IpInterval>, NetfilterError> {
        let set = family.set_name();
        let command = CommandSpec::new("nft").args(["-j", "list", "set", "inet", TABLE_NAME, set]);

        let output = self
            .runner
            .run(&command)
            .await
            .map_err(|source| NetfilterError::List { set, source })?;

        parse_set_elements(&output.stdout).map_err(|reason| NetfilterError::Parse { set, reason })
    }

    /// Delete the whole table. A table that is already gone is not an error.
    pub async fn delete(&self) -> Result<(), NetfilterError> {
        let command = CommandSpec::new("nft").args(["delete", "table", "inet", TABLE_NAME]);

        match self.runner.run(&command).await {
            Ok(_) => {
                info!(table = TABLE_NAME, "Netfilter table deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(source) => Err(NetfilterError::Delete { source }),
        }
    }
}

fn nft_script(script: String) -> CommandSpec {
    CommandSpec::new("nft").args(["-f", "-"]).stdin(script)
}
