//! Stateless Load Balancer Library
//!
//! Programs a Linux host as a Maglev-style stateless L3/L4 load balancer.
//! Packets destined to a VIP are queued to user space by nftables, where
//! the `nfqlb` process picks a target slot by consistent hashing and marks
//! the packet. Policy routing then sends each mark to its target.
//!
//! ## Architecture
//!
//! ```text
//! Manager (slb-reconcile)
//! └── NfqLoadBalancer            (nfqlb process, services, self-heal)
//!     ├── NetfilterQueue         (VIP sets, queue rules)
//!     ├── PolicyRouting          (fwmark -> routing table -> target)
//!     └── CommandRunner          (ip, nft, nfqlb)
//! ```
//!
//! ## Modules
//!
//! - `exec`: External command execution
//! - `netfilter`: nftables packet classification
//! - `routing`: Mark-based policy routing
//! - `nfqlb`: The load-balancer instance driver
//! - `reconciler`: Desired-state file reconciliation

pub mod exec;
pub mod netfilter;
pub mod nfqlb;
pub mod routing;

// Internal modules exposed for integration tests
pub mod config;
pub mod reconciler;
pub mod testing;

// Re-export commonly used types
pub use exec::{CommandRunner, CommandSpec, ExecError, HostCommandRunner};
pub use nfqlb::{NfqLoadBalancer, NfqlbConfig, NfqlbError, NfqlbService};
pub use reconciler::{apply_desired_state, DesiredState, StateFileReconciler};
pub use testing::FakeHost;
