//! Driver for the nfqlb consistent-hashing load balancer.
//!
//! nfqlb runs as one long-lived `flowlb` process reading packets from the
//! netfilter queues. Each service is a shared-memory Maglev table created
//! with `nfqlb init`; its slots are (de)activated with a forwarding mark and
//! flows select which service handles a packet.
//!
//! ```text
//! NfqLoadBalancer
//! ├── flowlb process (supervised by start)
//! ├── self-heal loop (re-asserts policy routes)
//! ├── NetfilterQueue (VIP sets, queue rules)
//! └── NfqlbService(name) ── slot -> addresses -> policy routes
//! ```

mod config;
mod flow;
mod service;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use slb_networking::{allocate_slot_range, NetworkError, QueueRange, SlotRange};
use slb_reconcile::{BoxError, LoadBalancerInstance, ServiceInstance};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::exec::{CommandRunner, CommandSpec, ExecError};
use crate::netfilter::{NetfilterError, NetfilterQueue};
use crate::routing::{PolicyRouting, RouteError};

pub use config::{
    NfqlbConfig, DEFAULT_HEAL_INTERVAL, DEFAULT_NFQLB_PATH, DEFAULT_QLENGTH, DEFAULT_QUEUE,
    DEFAULT_STARTING_OFFSET, MAGLEV_M_MULTIPLIER, MIN_STARTING_OFFSET, OWNFW,
};
pub use flow::{flow_set_command, parse_flow_list, NfqlbFlow};
pub use service::NfqlbService;

/// Errors from the nfqlb driver.
#[derive(Debug, Error)]
pub enum NfqlbError {
    #[error("invalid nfqlb configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("failed to initialize service {service}: {source}")]
    Init {
        service: String,
        #[source]
        source: ExecError,
    },

    #[error("failed to delete shared memory of service {service}: {source}")]
    DeleteShm {
        service: String,
        #[source]
        source: ExecError,
    },

    #[error("failed to activate slot {slot} of service {service}: {source}")]
    Activate {
        service: String,
        slot: u32,
        #[source]
        source: ExecError,
    },

    #[error("failed to deactivate slot {slot} of service {service}: {source}")]
    Deactivate {
        service: String,
        slot: u32,
        #[source]
        source: ExecError,
    },

    #[error("failed to set flow {flow}: {source}")]
    FlowSet {
        flow: String,
        #[source]
        source: ExecError,
    },

    #[error("failed to delete flow {flow}: {source}")]
    FlowDelete {
        flow: String,
        #[source]
        source: ExecError,
    },

    #[error("failed to list flows: {0}")]
    FlowList(#[source] ExecError),

    #[error("failed to parse flow list: {0}")]
    FlowListParse(#[from] serde_json::Error),

    /// The slot is outside the range the service was initialized with.
    #[error("slot {slot} exceeds the {max_targets} targets of service {service}")]
    TargetLimit {
        service: String,
        slot: u32,
        max_targets: u32,
    },

    #[error(transparent)]
    Netfilter(#[from] NetfilterError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("nfqlb process failed: {0}")]
    Process(#[source] ExecError),

    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Aggregate(Vec<NfqlbError>),
}

impl NfqlbError {
    pub(crate) fn from_errors(mut errors: Vec<NfqlbError>) -> Result<(), NfqlbError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(NfqlbError::Aggregate(errors)),
        }
    }
}

/// State shared by the driver and its services.
pub(crate) struct Shared {
    pub config: NfqlbConfig,
    pub runner: Arc<dyn CommandRunner>,
    pub netfilter: NetfilterQueue,
    pub routing: PolicyRouting,
}

impl Shared {
    pub fn nfqlb(&self) -> CommandSpec {
        CommandSpec::new(&self.config.nfqlb_path)
    }

    pub async fn flow_list(&self) -> Result<Vec<NfqlbFlow>, NfqlbError> {
        let output = self
            .runner
            .run(&self.nfqlb().arg("flow-list"))
            .await
            .map_err(NfqlbError::FlowList)?;

        Ok(parse_flow_list(&output.stdout)?)
    }

    /// Recompute VIP set membership from the destinations of every flow
    /// nfqlb currently holds.
    pub async fn update_destination_cidrs(&self) -> Result<(), NfqlbError> {
        let destinations: Vec<String> = self
            .flow_list()
            .await?
            .into_iter()
            .flat_map(|flow| flow.destination_cidrs)
            .collect();

        self.netfilter.set_destination_cidrs(&destinations).await?;
        Ok(())
    }
}

/// A load-balancer instance backed by one nfqlb `flowlb` process.
pub struct NfqLoadBalancer {
    shared: Arc<Shared>,
    queue: QueueRange,

    /// Key: service name.
    services: Mutex<BTreeMap<String, Arc<NfqlbService>>>,
}

impl NfqLoadBalancer {
    /// Validate `config` and set up the netfilter table.
    ///
    /// Nothing is left behind if the configuration is invalid.
    pub async fn new(
        config: NfqlbConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, NfqlbError> {
        config.validate().map_err(NfqlbError::Config)?;
        let queue: QueueRange = config.queue.parse()?;

        let netfilter = NetfilterQueue::new(Arc::clone(&runner), queue, config.fanout).await?;
        let routing = PolicyRouting::new(Arc::clone(&runner));

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                runner,
                netfilter,
                routing,
            }),
            queue,
            services: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &NfqlbConfig {
        &self.shared.config
    }

    pub fn netfilter(&self) -> &NetfilterQueue {
        &self.shared.netfilter
    }

    /// Run the `flowlb` process and the self-heal loop until the process
    /// exits or `shutdown` flips to true, then delete the netfilter table.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<(), NfqlbError> {
        let command = self.shared.nfqlb().args([
            "flowlb".to_string(),
            "--promiscuous_ping".to_string(),
            format!("--queue={}", self.queue),
            format!("--qlength={}", self.shared.config.qlength),
        ]);

        info!(command = %command, "Starting nfqlb");

        let (heal_stop_tx, heal_stop_rx) = watch::channel(false);

        let process = async {
            let result = self.shared.runner.supervise(&command, shutdown).await;
            let _ = heal_stop_tx.send(true);
            result
        };

        let ((), result) = tokio::join!(self.run_heal_loop(heal_stop_rx), process);

        let mut errors = Vec::new();

        if let Err(e) = result {
            error!(error = %e, "nfqlb process failed");
            errors.push(NfqlbError::Process(e));
        }

        if let Err(e) = self.shared.netfilter.delete().await {
            error!(error = %e, "Failed to delete netfilter table");
            errors.push(e.into());
        }

        info!("nfqlb stopped");
        NfqlbError::from_errors(errors)
    }

    async fn run_heal_loop(&self, mut stop: watch::Receiver<bool>) {
        let period = self.shared.config.heal_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(interval_secs = period.as_secs(), "Starting self-heal loop");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.heal_once().await;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        debug!("Self-heal loop stopped");
                        break;
                    }
                }
            }
        }
    }

    /// Re-assert the policy route of every active target.
    ///
    /// Walks a snapshot of the services; the service map lock is not held
    /// while talking to the kernel. Each service is healed under its own
    /// targets lock.
    pub async fn heal_once(&self) {
        let services: Vec<Arc<NfqlbService>> =
            self.services.lock().await.values().cloned().collect();

        for service in services {
            service.heal_routes().await;
        }
    }

    /// Add a service with `max_targets` slots, or return the existing one.
    ///
    /// The service gets a forwarding-mark range overlapping no other
    /// service's. If `nfqlb init` fails nothing is recorded.
    pub async fn add_service(
        &self,
        name: &str,
        max_targets: u32,
    ) -> Result<Arc<NfqlbService>, NfqlbError> {
        let mut services = self.services.lock().await;

        if let Some(existing) = services.get(name) {
            return Ok(Arc::clone(existing));
        }

        info!(service = name, max_targets, "Adding service");

        let existing: Vec<SlotRange> = services.values().map(|s| s.slot_range()).collect();
        let range = allocate_slot_range(self.shared.config.starting_offset, &existing, max_targets)?;

        let command = self.shared.nfqlb().args([
            "init".to_string(),
            format!("--ownfw={OWNFW}"),
            format!("--shm={name}"),
            format!("--M={}", max_targets.saturating_mul(MAGLEV_M_MULTIPLIER)),
            format!("--N={max_targets}"),
        ]);

        self.shared
            .runner
            .run(&command)
            .await
            .map_err(|source| NfqlbError::Init {
                service: name.to_string(),
                source,
            })?;

        let service = Arc::new(NfqlbService::new(name, range, Arc::clone(&self.shared)));
        services.insert(name.to_string(), Arc::clone(&service));

        info!(service = name, offset = range.start, "Service added");
        Ok(service)
    }

    /// Delete a service with its targets, routes and flows.
    ///
    /// Every teardown step is attempted. On failure the service stays
    /// registered so a later call retries what is left.
    pub async fn delete_service(&self, name: &str) -> Result<(), NfqlbError> {
        let Some(service) = self.services.lock().await.get(name).cloned() else {
            return Ok(());
        };

        info!(service = name, "Deleting service");

        let mut errors = Vec::new();

        if let Err(e) = service.release_targets().await {
            errors.push(e);
        }

        match self.shared.flow_list().await {
            Ok(flows) => {
                for flow in flows.iter().filter(|flow| flow.service == name) {
                    if let Err(e) = service.delete_flow_by_name(&flow.name).await {
                        warn!(service = name, flow = %flow.name, error = %e, "Failed to delete flow");
                        errors.push(e);
                    }
                }
            }
            Err(e) => errors.push(e),
        }

        let command = self
            .shared
            .nfqlb()
            .args(["delete".to_string(), format!("--shm={name}")]);
        match self.shared.runner.run(&command).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(source) => errors.push(NfqlbError::DeleteShm {
                service: name.to_string(),
                source,
            }),
        }

        if !errors.is_empty() {
            return NfqlbError::from_errors(errors);
        }

        self.services.lock().await.remove(name);
        info!(service = name, "Service deleted");
        Ok(())
    }

    /// Handle of a registered service.
    pub async fn service(&self, name: &str) -> Option<Arc<NfqlbService>> {
        self.services.lock().await.get(name).cloned()
    }

    /// Names of the registered services.
    pub async fn service_names(&self) -> Vec<String> {
        self.services.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl LoadBalancerInstance for NfqLoadBalancer {
    async fn add_service(
        &self,
        name: &str,
        max_targets: u32,
    ) -> Result<Arc<dyn ServiceInstance>, BoxError> {
        let service: Arc<dyn ServiceInstance> =
            NfqLoadBalancer::add_service(self, name, max_targets).await?;
        Ok(service)
    }

    async fn delete_service(&self, name: &str) -> Result<(), BoxError> {
        NfqLoadBalancer::delete_service(self, name).await?;
        Ok(())
    }
}
