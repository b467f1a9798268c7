//! Desired-state file reconciler.
//!
//! The reconciler:
//! - Periodically reads a JSON snapshot of the desired services, flows and
//!   endpoints
//! - Applies it to the manager when its content changed since the last
//!   successful pass
//! - Retries a failed pass on the next poll

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use slb_reconcile::{EndpointSpec, FlowSpec, Manager, ReconcileError, ServiceSpec};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_STATE_POLL_INTERVAL;

/// Full desired state of one gateway.
///
/// ```json
/// {
///   "services": [
///     {"name": "svc-a", "max_endpoints": 2, "endpoints": [
///       {"identity": "pod-1", "addresses": ["10.0.0.1"], "ready": true}
///     ]}
///   ],
///   "flows": [
///     {"name": "f1", "service": "svc-a", "destination_cidrs": ["20.0.0.1/32"],
///      "protocols": ["tcp"], "priority": 1}
///   ]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub services: Vec<DesiredService>,

    #[serde(default)]
    pub flows: Vec<FlowSpec>,
}

/// A service and its endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DesiredService {
    pub name: String,

    /// Falls back to the configured default when absent.
    #[serde(default)]
    pub max_endpoints: Option<u32>,

    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
}

impl DesiredState {
    /// Parse a snapshot.
    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        serde_json::from_str(content).context("invalid desired state")
    }
}

/// Apply `desired` to `manager`: services, then flows, then the endpoints of
/// every service.
///
/// Each step runs even if an earlier one failed; all failures are returned
/// together.
pub async fn apply_desired_state(
    manager: &Manager,
    desired: &DesiredState,
    default_max_endpoints: u32,
) -> Result<(), ReconcileError> {
    let services: Vec<ServiceSpec> = desired
        .services
        .iter()
        .map(|service| {
            ServiceSpec::new(&service.name)
                .with_max_endpoints(service.max_endpoints.unwrap_or(default_max_endpoints))
        })
        .collect();

    let mut errors = Vec::new();

    if let Err(e) = manager.set_services(&services).await {
        errors.push(e);
    }

    if let Err(e) = manager.set_flows(&desired.flows).await {
        errors.push(e);
    }

    let known = manager.services().await;
    for service in &desired.services {
        // A service that failed to be added has already been reported.
        if !known.contains(&service.name) {
            continue;
        }
        if let Err(e) = manager.set_endpoints(&service.name, &service.endpoints).await {
            errors.push(e);
        }
    }

    ReconcileError::from_errors(errors)
}

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between reads of the snapshot.
    pub poll_interval: Duration,

    /// Max endpoints of services that do not set their own.
    pub default_max_endpoints: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_STATE_POLL_INTERVAL,
            default_max_endpoints: slb_reconcile::DEFAULT_MAX_ENDPOINTS,
        }
    }
}

/// Converges the manager onto a snapshot file.
pub struct StateFileReconciler {
    manager: Arc<Manager>,
    path: PathBuf,
    config: ReconcilerConfig,

    /// Content of the last snapshot applied without error.
    last_applied: Mutex<Option<String>>,
}

impl StateFileReconciler {
    pub fn new(manager: Arc<Manager>, path: impl Into<PathBuf>, config: ReconcilerConfig) -> Self {
        Self {
            manager,
            path: path.into(),
            config,
            last_applied: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            path = %self.path.display(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Starting state file reconciler"
        );

        let mut poll_interval = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    if let Err(e) = self.reconcile().await {
                        error!(error = %e, "Reconciliation failed, will retry");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("State file reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Perform a single pass. Returns true if the snapshot was applied.
    pub async fn reconcile(&self) -> anyhow::Result<bool> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;

        let mut last_applied = self.last_applied.lock().await;
        if last_applied.as_deref() == Some(content.as_str()) {
            debug!("Desired state unchanged, skipping");
            return Ok(false);
        }

        let desired = DesiredState::from_json(&content)?;
        info!(
            services = desired.services.len(),
            flows = desired.flows.len(),
            "Applying desired state"
        );

        if let Err(e) =
            apply_desired_state(&self.manager, &desired, self.config.default_max_endpoints).await
        {
            for error in e.errors() {
                warn!(error = %error, "Failed to apply desired state");
            }
            return Err(e).context("desired state partially applied");
        }

        *last_applied = Some(content);
        info!("Desired state applied");
        Ok(true)
    }
}
