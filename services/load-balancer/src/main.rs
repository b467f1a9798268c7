//! Stateless Load Balancer
//!
//! Runs the nfqlb load balancer on this host and converges it onto a
//! desired-state snapshot.
//!
//! ## Architecture
//!
//! - **nfqlb**: The supervised `flowlb` process and its self-heal loop
//! - **Manager**: Diffs desired services, flows and endpoints
//! - **Reconciler**: Feeds the manager from `SLB_STATE_FILE`, if set

use std::sync::Arc;

use anyhow::{Context, Result};
use slb_load_balancer::config::Config;
use slb_load_balancer::reconciler::{ReconcilerConfig, StateFileReconciler};
use slb_load_balancer::{HostCommandRunner, NfqLoadBalancer};
use slb_reconcile::Manager;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env().context("configuration error")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting stateless load balancer");
    info!(
        nfqlb_path = %config.nfqlb_path,
        queue = %config.queue,
        starting_offset = config.starting_offset,
        max_targets = config.max_targets,
        state_file = ?config.state_file,
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner = Arc::new(HostCommandRunner::new(config.command_timeout));
    let load_balancer = Arc::new(
        NfqLoadBalancer::new(config.nfqlb_config(), runner)
            .await
            .context("failed to set up load balancer")?,
    );
    let manager = Arc::new(Manager::new(load_balancer.clone()));

    // Start nfqlb
    let mut nfqlb_handle = tokio::spawn({
        let load_balancer = Arc::clone(&load_balancer);
        let shutdown_rx = shutdown_rx.clone();
        async move { load_balancer.start(shutdown_rx).await }
    });

    // Start the reconciliation loop
    let reconciler_handle = config.state_file.clone().map(|path| {
        let reconciler = StateFileReconciler::new(
            Arc::clone(&manager),
            path,
            ReconcilerConfig {
                poll_interval: config.state_poll_interval,
                default_max_endpoints: config.max_targets,
            },
        );
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { reconciler.run(shutdown_rx).await })
    });

    // Wait for shutdown signal
    let mut nfqlb_done = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut nfqlb_handle => {
            nfqlb_done = true;
            match result {
                Ok(Ok(())) => info!("nfqlb exited normally"),
                Ok(Err(e)) => error!(error = %e, "nfqlb exited with error"),
                Err(e) => error!(error = %e, "nfqlb task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    if let Some(handle) = reconciler_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Reconciler task panicked");
        }
    }

    // Wait for nfqlb to stop and the netfilter table to be removed
    if !nfqlb_done {
        match nfqlb_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "nfqlb shutdown error"),
            Err(e) => error!(error = %e, "nfqlb task panicked"),
        }
    }

    info!("Stateless load balancer shutdown complete");
    Ok(())
}
