//! Configuration for the load balancer.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use slb_reconcile::DEFAULT_MAX_ENDPOINTS;

use crate::exec::DEFAULT_COMMAND_TIMEOUT;
use crate::nfqlb::{
    NfqlbConfig, DEFAULT_HEAL_INTERVAL, DEFAULT_NFQLB_PATH, DEFAULT_QLENGTH, DEFAULT_QUEUE,
    DEFAULT_STARTING_OFFSET,
};

/// Default interval between reads of the desired-state file.
pub const DEFAULT_STATE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Load balancer configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the nfqlb binary.
    pub nfqlb_path: String,

    /// Netfilter queue or queue range (`"0"` or `"0:3"`).
    pub queue: String,

    /// Netfilter queue length.
    pub qlength: u32,

    /// Spread load across the queues of the range.
    pub fanout: bool,

    /// Lowest forwarding mark handed out to services.
    pub starting_offset: u32,

    /// Max targets of services that do not set their own.
    pub max_targets: u32,

    /// Policy-route self-heal interval.
    pub heal_interval: Duration,

    /// Deadline for each external command.
    pub command_timeout: Duration,

    /// Desired-state snapshot to reconcile, if any.
    pub state_file: Option<PathBuf>,

    /// Interval between reads of `state_file`.
    pub state_poll_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let nfqlb_path = lookup("SLB_NFQLB_PATH").unwrap_or_else(|| DEFAULT_NFQLB_PATH.to_string());
        let queue = lookup("SLB_QUEUE").unwrap_or_else(|| DEFAULT_QUEUE.to_string());

        let qlength = parse(&lookup, "SLB_QLENGTH", DEFAULT_QLENGTH)?;
        let fanout = parse(&lookup, "SLB_FANOUT", false)?;
        let starting_offset = parse(&lookup, "SLB_STARTING_OFFSET", DEFAULT_STARTING_OFFSET)?;
        let max_targets = parse(&lookup, "SLB_MAX_TARGETS", DEFAULT_MAX_ENDPOINTS)?;

        let heal_interval = Duration::from_secs(parse(
            &lookup,
            "SLB_HEAL_INTERVAL_SECS",
            DEFAULT_HEAL_INTERVAL.as_secs(),
        )?);
        let command_timeout = Duration::from_secs(parse(
            &lookup,
            "SLB_COMMAND_TIMEOUT_SECS",
            DEFAULT_COMMAND_TIMEOUT.as_secs(),
        )?);

        let state_file = lookup("SLB_STATE_FILE")
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        let state_poll_interval = Duration::from_secs(parse(
            &lookup,
            "SLB_STATE_POLL_INTERVAL_SECS",
            DEFAULT_STATE_POLL_INTERVAL.as_secs(),
        )?);

        let log_level = lookup("SLB_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let config = Self {
            nfqlb_path,
            queue,
            qlength,
            fanout,
            starting_offset,
            max_targets,
            heal_interval,
            command_timeout,
            state_file,
            state_poll_interval,
            log_level,
        };

        if config.max_targets == 0 {
            anyhow::bail!("SLB_MAX_TARGETS must be positive");
        }
        if config.state_poll_interval.is_zero() {
            anyhow::bail!("SLB_STATE_POLL_INTERVAL_SECS must be positive");
        }
        config
            .nfqlb_config()
            .validate()
            .map_err(anyhow::Error::msg)
            .context("invalid nfqlb configuration")?;

        Ok(config)
    }

    /// Driver configuration derived from this one.
    pub fn nfqlb_config(&self) -> NfqlbConfig {
        NfqlbConfig::default()
            .with_nfqlb_path(self.nfqlb_path.clone())
            .with_queue(self.queue.clone())
            .with_qlength(self.qlength)
            .with_fanout(self.fanout)
            .with_starting_offset(self.starting_offset)
            .with_heal_interval(self.heal_interval)
    }
}

fn parse<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid value {value:?} for {name}")),
        None => Ok(default),
    }
}
