//! Policy routing for load-balancer targets.
//!
//! Each active target slot owns a forwarding mark. Packets carrying the mark
//! are steered to the target by a dedicated routing table whose ID equals
//! the mark:
//!
//! ```text
//! ip rule add fwmark 5000 table 5000
//! ip route add default via 10.0.0.1 table 5000
//! ```
//!
//! The address family (`-4`/`-6`) follows the next hop.

use std::net::IpAddr;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::exec::{CommandOutput, CommandRunner, CommandSpec, ExecError};

/// Errors from policy routing operations.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("failed to add rule for fwmark {fwmark}: {source}")]
    RuleAdd {
        fwmark: u32,
        #[source]
        source: ExecError,
    },

    #[error("failed to add route via {next_hop} in table {fwmark}: {source}")]
    RouteAdd {
        fwmark: u32,
        next_hop: IpAddr,
        #[source]
        source: ExecError,
    },

    #[error("failed to delete rule for fwmark {fwmark}: {source}")]
    RuleDel {
        fwmark: u32,
        #[source]
        source: ExecError,
    },

    #[error("failed to delete route via {next_hop} in table {fwmark}: {source}")]
    RouteDel {
        fwmark: u32,
        next_hop: IpAddr,
        #[source]
        source: ExecError,
    },

    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<RouteError>),
}

impl RouteError {
    fn from_errors(mut errors: Vec<RouteError>) -> Result<(), RouteError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(RouteError::Multiple(errors)),
        }
    }
}

/// Route entry as printed by `ip -j route show`.
#[derive(Debug, Deserialize)]
struct RouteEntry {
    #[serde(default)]
    dst: Option<String>,

    #[serde(default)]
    gateway: Option<String>,
}

/// Programs mark-based policy routes through `ip`.
pub struct PolicyRouting {
    runner: Arc<dyn CommandRunner>,
}

impl PolicyRouting {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Make packets marked `fwmark` leave via `next_hop`.
    ///
    /// No-op if the table already holds exactly one default route via
    /// `next_hop` and the rule is in place. Otherwise any stale rule and
    /// route for the mark are removed and the neighbor entry of `next_hop`
    /// is flushed before both are re-created.
    pub async fn create_policy_route(&self, fwmark: u32, next_hop: IpAddr) -> Result<(), RouteError> {
        if self.is_valid(fwmark, next_hop).await {
            debug!(fwmark, next_hop = %next_hop, "Policy route already in place");
            return Ok(());
        }

        self.remove_stale(fwmark, next_hop).await;

        // A stale neighbor entry silently drops traffic after a next-hop change.
        let flush = ip(next_hop).args(["neigh", "flush", "to", next_hop.to_string().as_str()]);
        if let Err(e) = self.runner.run(&flush).await {
            debug!(next_hop = %next_hop, error = %e, "Failed to flush neighbor entry");
        }

        self.runner
            .run(&rule(next_hop, "add", fwmark))
            .await
            .map_err(|source| RouteError::RuleAdd { fwmark, source })?;

        self.runner
            .run(&route(next_hop, "add", fwmark))
            .await
            .map_err(|source| RouteError::RouteAdd {
                fwmark,
                next_hop,
                source,
            })?;

        info!(fwmark, next_hop = %next_hop, "Policy route created");
        Ok(())
    }

    /// Remove the rule and route of `fwmark`. Both deletions are attempted;
    /// objects that are already gone count as deleted.
    pub async fn delete_policy_route(&self, fwmark: u32, next_hop: IpAddr) -> Result<(), RouteError> {
        let mut errors = Vec::new();

        if let Err(source) = self.runner.run(&rule(next_hop, "del", fwmark)).await {
            if !source.is_not_found() {
                errors.push(RouteError::RuleDel { fwmark, source });
            }
        }

        if let Err(source) = self.runner.run(&route(next_hop, "del", fwmark)).await {
            if !source.is_not_found() {
                errors.push(RouteError::RouteDel {
                    fwmark,
                    next_hop,
                    source,
                });
            }
        }

        RouteError::from_errors(errors)?;

        debug!(fwmark, next_hop = %next_hop, "Policy route deleted");
        Ok(())
    }

    async fn is_valid(&self, fwmark: u32, next_hop: IpAddr) -> bool {
        let routes = match self.routes(fwmark, next_hop).await {
            Ok(routes) => routes,
            Err(e) => {
                debug!(fwmark, error = %e, "Failed to list routes");
                return false;
            }
        };

        let [route] = routes.as_slice() else {
            return false;
        };

        let via_next_hop = route
            .gateway
            .as_deref()
            .and_then(|gateway| gateway.parse::<IpAddr>().ok())
            .is_some_and(|gateway| gateway == next_hop);
        let is_default = route.dst.as_deref().is_none_or(|dst| dst == "default");

        via_next_hop && is_default && matches!(self.rule_count(fwmark, next_hop).await, Ok(1))
    }

    async fn remove_stale(&self, fwmark: u32, next_hop: IpAddr) {
        let stale_rules = self.rule_count(fwmark, next_hop).await.unwrap_or(1);

        for _ in 0..stale_rules {
            if let Err(e) = self.runner.run(&rule(next_hop, "del", fwmark)).await {
                if !e.is_not_found() {
                    debug!(fwmark, error = %e, "Failed to delete stale rule");
                }
                break;
            }
        }

        let flush = ip(next_hop).args(["route", "flush", "table", fwmark.to_string().as_str()]);
        if let Err(e) = self.runner.run(&flush).await {
            debug!(fwmark, error = %e, "Failed to flush routing table");
        }
    }

    async fn routes(&self, fwmark: u32, next_hop: IpAddr) -> Result<Vec<RouteEntry>, ExecError> {
        let command = json_ip(next_hop).args(["route", "show", "table", fwmark.to_string().as_str()]);
        let output = self.runner.run(&command).await?;
        Ok(parse_json_list(&output))
    }

    async fn rule_count(&self, fwmark: u32, next_hop: IpAddr) -> Result<usize, ExecError> {
        let mark = fwmark.to_string();
        let command =
            json_ip(next_hop).args(["rule", "show", "fwmark", mark.as_str(), "table", mark.as_str()]);
        let output = self.runner.run(&command).await?;
        Ok(parse_json_list::<serde_json::Value>(&output).len())
    }
}

fn family(address: IpAddr) -> &'static str {
    if address.is_ipv4() {
        "-4"
    } else {
        "-6"
    }
}

fn ip(address: IpAddr) -> CommandSpec {
    CommandSpec::new("ip").arg(family(address))
}

fn json_ip(address: IpAddr) -> CommandSpec {
    CommandSpec::new("ip").arg("-j").arg(family(address))
}

fn rule(next_hop: IpAddr, action: &str, fwmark: u32) -> CommandSpec {
    let mark = fwmark.to_string();
    ip(next_hop).args(["rule", action, "fwmark", mark.as_str(), "table", mark.as_str()])
}

fn route(next_hop: IpAddr, action: &str, fwmark: u32) -> CommandSpec {
    ip(next_hop).args([
        "route",
        action,
        "default",
        "via",
        next_hop.to_string().as_str(),
        "table",
        fwmark.to_string().as_str(),
    ])
}

/// `ip -j` prints nothing at all for an empty table.
fn parse_json_list<T: serde::de::DeserializeOwned>(output: &CommandOutput) -> Vec<T> {
    let stdout = output.stdout.trim();
    if stdout.is_empty() {
        return Vec::new();
    }

    match serde_json::from_str(stdout) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(error = %e, "Unparsable ip output");
            Vec::new()
        }
    }
}
