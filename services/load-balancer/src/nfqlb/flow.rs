//! nfqlb flows: `flow-set` command lines and `flow-list` output.

use serde::Deserialize;
use slb_networking::{is_any_cidr_list, is_any_port_range};
use slb_reconcile::{Flow, Protocol};

use crate::exec::CommandSpec;

/// A flow as reported by `nfqlb flow-list`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NfqlbFlow {
    #[serde(rename = "Name")]
    pub name: String,

    /// Service (shared memory) the flow targets.
    #[serde(rename = "user_ref", default)]
    pub service: String,

    #[serde(default)]
    pub matches_count: u64,

    #[serde(rename = "srcs", default)]
    pub source_cidrs: Vec<String>,

    #[serde(rename = "dests", default)]
    pub destination_cidrs: Vec<String>,

    #[serde(rename = "sports", default)]
    pub source_port_ranges: Vec<String>,

    #[serde(rename = "dports", default)]
    pub destination_port_ranges: Vec<String>,

    #[serde(default)]
    pub protocols: Vec<Protocol>,

    #[serde(default)]
    pub priority: i32,

    #[serde(rename = "match", default)]
    pub byte_matches: Vec<String>,
}

impl Flow for NfqlbFlow {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_cidrs(&self) -> &[String] {
        &self.source_cidrs
    }

    fn destination_cidrs(&self) -> &[String] {
        &self.destination_cidrs
    }

    fn source_port_ranges(&self) -> &[String] {
        &self.source_port_ranges
    }

    fn destination_port_ranges(&self) -> &[String] {
        &self.destination_port_ranges
    }

    fn protocols(&self) -> Vec<Protocol> {
        self.protocols.clone()
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn byte_matches(&self) -> &[String] {
        &self.byte_matches
    }
}

/// Parse the JSON printed by `nfqlb flow-list`. No output means no flows.
pub fn parse_flow_list(output: &str) -> Result<Vec<NfqlbFlow>, serde_json::Error> {
    let output = output.trim();
    if output.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(output)
}

/// Build the `flow-set` invocation programming `flow` towards `service`.
///
/// Selectors meaning "anything" (only /0 source CIDRs, a port list holding
/// `0-65535`) are left out: nfqlb treats a missing selector as a wildcard.
pub fn flow_set_command(nfqlb: CommandSpec, service: &str, flow: &dyn Flow) -> CommandSpec {
    let protocols = flow.protocols();
    let protocols: Vec<&str> = protocols.iter().map(Protocol::as_str).collect();

    let mut command = nfqlb.args([
        "flow-set".to_string(),
        format!("--name={}", flow.name()),
        format!("--target={service}"),
        format!("--prio={}", flow.priority()),
        format!("--protocols={}", protocols.join(",")),
    ]);

    let destinations = flow.destination_cidrs();
    if !destinations.is_empty() {
        command = command.arg(format!("--dsts={}", destinations.join(",")));
    }

    let sources = flow.source_cidrs();
    if !sources.is_empty() && !is_any_cidr_list(sources) {
        command = command.arg(format!("--srcs={}", sources.join(",")));
    }

    let dports = flow.destination_port_ranges();
    if !dports.is_empty() && !is_any_port_range(dports) {
        command = command.arg(format!("--dports={}", dports.join(",")));
    }

    let sports = flow.source_port_ranges();
    if !sports.is_empty() && !is_any_port_range(sports) {
        command = command.arg(format!("--sports={}", sports.join(",")));
    }

    let byte_matches = flow.byte_matches();
    if !byte_matches.is_empty() {
        command = command.arg(format!("--match={}", byte_matches.join(",")));
    }

    command
}
