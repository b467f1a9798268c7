//! In-memory host for tests.
//!
//! [`FakeHost`] implements [`CommandRunner`] by interpreting the `ip`, `nft`
//! and `nfqlb` command lines the drivers emit and keeping the resulting
//! kernel and nfqlb state in memory. Failures can be injected per command.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{watch, Notify};

use crate::exec::{CommandOutput, CommandRunner, CommandSpec, ExecError};
use crate::netfilter::TABLE_NAME;

const NOT_FOUND: &str = "No such file or directory";

#[derive(Debug, Clone, Default)]
struct NftTable {
    sets: BTreeMap<String, BTreeSet<String>>,
    chains: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
struct HostState {
    commands: Vec<String>,
    scripts: Vec<String>,
    failures: Vec<String>,
    gates: Vec<(String, Arc<CommandGate>)>,

    /// (is IPv4, fwmark, table)
    rules: BTreeSet<(bool, u32, u32)>,
    /// (table, gateway) of default routes.
    routes: BTreeSet<(u32, IpAddr)>,
    neighbor_flushes: Vec<IpAddr>,

    tables: BTreeMap<String, NftTable>,

    /// Key: shared memory name. Value: active slot -> fwmark.
    shm: BTreeMap<String, BTreeMap<u32, u32>>,
    /// Key: flow name. Value: flow as printed by `flow-list`.
    flows: BTreeMap<String, Value>,
}

/// Holds back the next command matching a pattern, see [`FakeHost::pause_on`].
#[derive(Debug, Default)]
pub struct CommandGate {
    reached: Notify,
    release: Notify,
}

impl CommandGate {
    /// Wait until the matching command is about to run.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    /// Let the held command run.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// A simulated host. Commands are recorded in the order they are run.
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every command whose line contains `pattern` fail.
    pub fn fail_on(&self, pattern: &str) {
        self.state().failures.push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Hold the next command whose line contains `pattern` until the
    /// returned gate is released. The gate fires once.
    pub fn pause_on(&self, pattern: &str) -> Arc<CommandGate> {
        let gate = Arc::new(CommandGate::default());
        self.state()
            .gates
            .push((pattern.to_string(), Arc::clone(&gate)));
        gate
    }

    fn take_gate(&self, line: &str) -> Option<Arc<CommandGate>> {
        let mut state = self.state();
        let index = state
            .gates
            .iter()
            .position(|(pattern, _)| line.contains(pattern.as_str()))?;
        Some(state.gates.remove(index).1)
    }

    /// Every command line run so far.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn clear_commands(&self) {
        let mut state = self.state();
        state.commands.clear();
        state.scripts.clear();
    }

    /// Standard input of every `nft -f -` run so far.
    pub fn scripts(&self) -> Vec<String> {
        self.state().scripts.clone()
    }

    /// (table, gateway) of every default route, sorted.
    pub fn policy_routes(&self) -> Vec<(u32, IpAddr)> {
        self.state().routes.iter().copied().collect()
    }

    /// (fwmark, table) of every rule, sorted.
    pub fn rules(&self) -> Vec<(u32, u32)> {
        let mut rules: Vec<(u32, u32)> = self
            .state()
            .rules
            .iter()
            .map(|(_, fwmark, table)| (*fwmark, *table))
            .collect();
        rules.sort_unstable();
        rules
    }

    pub fn neighbor_flushes(&self) -> Vec<IpAddr> {
        self.state().neighbor_flushes.clone()
    }

    /// Simulate an external actor deleting the policy rules.
    pub fn drop_rules(&self) {
        self.state().rules.clear();
    }

    /// Simulate an external actor deleting the policy rules and routes.
    pub fn drop_routes(&self) {
        let mut state = self.state();
        state.rules.clear();
        state.routes.clear();
    }

    pub fn has_table(&self) -> bool {
        self.state().tables.contains_key(TABLE_NAME)
    }

    /// Rules of `chain`, without the `add rule inet <table> <chain>` prefix.
    pub fn chain_rules(&self, chain: &str) -> Vec<String> {
        self.state()
            .tables
            .get(TABLE_NAME)
            .and_then(|table| table.chains.get(chain))
            .cloned()
            .unwrap_or_default()
    }

    /// Elements of `set`, sorted.
    pub fn set_elements(&self, set: &str) -> Vec<String> {
        self.state()
            .tables
            .get(TABLE_NAME)
            .and_then(|table| table.sets.get(set))
            .map(|elements| elements.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of the initialized nfqlb shared memory segments.
    pub fn shm_segments(&self) -> Vec<String> {
        self.state().shm.keys().cloned().collect()
    }

    /// Active slots of `shm` and their forwarding marks.
    pub fn active_slots(&self, shm: &str) -> BTreeMap<u32, u32> {
        self.state().shm.get(shm).cloned().unwrap_or_default()
    }

    /// Names of the flows held by nfqlb, sorted.
    pub fn flow_names(&self) -> Vec<String> {
        self.state().flows.keys().cloned().collect()
    }

    fn execute(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError> {
        let line = command.to_string();
        let mut state = self.state();

        state.commands.push(line.clone());
        if command.program == "nft" {
            if let Some(script) = &command.stdin {
                state.scripts.push(script.clone());
            }
        }

        let failed = |output: String| ExecError::Failed {
            command: line.clone(),
            status: "exit status: 1".to_string(),
            output,
        };

        if state.failures.iter().any(|pattern| line.contains(pattern.as_str())) {
            return Err(failed("injected failure".to_string()));
        }

        let args: Vec<&str> = command.args.iter().map(String::as_str).collect();
        let result = match command.program.as_str() {
            "ip" => ip(&mut state, &args),
            "nft" => nft(&mut state, &args, command.stdin.as_deref()),
            program if program.ends_with("nfqlb") => nfqlb(&mut state, &args),
            program => Err(format!("{program}: command not found")),
        };

        result
            .map(|stdout| CommandOutput {
                stdout,
                stderr: String::new(),
            })
            .map_err(failed)
    }
}

#[async_trait]
impl CommandRunner for FakeHost {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError> {
        if let Some(gate) = self.take_gate(&command.to_string()) {
            gate.reached.notify_one();
            gate.release.notified().await;
        }
        self.execute(command)
    }

    async fn supervise(
        &self,
        command: &CommandSpec,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ExecError> {
        {
            let line = command.to_string();
            let mut state = self.state();
            state.commands.push(line.clone());

            if state.failures.iter().any(|pattern| line.contains(pattern.as_str())) {
                return Err(ExecError::Failed {
                    command: line,
                    status: "exit status: 1".to_string(),
                    output: "injected failure".to_string(),
                });
            }
        }

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

// ============================================================================
// ip
// ============================================================================

fn ip(state: &mut HostState, args: &[&str]) -> Result<String, String> {
    let (json, args) = match args {
        ["-j", rest @ ..] => (true, rest),
        rest => (false, rest),
    };
    let (ipv4, args) = match args {
        ["-4", rest @ ..] => (true, rest),
        ["-6", rest @ ..] => (false, rest),
        _ => return Err("address family required".to_string()),
    };

    match args {
        ["rule", "show", "fwmark", fwmark, "table", table] => {
            let (fwmark, table) = (number(fwmark)?, number(table)?);
            let entries: Vec<Value> = state
                .rules
                .iter()
                .filter(|rule| **rule == (ipv4, fwmark, table))
                .map(|_| {
                    json!({
                        "priority": 32765,
                        "src": "all",
                        "fwmark": format!("{fwmark:#x}"),
                        "table": table.to_string(),
                    })
                })
                .collect();
            Ok(render(json, &entries))
        }
        ["rule", "add", "fwmark", fwmark, "table", table] => {
            if state.rules.insert((ipv4, number(fwmark)?, number(table)?)) {
                Ok(String::new())
            } else {
                Err("RTNETLINK answers: File exists".to_string())
            }
        }
        ["rule", "del", "fwmark", fwmark, "table", table] => {
            if state.rules.remove(&(ipv4, number(fwmark)?, number(table)?)) {
                Ok(String::new())
            } else {
                Err(format!("RTNETLINK answers: {NOT_FOUND}"))
            }
        }
        ["route", "show", "table", table] => {
            let table = number(table)?;
            let entries: Vec<Value> = state
                .routes
                .iter()
                .filter(|(t, gateway)| *t == table && gateway.is_ipv4() == ipv4)
                .map(|(_, gateway)| {
                    json!({
                        "dst": "default",
                        "gateway": gateway.to_string(),
                        "flags": [],
                    })
                })
                .collect();
            Ok(render(json, &entries))
        }
        ["route", "add", "default", "via", gateway, "table", table] => {
            let (gateway, table) = (address(gateway)?, number(table)?);
            let occupied = state
                .routes
                .iter()
                .any(|(t, g)| *t == table && g.is_ipv4() == gateway.is_ipv4());
            if occupied {
                return Err("RTNETLINK answers: File exists".to_string());
            }
            state.routes.insert((table, gateway));
            Ok(String::new())
        }
        ["route", "del", "default", "via", gateway, "table", table] => {
            if state.routes.remove(&(number(table)?, address(gateway)?)) {
                Ok(String::new())
            } else {
                Err("RTNETLINK answers: No such process".to_string())
            }
        }
        ["route", "flush", "table", table] => {
            let table = number(table)?;
            state
                .routes
                .retain(|(t, gateway)| !(*t == table && gateway.is_ipv4() == ipv4));
            Ok(String::new())
        }
        ["neigh", "flush", "to", target] => {
            let target = address(target)?;
            state.neighbor_flushes.push(target);
            Ok(String::new())
        }
        other => Err(format!("unsupported ip command: {other:?}")),
    }
}

fn render(json: bool, entries: &[Value]) -> String {
    if json {
        Value::Array(entries.to_vec()).to_string()
    } else {
        entries
            .iter()
            .map(|entry| format!("{entry}\n"))
            .collect()
    }
}

fn number(value: &str) -> Result<u32, String> {
    value
        .parse()
        .map_err(|_| format!("invalid number {value:?}"))
}

fn address(value: &str) -> Result<IpAddr, String> {
    value
        .parse()
        .map_err(|_| format!("invalid address {value:?}"))
}

// ============================================================================
// nft
// ============================================================================

fn nft(state: &mut HostState, args: &[&str], stdin: Option<&str>) -> Result<String, String> {
    match args {
        ["-f", "-"] => {
            // A script is one transaction: nothing applies if a line fails.
            let mut tables = state.tables.clone();
            for line in stdin.unwrap_or_default().lines() {
                let line = line.trim();
                if !line.is_empty() {
                    apply_nft_line(&mut tables, line)?;
                }
            }
            state.tables = tables;
            Ok(String::new())
        }
        ["-j", "list", "set", "inet", table, set] => {
            let elements = state
                .tables
                .get(*table)
                .and_then(|t| t.sets.get(*set))
                .ok_or_else(|| format!("Error: {NOT_FOUND}"))?;

            let mut object = json!({
                "family": "inet",
                "name": set,
                "table": table,
                "flags": ["interval"],
            });
            if !elements.is_empty() {
                let elem: Vec<Value> = elements.iter().map(|e| element_json(e)).collect();
                object["elem"] = Value::Array(elem);
            }

            Ok(json!({
                "nftables": [
                    {"metainfo": {"json_schema_version": 1}},
                    {"set": object},
                ]
            })
            .to_string())
        }
        ["delete", "table", "inet", table] => match state.tables.remove(*table) {
            Some(_) => Ok(String::new()),
            None => Err(format!("Error: Could not process rule: {NOT_FOUND}")),
        },
        other => Err(format!("unsupported nft command: {other:?}")),
    }
}

fn apply_nft_line(tables: &mut BTreeMap<String, NftTable>, line: &str) -> Result<(), String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let missing = || format!("Error: Could not process rule: {NOT_FOUND}: {line}");

    match words.as_slice() {
        ["add", "table", "inet", name] => {
            tables.entry(name.to_string()).or_default();
            Ok(())
        }
        ["add", "set", "inet", table, name, ..] => {
            let table = tables.get_mut(*table).ok_or_else(missing)?;
            table.sets.entry(name.to_string()).or_default();
            Ok(())
        }
        ["add", "chain", "inet", table, name, ..] => {
            let table = tables.get_mut(*table).ok_or_else(missing)?;
            table.chains.entry(name.to_string()).or_default();
            Ok(())
        }
        ["flush", "chain", "inet", table, name] => {
            let chain = tables
                .get_mut(*table)
                .and_then(|t| t.chains.get_mut(*name))
                .ok_or_else(missing)?;
            chain.clear();
            Ok(())
        }
        ["add", "rule", "inet", table, name, ..] => {
            let rule = line.splitn(6, ' ').nth(5).unwrap_or_default().to_string();
            let chain = tables
                .get_mut(*table)
                .and_then(|t| t.chains.get_mut(*name))
                .ok_or_else(missing)?;
            chain.push(rule);
            Ok(())
        }
        [action @ ("add" | "delete"), "element", "inet", table, name, ..] => {
            let elements = element_values(line);
            let set = tables
                .get_mut(*table)
                .and_then(|t| t.sets.get_mut(*name))
                .ok_or_else(missing)?;

            for element in elements {
                if *action == "add" {
                    set.insert(element);
                } else if !set.remove(&element) {
                    return Err(missing());
                }
            }
            Ok(())
        }
        _ => Err(format!("Error: syntax error: {line}")),
    }
}

/// Elements between the braces of an element statement.
fn element_values(line: &str) -> Vec<String> {
    let (Some(open), Some(close)) = (line.find('{'), line.rfind('}')) else {
        return Vec::new();
    };

    line[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|element| !element.is_empty())
        .map(str::to_string)
        .collect()
}

fn element_json(element: &str) -> Value {
    match element.split_once('-') {
        // IPv6 addresses contain no '-', so this is always a range.
        Some((start, last)) => json!({ "range": [start, last] }),
        None => Value::String(element.to_string()),
    }
}

// ============================================================================
// nfqlb
// ============================================================================

fn nfqlb(state: &mut HostState, args: &[&str]) -> Result<String, String> {
    let Some((subcommand, rest)) = args.split_first() else {
        return Err("missing subcommand".to_string());
    };
    let options = Options::parse(rest);

    match *subcommand {
        "init" => {
            let shm = options.required("shm")?;
            state.shm.insert(shm.to_string(), BTreeMap::new());
            Ok(String::new())
        }
        "delete" => {
            let shm = options.required("shm")?;
            match state.shm.remove(shm) {
                Some(_) => Ok(String::new()),
                None => Err(format!("shm_open {shm}: {NOT_FOUND}")),
            }
        }
        "activate" => {
            let shm = options.required("shm")?;
            let slot = number(options.required("index")?)?;
            let fwmark = number(
                options
                    .positional
                    .first()
                    .ok_or_else(|| "missing fwmark".to_string())?,
            )?;
            let slots = state
                .shm
                .get_mut(shm)
                .ok_or_else(|| format!("shm_open {shm}: {NOT_FOUND}"))?;
            slots.insert(slot, fwmark);
            Ok(String::new())
        }
        "deactivate" => {
            let shm = options.required("shm")?;
            let slot = number(options.required("index")?)?;
            let slots = state
                .shm
                .get_mut(shm)
                .ok_or_else(|| format!("shm_open {shm}: {NOT_FOUND}"))?;
            slots.remove(&slot);
            Ok(String::new())
        }
        "flow-set" => {
            let name = options.required("name")?.to_string();
            let priority: i32 = options
                .get("prio")
                .unwrap_or("0")
                .parse()
                .map_err(|_| "invalid priority".to_string())?;

            let flow = json!({
                "Name": name,
                "user_ref": options.get("target").unwrap_or_default(),
                "matches_count": 0,
                "priority": priority,
                "protocols": options.list("protocols"),
                "dests": options.list("dsts"),
                "srcs": options.list("srcs"),
                "dports": options.list("dports"),
                "sports": options.list("sports"),
                "match": options.list("match"),
            });
            state.flows.insert(name, flow);
            Ok(String::new())
        }
        "flow-delete" => {
            let name = options.required("name")?;
            match state.flows.remove(name) {
                Some(_) => Ok(String::new()),
                None => Err(format!("flow {name}: {NOT_FOUND}")),
            }
        }
        "flow-list" => {
            let flows: Vec<Value> = state.flows.values().cloned().collect();
            Ok(Value::Array(flows).to_string())
        }
        other => Err(format!("unsupported nfqlb command {other:?}")),
    }
}

/// `--key=value` options and positional arguments.
struct Options<'a> {
    named: BTreeMap<&'a str, &'a str>,
    positional: Vec<&'a str>,
}

impl<'a> Options<'a> {
    fn parse(args: &[&'a str]) -> Self {
        let mut named = BTreeMap::new();
        let mut positional = Vec::new();

        for arg in args {
            match arg.strip_prefix("--") {
                Some(option) => {
                    let (key, value) = option.split_once('=').unwrap_or((option, ""));
                    named.insert(key, value);
                }
                None => positional.push(*arg),
            }
        }

        Self { named, positional }
    }

    fn get(&self, key: &str) -> Option<&'a str> {
        self.named.get(key).copied()
    }

    fn required(&self, key: &str) -> Result<&'a str, String> {
        self.get(key).ok_or_else(|| format!("missing --{key}"))
    }

    fn list(&self, key: &str) -> Vec<&'a str> {
        self.get(key)
            .map(|value| value.split(',').filter(|v| !v.is_empty()).collect())
            .unwrap_or_default()
    }
}
