//! VIP address set contents.

use std::collections::BTreeSet;
use std::net::IpAddr;

use serde_json::Value;
use slb_networking::{parse_cidr, IpInterval};

/// Address family of a VIP set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Ipv4,
    Ipv6,
}

impl Family {
    pub fn set_name(&self) -> &'static str {
        match self {
            Family::Ipv4 => super::IPV4_VIP_SET,
            Family::Ipv6 => super::IPV6_VIP_SET,
        }
    }

    pub(crate) fn key_type(&self) -> &'static str {
        match self {
            Family::Ipv4 => "ipv4_addr",
            Family::Ipv6 => "ipv6_addr",
        }
    }
}

/// Changes turning the current set contents into the desired ones.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SetDiff {
    pub delete: Vec<IpInterval>,
    pub add: Vec<IpInterval>,
}

impl SetDiff {
    pub fn new(current: &[IpInterval], desired: &[IpInterval]) -> Self {
        let current_set: BTreeSet<&IpInterval> = current.iter().collect();
        let desired_set: BTreeSet<&IpInterval> = desired.iter().collect();

        Self {
            delete: current_set
                .difference(&desired_set)
                .map(|interval| **interval)
                .collect(),
            add: desired_set
                .difference(&current_set)
                .map(|interval| **interval)
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.delete.is_empty() && self.add.is_empty()
    }
}

/// Render intervals as an nft element list: `{ 20.0.0.1, 10.0.0.1-10.0.0.5 }`.
pub(crate) fn element_list(intervals: &[IpInterval]) -> String {
    let elements: Vec<String> = intervals.iter().map(ToString::to_string).collect();
    format!("{{ {} }}", elements.join(", "))
}

/// Extract the elements of the set printed by `nft -j list set`.
pub(crate) fn parse_set_elements(json: &str) -> Result<Vec<IpInterval>, String> {
    let document: Value = serde_json::from_str(json).map_err(|e| e.to_string())?;

    let objects = document
        .get("nftables")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing nftables array".to_string())?;

    let Some(set) = objects.iter().find_map(|object| object.get("set")) else {
        return Err("no set in output".to_string());
    };

    let Some(elements) = set.get("elem").and_then(Value::as_array) else {
        // Empty sets have no "elem" key at all.
        return Ok(Vec::new());
    };

    elements.iter().map(parse_element).collect()
}

fn parse_element(element: &Value) -> Result<IpInterval, String> {
    match element {
        Value::String(address) => {
            let address = parse_address(address)?;
            IpInterval::from_inclusive(address, address).map_err(|e| e.to_string())
        }
        Value::Object(object) => {
            if let Some(prefix) = object.get("prefix") {
                let address = prefix
                    .get("addr")
                    .and_then(Value::as_str)
                    .ok_or_else(|| format!("prefix without address: {prefix}"))?;
                let len = prefix
                    .get("len")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| format!("prefix without length: {prefix}"))?;
                let net = parse_cidr(&format!("{address}/{len}")).map_err(|e| e.to_string())?;
                return Ok(IpInterval::from_net(&net));
            }

            if let Some(range) = object.get("range").and_then(Value::as_array) {
                let [start, last] = range.as_slice() else {
                    return Err(format!("malformed range: {element}"));
                };
                let start = parse_address(start.as_str().unwrap_or_default())?;
                let last = parse_address(last.as_str().unwrap_or_default())?;
                return IpInterval::from_inclusive(start, last).map_err(|e| e.to_string());
            }

            // Elements with counters or comments wrap the value.
            if let Some(value) = object.get("elem").and_then(|elem| elem.get("val")) {
                return parse_element(value);
            }

            Err(format!("unsupported element: {element}"))
        }
        other => Err(format!("unsupported element: {other}")),
    }
}

fn parse_address(address: &str) -> Result<IpAddr, String> {
    address
        .parse()
        .map_err(|_| format!("invalid address: {address:?}"))
}
