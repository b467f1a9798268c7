//! Networking utilities for the stateless load balancer.
//!
//! This library provides helpers for:
//! - CIDR parsing and conversion to half-open address intervals
//! - Wildcard detection for CIDR and port-range selectors
//! - Netfilter queue range parsing
//! - Forwarding-mark range allocation across services
//!
//! Everything here is pure: no I/O, no shared state.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnet::IpNet;
use thiserror::Error;

mod slots;

pub use slots::{allocate_slot_range, SlotRange};

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid CIDR notation.
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Malformed queue specification.
    #[error("queue must be an integer or in format integer:integer, got {0:?}")]
    InvalidQueue(String),

    /// A range must hold at least one slot.
    #[error("invalid range size: {0}")]
    InvalidRangeSize(u32),

    /// No free range fits in the representable mark space.
    #[error("unable to allocate {size} slots above {floor}")]
    RangeExhausted { floor: u32, size: u32 },
}

// ============================================================================
// Address arithmetic
// ============================================================================

/// Returns the address following `ip`, wrapping at the end of the family.
pub fn next_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4).wrapping_add(1))),
        IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6).wrapping_add(1))),
    }
}

/// Returns the address preceding `ip`, wrapping at the start of the family.
pub fn prev_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4).wrapping_sub(1))),
        IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6).wrapping_sub(1))),
    }
}

/// Parse a CIDR and truncate it to its network address.
pub fn parse_cidr(cidr: &str) -> Result<IpNet, NetworkError> {
    cidr.trim()
        .parse::<IpNet>()
        .map(|net| net.trunc())
        .map_err(|_| NetworkError::InvalidCidr(cidr.to_string()))
}

/// Half-open address interval `[start, end)`.
///
/// `end` is the address after the last one covered. For the very last
/// address of a family it wraps to the first one, as the kernel does for
/// interval set keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IpInterval {
    start: IpAddr,
    end: IpAddr,
}

impl IpInterval {
    /// Interval covering every address of `net`.
    pub fn from_net(net: &IpNet) -> Self {
        Self {
            start: net.network(),
            end: next_ip(net.broadcast()),
        }
    }

    /// Interval covering `start..=last`.
    pub fn from_inclusive(start: IpAddr, last: IpAddr) -> Result<Self, NetworkError> {
        if start.is_ipv4() != last.is_ipv4() {
            return Err(NetworkError::InvalidAddress(format!(
                "mixed address families in range {start}-{last}"
            )));
        }

        Ok(Self {
            start,
            end: next_ip(last),
        })
    }

    pub fn start(&self) -> IpAddr {
        self.start
    }

    pub fn end(&self) -> IpAddr {
        self.end
    }

    /// Last address inside the interval.
    pub fn last(&self) -> IpAddr {
        prev_ip(self.end)
    }

    pub fn is_ipv4(&self) -> bool {
        self.start.is_ipv4()
    }
}

/// Renders the interval in inclusive `start-last` form, or a single
/// address when it covers only one.
impl fmt::Display for IpInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self.last();
        if last == self.start {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, last)
        }
    }
}

/// Destination CIDRs split by family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostDestinations {
    pub ipv4: Vec<IpNet>,
    pub ipv6: Vec<IpNet>,
}

impl HostDestinations {
    /// Keep only host-exact CIDRs (/32 for IPv4, /128 for IPv6), dropping
    /// duplicates and anything that does not parse. Order of first
    /// appearance is preserved.
    pub fn from_cidrs<S: AsRef<str>>(cidrs: &[S]) -> Self {
        let mut destinations = Self::default();

        for cidr in cidrs {
            let Ok(net) = parse_cidr(cidr.as_ref()) else {
                continue;
            };

            if net.prefix_len() != net.max_prefix_len() {
                continue;
            }

            let bucket = match net {
                IpNet::V4(_) => &mut destinations.ipv4,
                IpNet::V6(_) => &mut destinations.ipv6,
            };

            if !bucket.contains(&net) {
                bucket.push(net);
            }
        }

        destinations
    }

    pub fn ipv4_intervals(&self) -> Vec<IpInterval> {
        self.ipv4.iter().map(IpInterval::from_net).collect()
    }

    pub fn ipv6_intervals(&self) -> Vec<IpInterval> {
        self.ipv6.iter().map(IpInterval::from_net).collect()
    }
}

// ============================================================================
// Selector wildcards
// ============================================================================

/// Port range covering every port.
pub const ANY_PORT_RANGE: &str = "0-65535";

/// Returns true if every CIDR of a non-empty list has a zero-length mask.
///
/// IPv4 and IPv6 ranges may be mixed. A list that is only `0.0.0.0/0` still
/// counts as "any": the selector is dropped entirely, not narrowed to IPv4.
pub fn is_any_cidr_list<S: AsRef<str>>(cidrs: &[S]) -> bool {
    if cidrs.is_empty() {
        return false;
    }

    cidrs.iter().all(|cidr| {
        cidr.as_ref()
            .split_once('/')
            .and_then(|(_, mask)| mask.trim().parse::<u8>().ok())
            .is_some_and(|mask| mask == 0)
    })
}

/// Returns true if any of the port ranges covers all ports.
pub fn is_any_port_range<S: AsRef<str>>(ports: &[S]) -> bool {
    ports.iter().any(|port| port.as_ref().trim() == ANY_PORT_RANGE)
}

// ============================================================================
// Netfilter queues
// ============================================================================

/// Inclusive range of netfilter queue numbers (`"0"` or `"0:3"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRange {
    start: u16,
    end: u16,
}

impl QueueRange {
    pub fn new(start: u16, end: u16) -> Result<Self, NetworkError> {
        if end < start {
            return Err(NetworkError::InvalidQueue(format!("{start}:{end}")));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    /// Number of queues in the range.
    pub fn total(&self) -> u16 {
        self.end - self.start + 1
    }

    /// nftables notation (`0-3`, or `0` for a single queue).
    pub fn nft_notation(&self) -> String {
        if self.start == self.end {
            self.start.to_string()
        } else {
            format!("{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for QueueRange {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetworkError::InvalidQueue(s.to_string());

        let (start, end) = match s.split_once(':') {
            Some((start, end)) => (start, end),
            None => (s, s),
        };

        let start = start.trim().parse::<u16>().map_err(|_| invalid())?;
        let end = end.trim().parse::<u16>().map_err(|_| invalid())?;

        Self::new(start, end).map_err(|_| invalid())
    }
}

/// Renders the form the load-balancer process expects (`0:3`).
impl fmt::Display for QueueRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_next_and_prev_ip() {
        assert_eq!(next_ip(ip("10.0.0.255")), ip("10.0.1.0"));
        assert_eq!(prev_ip(ip("10.0.1.0")), ip("10.0.0.255"));
        assert_eq!(next_ip(ip("2000::ffff")), ip("2000::1:0"));
        assert_eq!(next_ip(ip("255.255.255.255")), ip("0.0.0.0"));
    }

    #[test]
    fn test_interval_from_host_cidr() {
        let net = parse_cidr("20.0.0.1/32").unwrap();
        let interval = IpInterval::from_net(&net);

        assert_eq!(interval.start(), ip("20.0.0.1"));
        assert_eq!(interval.end(), ip("20.0.0.2"));
        assert_eq!(interval.last(), ip("20.0.0.1"));
        assert_eq!(interval.to_string(), "20.0.0.1");
    }

    #[test]
    fn test_interval_from_prefix() {
        let net = parse_cidr("40.0.0.7/24").unwrap();
        let interval = IpInterval::from_net(&net);

        assert_eq!(interval.start(), ip("40.0.0.0"));
        assert_eq!(interval.end(), ip("40.0.1.0"));
        assert_eq!(interval.to_string(), "40.0.0.0-40.0.0.255");
    }

    #[test]
    fn test_interval_rejects_mixed_families() {
        assert!(IpInterval::from_inclusive(ip("10.0.0.1"), ip("2000::1")).is_err());
    }

    #[test]
    fn test_host_destinations_filters_and_dedups() {
        let destinations = HostDestinations::from_cidrs(&[
            "20.0.0.1/32",
            "40.0.0.0/24",
            "2000::1/128",
            "20.0.0.1/32",
            "not-a-cidr",
            "2000::/64",
        ]);

        assert_eq!(destinations.ipv4, vec![parse_cidr("20.0.0.1/32").unwrap()]);
        assert_eq!(destinations.ipv6, vec![parse_cidr("2000::1/128").unwrap()]);
        assert_eq!(
            destinations.ipv4_intervals()[0].to_string(),
            "20.0.0.1".to_string()
        );
    }

    #[rstest]
    #[case(&["0.0.0.0/0"], true)]
    #[case(&["0.0.0.0/0", "::/0"], true)]
    #[case(&["0.0.0.0/0", "10.0.0.0/8"], false)]
    #[case(&["10.0.0.1"], false)]
    #[case(&[], false)]
    fn test_is_any_cidr_list(#[case] cidrs: &[&str], #[case] expected: bool) {
        assert_eq!(is_any_cidr_list(cidrs), expected);
    }

    #[rstest]
    #[case(&["0-65535"], true)]
    #[case(&["80", "0-65535"], true)]
    #[case(&["80", "443"], false)]
    #[case(&[], false)]
    fn test_is_any_port_range(#[case] ports: &[&str], #[case] expected: bool) {
        assert_eq!(is_any_port_range(ports), expected);
    }

    #[test]
    fn test_queue_range_parsing() {
        let queue: QueueRange = "0:3".parse().unwrap();
        assert_eq!(queue.start(), 0);
        assert_eq!(queue.total(), 4);
        assert_eq!(queue.nft_notation(), "0-3");
        assert_eq!(queue.to_string(), "0:3");

        let single: QueueRange = "2".parse().unwrap();
        assert_eq!(single.total(), 1);
        assert_eq!(single.nft_notation(), "2");
    }

    #[rstest]
    #[case("")]
    #[case("a:b")]
    #[case("1:2:3")]
    #[case("3:1")]
    #[case("70000")]
    fn test_queue_range_rejects_malformed(#[case] spec: &str) {
        assert!(matches!(
            spec.parse::<QueueRange>(),
            Err(NetworkError::InvalidQueue(_))
        ));
    }
}
