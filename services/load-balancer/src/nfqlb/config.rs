//! Driver configuration.

use std::time::Duration;

/// Default path of the nfqlb binary (resolved through `PATH`).
pub const DEFAULT_NFQLB_PATH: &str = "nfqlb";

/// Default netfilter queue range.
pub const DEFAULT_QUEUE: &str = "0:3";

/// Default netfilter queue length.
pub const DEFAULT_QLENGTH: u32 = 1024;

/// Default lowest forwarding mark.
pub const DEFAULT_STARTING_OFFSET: u32 = 5000;

pub const DEFAULT_HEAL_INTERVAL: Duration = Duration::from_secs(10);

/// Maglev lookup table size per target.
pub const MAGLEV_M_MULTIPLIER: u32 = 100;

/// Mark the nfqlb process sets itself; 0 leaves marking to us.
pub const OWNFW: u32 = 0;

/// Routing table IDs 0 and 253-255 are reserved by the kernel.
pub const MIN_STARTING_OFFSET: u32 = 256;

/// Configuration of an [`NfqLoadBalancer`](super::NfqLoadBalancer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfqlbConfig {
    pub nfqlb_path: String,

    /// Queue or queue range, `"N"` or `"N:M"`.
    pub queue: String,

    pub qlength: u32,

    /// Spread flows across the queues of the range.
    pub fanout: bool,

    /// Lowest forwarding mark handed out to services.
    pub starting_offset: u32,

    /// Interval between policy-route self-heal passes.
    pub heal_interval: Duration,
}

impl Default for NfqlbConfig {
    fn default() -> Self {
        Self {
            nfqlb_path: DEFAULT_NFQLB_PATH.to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            qlength: DEFAULT_QLENGTH,
            fanout: false,
            starting_offset: DEFAULT_STARTING_OFFSET,
            heal_interval: DEFAULT_HEAL_INTERVAL,
        }
    }
}

impl NfqlbConfig {
    pub fn with_nfqlb_path(mut self, nfqlb_path: impl Into<String>) -> Self {
        self.nfqlb_path = nfqlb_path.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_qlength(mut self, qlength: u32) -> Self {
        self.qlength = qlength;
        self
    }

    pub fn with_fanout(mut self, fanout: bool) -> Self {
        self.fanout = fanout;
        self
    }

    pub fn with_starting_offset(mut self, starting_offset: u32) -> Self {
        self.starting_offset = starting_offset;
        self
    }

    pub fn with_heal_interval(mut self, heal_interval: Duration) -> Self {
        self.heal_interval = heal_interval;
        self
    }

    /// Check the values that cannot be validated by their type alone.
    pub fn validate(&self) -> Result<(), String> {
        if self.nfqlb_path.trim().is_empty() {
            return Err("nfqlb path must not be empty".to_string());
        }
        if self.qlength == 0 {
            return Err("queue length must be positive".to_string());
        }
        if self.starting_offset < MIN_STARTING_OFFSET {
            return Err(format!(
                "starting offset {} collides with reserved routing tables (minimum {MIN_STARTING_OFFSET})",
                self.starting_offset
            ));
        }
        if self.heal_interval.is_zero() {
            return Err("heal interval must be positive".to_string());
        }
        Ok(())
    }
}
