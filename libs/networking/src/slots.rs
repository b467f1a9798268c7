//! Forwarding-mark range allocation.
//!
//! Every service owns a contiguous block of forwarding marks
//! `[start, start + size - 1]`. Blocks never overlap, so a mark identifies
//! exactly one (service, slot) pair host-wide.

use crate::NetworkError;

/// A contiguous block of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotRange {
    /// First slot of the block.
    pub start: u32,

    /// Number of slots in the block.
    pub size: u32,
}

impl SlotRange {
    pub fn new(start: u32, size: u32) -> Self {
        Self { start, size }
    }

    /// Last slot of the block (inclusive). `None` for an empty block.
    pub fn last(&self) -> Option<u32> {
        self.size.checked_sub(1).map(|n| self.start.saturating_add(n))
    }

    /// Returns true if both blocks share at least one slot.
    pub fn overlaps(&self, other: &SlotRange) -> bool {
        match (self.last(), other.last()) {
            (Some(last), Some(other_last)) => self.start <= other_last && last >= other.start,
            _ => false,
        }
    }

    pub fn contains(&self, slot: u32) -> bool {
        self.last()
            .is_some_and(|last| (self.start..=last).contains(&slot))
    }
}

/// Find the lowest block of `size` slots starting at or above `floor` that
/// overlaps none of `existing`.
///
/// On overlap the candidate jumps straight past the conflicting block
/// instead of advancing one slot at a time.
pub fn allocate_slot_range(
    floor: u32,
    existing: &[SlotRange],
    size: u32,
) -> Result<SlotRange, NetworkError> {
    if size == 0 {
        return Err(NetworkError::InvalidRangeSize(size));
    }

    let exhausted = || NetworkError::RangeExhausted { floor, size };
    let mut start = floor;

    'search: loop {
        start.checked_add(size - 1).ok_or_else(exhausted)?;
        let candidate = SlotRange::new(start, size);

        for range in existing {
            if candidate.overlaps(range) {
                start = range.start.checked_add(range.size).ok_or_else(exhausted)?;
                continue 'search;
            }
        }

        return Ok(candidate);
    }
}
