use std::collections::BTreeSet;

/// Lowest slot in `0..max_slots` not present in `taken`.
pub fn lowest_free_slot(taken: &BTreeSet<u32>, max_slots: u32) -> Option<u32> {
    (0..max_slots).find(|slot| !taken.contains(slot))
}
