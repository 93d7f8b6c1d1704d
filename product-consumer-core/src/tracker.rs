//! Tracks which offsets of each partition have been delivered, resolved and committed.
//!
//! Messages of a batch finish in any order, so a later offset is often resolved before an
//! earlier one. The commit point of a partition is therefore the highest resolved offset
//! that has no delivered-but-unresolved offset below it:
//!
//! ```text
//! delivered:  10  11  12  13  14
//! resolved:   10  11      13  14
//!                  ^
//!            commit point (12 still pending)
//! ```
//!
//! Resolved offsets are kept as merged inclusive ranges, so a partition whose commit point
//! is held back by one unresolved offset holds a handful of ranges, not every offset it
//! consumed since.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct PartitionOffsets {
    /// Delivered and not yet resolved.
    pending: BTreeSet<i64>,
    /// Resolved and not yet committed, as `start -> end` (inclusive), never adjacent.
    resolved: BTreeMap<i64, i64>,
    committed: Option<i64>,
}

impl PartitionOffsets {
    fn is_committed(&self, offset: i64) -> bool {
        self.committed.is_some_and(|committed| offset <= committed)
    }

    fn is_resolved(&self, offset: i64) -> bool {
        self.resolved
            .range(..=offset)
            .next_back()
            .is_some_and(|(_, end)| offset <= *end)
    }

    /// Adds `offset` to the resolved ranges, merging with its neighbours.
    fn insert_resolved(&mut self, offset: i64) {
        let mut start = offset;
        let mut end = offset;
        let adjacent = self
            .resolved
            .range(..offset)
            .next_back()
            .filter(|(_, prev_end)| **prev_end + 1 == offset);
        if let Some((&prev_start, _)) = adjacent {
            start = prev_start;
        }
        if let Some(next_end) = self.resolved.remove(&(offset + 1)) {
            end = next_end;
        }
        self.resolved.insert(start, end);
    }

    fn lowest_unresolved(&self) -> Option<i64> {
        self.pending.first().copied()
    }
}

/// Offset bookkeeping shared by the messages of a batch. The lock is never held across an
/// await point.
#[derive(Debug, Default)]
pub(crate) struct OffsetTracker {
    partitions: Mutex<HashMap<i32, PartitionOffsets>>,
}

impl OffsetTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records a delivered offset. Returns false when the offset was already resolved or
    /// committed, i.e. the message is a re-delivery that needs no processing.
    pub(crate) fn track(&self, partition: i32, offset: i64) -> bool {
        let mut partitions = self.partitions.lock();
        let state = partitions.entry(partition).or_default();
        if state.is_committed(offset) || state.is_resolved(offset) {
            return false;
        }
        state.pending.insert(offset);
        true
    }

    /// Marks the offset as having reached a terminal outcome. Returns false if it was
    /// resolved or committed before.
    pub(crate) fn resolve(&self, partition: i32, offset: i64) -> bool {
        let mut partitions = self.partitions.lock();
        let state = partitions.entry(partition).or_default();
        state.pending.remove(&offset);
        if state.is_committed(offset) || state.is_resolved(offset) {
            return false;
        }
        state.insert_resolved(offset);
        true
    }

    #[cfg(test)]
    pub(crate) fn is_resolved(&self, partition: i32, offset: i64) -> bool {
        let partitions = self.partitions.lock();
        partitions
            .get(&partition)
            .is_some_and(|state| state.is_committed(offset) || state.is_resolved(offset))
    }

    /// The highest offset that can be committed for the partition, if it moves the committed
    /// position forward.
    pub(crate) fn uncommitted(&self, partition: i32) -> Option<i64> {
        let partitions = self.partitions.lock();
        let state = partitions.get(&partition)?;
        // the floor itself is never inside a resolved range
        let below = match state.lowest_unresolved() {
            Some(floor) => state.resolved.range(..floor).next_back(),
            None => state.resolved.last_key_value(),
        };
        below.map(|(_, end)| *end)
    }

    /// Records a successful commit and forgets everything at or below it.
    pub(crate) fn mark_committed(&self, partition: i32, offset: i64) {
        let mut partitions = self.partitions.lock();
        let state = partitions.entry(partition).or_default();
        if state.is_committed(offset) {
            return;
        }
        state.committed = Some(offset);
        state.pending = state.pending.split_off(&(offset + 1));

        let straddling = state
            .resolved
            .range(..=offset)
            .next_back()
            .map(|(_, end)| *end)
            .filter(|end| *end > offset);
        state.resolved = state.resolved.split_off(&(offset + 1));
        if let Some(end) = straddling {
            state.resolved.insert(offset + 1, end);
        }
    }

    #[cfg(test)]
    pub(crate) fn committed(&self, partition: i32) -> Option<i64> {
        let partitions = self.partitions.lock();
        partitions.get(&partition).and_then(|state| state.committed)
    }

    /// The unresolved offset holding the commit point back, if any.
    pub(crate) fn stalled_at(&self, partition: i32) -> Option<i64> {
        let partitions = self.partitions.lock();
        partitions
            .get(&partition)
            .and_then(PartitionOffsets::lowest_unresolved)
    }

    /// Number of pending offsets and resolved ranges held for the partition.
    #[cfg(test)]
    fn footprint(&self, partition: i32) -> (usize, usize) {
        let partitions = self.partitions.lock();
        partitions
            .get(&partition)
            .map_or((0, 0), |state| (state.pending.len(), state.resolved.len()))
    }
}
