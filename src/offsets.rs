//! Offset commit coordinator.
//!
//! Tracks consumed-but-not-yet-committed positions per partition and decides
//! how far a partition may be committed. The committable point only moves
//! across offsets that were recorded and then handled, one at a time from
//! the previous commit point, so a crash replays at most the gap between the
//! last commit and the crash point.
//!
//! Offsets the broker never hands out (compacted or never produced) must be
//! skipped explicitly with [`OffsetCommitCoordinator::skip_to`].
//!
//! The coordinator is owned by a single consumption loop and does no locking.

use std::collections::{BTreeSet, HashMap};

/// Offset value meaning "nothing committed yet".
pub const NO_OFFSET: i64 = -1;

/// Commit state of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionOffset {
    pub partition: u32,
    /// Last offset acknowledged by the broker's commit; never decreases.
    pub committed_offset: i64,
    /// Highest offset eligible for commit; `>= committed_offset`.
    pub committable_offset: i64,
    /// Offsets delivered to the handler and not yet handled.
    pub pending_offsets: BTreeSet<i64>,
    /// Handled offsets above `committable_offset`, waiting on a predecessor.
    handled_offsets: BTreeSet<i64>,
}

impl PartitionOffset {
    fn new(partition: u32, committed: i64) -> Self {
        // ---
        Self {
            partition,
            committed_offset: committed,
            committable_offset: committed,
            pending_offsets: BTreeSet::new(),
            handled_offsets: BTreeSet::new(),
        }
    }

    /// Step the committable point over handled successors; `true` if it moved.
    fn advance(&mut self) -> bool {
        // ---
        let start = self.committable_offset;
        while self.handled_offsets.remove(&(self.committable_offset + 1)) {
            self.committable_offset += 1;
        }
        self.committable_offset > start
    }
}

/// Per-partition offset bookkeeping.
#[derive(Debug, Default)]
pub struct OffsetCommitCoordinator {
    partitions: HashMap<u32, PartitionOffset>,
}

impl OffsetCommitCoordinator {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialise `partition` from the broker's committed offset.
    ///
    /// Only moves forward; seeding below the current commit point is ignored.
    pub fn seed(&mut self, partition: u32, committed: Option<i64>) {
        // ---
        let committed = committed.unwrap_or(NO_OFFSET);
        let state = self.state_mut(partition);

        if committed > state.committed_offset {
            state.committed_offset = committed;
            state.committable_offset = state.committable_offset.max(committed);
            state.pending_offsets.retain(|offset| *offset > committed);
            state.handled_offsets.retain(|offset| *offset > committed);
            state.advance();
        }
    }

    /// Record that `offset` was handed to the handler.
    ///
    /// Returns `false` (and records nothing) if the offset is at or below the
    /// committable point, already pending, or already handled.
    pub fn record_pending(&mut self, partition: u32, offset: i64) -> bool {
        // ---
        let state = self.state_mut(partition);

        if offset <= state.committable_offset || state.handled_offsets.contains(&offset) {
            return false;
        }
        state.pending_offsets.insert(offset)
    }

    /// Record that the handler finished with `offset`.
    ///
    /// Returns the new committable offset if it advanced.
    pub fn record_handled(&mut self, partition: u32, offset: i64) -> Option<i64> {
        // ---
        let state = self.partitions.get_mut(&partition)?;

        if !state.pending_offsets.remove(&offset) {
            return None;
        }
        state.handled_offsets.insert(offset);

        state.advance().then_some(state.committable_offset)
    }

    /// Declare that no offsets exist between the committable point and
    /// `offset`, as when the broker's next record sits past a gap.
    ///
    /// Refused while an offset below `offset` is pending. Returns the new
    /// committable offset if it advanced.
    pub fn skip_to(&mut self, partition: u32, offset: i64) -> Option<i64> {
        // ---
        let state = self.state_mut(partition);
        let below = offset - 1;

        if below <= state.committable_offset {
            return None;
        }
        if state.pending_offsets.first().is_some_and(|lowest| *lowest < offset) {
            return None;
        }

        state.committable_offset = below;
        state.handled_offsets.retain(|handled| *handled > below);
        state.advance();
        Some(state.committable_offset)
    }

    /// Drop pending offsets `>= from` that will not be handled (for example
    /// the rest of a batch interrupted by shutdown).
    pub fn release_from(&mut self, partition: u32, from: i64) {
        // ---
        if let Some(state) = self.partitions.get_mut(&partition) {
            state.pending_offsets.retain(|offset| *offset < from);
        }
    }

    /// Offset that should be sent to the broker, if ahead of the last commit.
    pub fn commit_target(&self, partition: u32) -> Option<i64> {
        // ---
        self.partitions
            .get(&partition)
            .filter(|state| state.committable_offset > state.committed_offset)
            .map(|state| state.committable_offset)
    }

    /// Record a successful broker commit of `offset`.
    pub fn mark_committed(&mut self, partition: u32, offset: i64) {
        // ---
        let state = self.state_mut(partition);
        if offset > state.committed_offset && offset <= state.committable_offset {
            state.committed_offset = offset;
        }
    }

    pub fn committed(&self, partition: u32) -> i64 {
        // ---
        self.partitions
            .get(&partition)
            .map_or(NO_OFFSET, |state| state.committed_offset)
    }

    pub fn committable(&self, partition: u32) -> i64 {
        // ---
        self.partitions
            .get(&partition)
            .map_or(NO_OFFSET, |state| state.committable_offset)
    }

    pub fn lowest_pending(&self, partition: u32) -> Option<i64> {
        // ---
        self.partitions
            .get(&partition)
            .and_then(|state| state.pending_offsets.first().copied())
    }

    pub fn partition(&self, partition: u32) -> Option<&PartitionOffset> {
        self.partitions.get(&partition)
    }

    fn state_mut(&mut self, partition: u32) -> &mut PartitionOffset {
        // ---
        self.partitions
            .entry(partition)
            .or_insert_with(|| PartitionOffset::new(partition, NO_OFFSET))
    }
}
