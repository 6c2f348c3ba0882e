//! Contiguous offset tracking for acknowledged deliveries.
//!
//! Workers acknowledge envelopes out of order (different keys of one
//! partition run on different workers). The committed position of a
//! partition may only move past offsets that are *all* acknowledged, so the
//! tracker keeps the set of delivered-but-unacknowledged offsets and reports
//! the lowest of them as the next position to store.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
struct PartitionProgress {
    in_flight: BTreeSet<i64>,
    /// One past the highest offset handed out.
    next: i64,
    stored: Option<i64>,
}

impl PartitionProgress {
    fn committable(&self) -> i64 {
        self.in_flight.first().copied().unwrap_or(self.next)
    }
}

/// Per-partition progress of one subscription.
#[derive(Debug, Default)]
pub(crate) struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionProgress>,
}

impl OffsetTracker {
    /// Note that `offset` was handed to the subscriber.
    pub(crate) fn delivered(&mut self, topic: &str, partition: i32, offset: i64) {
        let progress = self
            .partitions
            .entry((topic.to_string(), partition))
            .or_default();
        progress.in_flight.insert(offset);
        progress.next = progress.next.max(offset + 1);
    }

    /// Note that `offset` was acknowledged.
    ///
    /// Returns the position to store (the next offset to consume) when it
    /// moved forward.
    pub(crate) fn acked(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let progress = self.partitions.get_mut(&(topic.to_string(), partition))?;
        if !progress.in_flight.remove(&offset) {
            return None;
        }
        let position = progress.committable();
        if progress.stored.is_some_and(|stored| stored >= position) {
            return None;
        }
        progress.stored = Some(position);
        Some(position)
    }

    /// Number of unacknowledged deliveries across all partitions.
    pub(crate) fn in_flight(&self) -> usize {
        self.partitions.values().map(|p| p.in_flight.len()).sum()
    }
}
