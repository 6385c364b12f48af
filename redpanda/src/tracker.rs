//! Per-partition offset bookkeeping for out-of-order settlement.
//!
//! Kafka commits a single offset per partition, but the relay settles messages
//! concurrently and in any order. The tracker remembers which offsets are
//! still outstanding and only ever proposes a commit point below the lowest
//! of them, so committing can never skip an unsettled message.
//!
//! Abandoned offsets stay outstanding until they are delivered again. The
//! broker seeks the partition back to the lowest abandoned offset; offsets
//! read again after that seek are skipped when they were already settled or
//! are still being processed.

use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    InFlight { delivery: u32 },
    Abandoned,
}

#[derive(Debug, Default)]
struct PartitionState {
    outstanding: BTreeMap<i64, Slot>,
    deliveries: HashMap<i64, u32>,
    highest_seen: Option<i64>,
    committed: Option<i64>,
}

impl PartitionState {
    fn commit_point(&self) -> Option<i64> {
        self.outstanding
            .keys()
            .next()
            .copied()
            .or_else(|| self.highest_seen.map(|h| h + 1))
    }
}

/// What to do with an offset just read from the partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Hand it to the processor as delivery number `delivery_count`
    Deliver {
        /// 1 on first delivery
        delivery_count: u32,
    },
    /// Already settled or still in flight; drop this copy
    Skip,
    /// Delivered too often; dead-letter it without processing
    Exhausted {
        /// Deliveries including this one
        delivery_count: u32,
    },
}

/// The delivery named by a settlement is no longer the live one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stale;

/// Offset bookkeeping for every partition of one topic.
#[derive(Debug)]
pub struct OffsetTracker {
    partitions: HashMap<i32, PartitionState>,
    max_delivery_count: u32,
}

impl OffsetTracker {
    /// Tracker that exhausts an offset on delivery `max_delivery_count + 1`.
    #[must_use]
    pub fn new(max_delivery_count: u32) -> Self {
        Self {
            partitions: HashMap::new(),
            max_delivery_count,
        }
    }

    /// Record that `offset` was read from `partition`.
    pub fn admit(&mut self, partition: i32, offset: i64) -> Admission {
        let state = self.partitions.entry(partition).or_default();

        // Reading below the commit point means the partition was reassigned
        // and restarted from an older commit.
        if state.committed.is_some_and(|c| offset < c) {
            *state = PartitionState::default();
        }

        match state.outstanding.get(&offset) {
            Some(Slot::InFlight { .. }) => return Admission::Skip,
            Some(Slot::Abandoned) => {},
            None if state.highest_seen.is_some_and(|h| offset <= h) => return Admission::Skip,
            None => {},
        }

        let count = state.deliveries.entry(offset).or_insert(0);
        *count += 1;
        let delivery_count = *count;

        state.highest_seen = Some(state.highest_seen.map_or(offset, |h| h.max(offset)));
        state.outstanding.insert(
            offset,
            Slot::InFlight {
                delivery: delivery_count,
            },
        );

        if delivery_count > self.max_delivery_count {
            Admission::Exhausted { delivery_count }
        } else {
            Admission::Deliver { delivery_count }
        }
    }

    /// Mark delivery `delivery` of `offset` as settled.
    ///
    /// Returns the new commit point when it advanced.
    ///
    /// # Errors
    ///
    /// Returns [`Stale`] if that delivery is not the live one.
    pub fn settle(&mut self, partition: i32, offset: i64, delivery: u32) -> Result<Option<i64>, Stale> {
        let state = self.live_state(partition, offset, delivery)?;
        state.outstanding.remove(&offset);
        state.deliveries.remove(&offset);

        let Some(point) = state.commit_point() else {
            return Ok(None);
        };
        if state.committed.is_none_or(|c| point > c) {
            state.committed = Some(point);
            Ok(Some(point))
        } else {
            Ok(None)
        }
    }

    /// Release delivery `delivery` of `offset` for redelivery.
    ///
    /// Returns the offset to seek the partition to: the lowest abandoned one.
    ///
    /// # Errors
    ///
    /// Returns [`Stale`] if that delivery is not the live one.
    pub fn release(&mut self, partition: i32, offset: i64, delivery: u32) -> Result<i64, Stale> {
        let state = self.live_state(partition, offset, delivery)?;
        state.outstanding.insert(offset, Slot::Abandoned);
        Ok(state
            .outstanding
            .iter()
            .find(|(_, slot)| **slot == Slot::Abandoned)
            .map_or(offset, |(o, _)| *o))
    }

    /// Forget everything known about `partitions` after they were revoked.
    ///
    /// Deliveries still in flight on them become [`Stale`].
    pub fn revoke(&mut self, partitions: &[i32]) {
        for partition in partitions {
            self.partitions.remove(partition);
        }
    }

    /// Whether delivery `delivery` of `offset` is still the live one.
    #[must_use]
    pub fn is_live(&self, partition: i32, offset: i64, delivery: u32) -> bool {
        self.partitions.get(&partition).is_some_and(|s| {
            matches!(s.outstanding.get(&offset), Some(Slot::InFlight { delivery: d }) if *d == delivery)
        })
    }

    /// Offsets not yet settled on `partition`.
    #[must_use]
    pub fn outstanding(&self, partition: i32) -> usize {
        self.partitions
            .get(&partition)
            .map_or(0, |s| s.outstanding.len())
    }

    fn live_state(
        &mut self,
        partition: i32,
        offset: i64,
        delivery: u32,
    ) -> Result<&mut PartitionState, Stale> {
        let state = self.partitions.get_mut(&partition).ok_or(Stale)?;
        match state.outstanding.get(&offset) {
            Some(Slot::InFlight { delivery: d }) if *d == delivery => Ok(state),
            _ => Err(Stale),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn deliver(tracker: &mut OffsetTracker, offset: i64) -> u32 {
        match tracker.admit(0, offset) {
            Admission::Deliver { delivery_count } => delivery_count,
            other => panic!("expected delivery of {offset}, got {other:?}"),
        }
    }

    #[test]
    fn in_order_settlement_commits_past_each_offset() {
        let mut t = OffsetTracker::new(5);
        deliver(&mut t, 10);
        deliver(&mut t, 11);

        assert_eq!(t.settle(0, 10, 1), Ok(Some(11)));
        assert_eq!(t.settle(0, 11, 1), Ok(Some(12)));
    }

    #[test]
    fn out_of_order_settlement_waits_for_the_gap() {
        let mut t = OffsetTracker::new(5);
        for o in 0..3 {
            deliver(&mut t, o);
        }

        assert_eq!(t.settle(0, 2, 1), Ok(None));
        assert_eq!(t.settle(0, 1, 1), Ok(None));
        assert_eq!(t.settle(0, 0, 1), Ok(Some(3)));
    }

    #[test]
    fn abandoned_offset_blocks_commit_and_is_redelivered() {
        let mut t = OffsetTracker::new(5);
        deliver(&mut t, 0);
        deliver(&mut t, 1);

        assert_eq!(t.release(0, 0, 1), Ok(0));
        assert_eq!(t.settle(0, 1, 1), Ok(None));

        // After the seek both offsets are read again; only 0 is live.
        assert_eq!(t.admit(0, 0), Admission::Deliver { delivery_count: 2 });
        assert_eq!(t.admit(0, 1), Admission::Skip);
        assert_eq!(t.settle(0, 0, 2), Ok(Some(2)));
    }

    #[test]
    fn seek_target_is_lowest_abandoned() {
        let mut t = OffsetTracker::new(5);
        for o in 0..4 {
            deliver(&mut t, o);
        }
        assert_eq!(t.release(0, 2, 1), Ok(2));
        assert_eq!(t.release(0, 1, 1), Ok(1));
        assert_eq!(t.release(0, 3, 1), Ok(1));
    }

    #[test]
    fn in_flight_copy_is_skipped() {
        let mut t = OffsetTracker::new(5);
        deliver(&mut t, 7);
        assert_eq!(t.admit(0, 7), Admission::Skip);
    }

    #[test]
    fn stale_delivery_cannot_settle() {
        let mut t = OffsetTracker::new(5);
        deliver(&mut t, 0);
        t.release(0, 0, 1).unwrap();
        deliver(&mut t, 0);

        assert!(!t.is_live(0, 0, 1));
        assert!(t.is_live(0, 0, 2));
        assert_eq!(t.settle(0, 0, 1), Err(Stale));
        assert_eq!(t.release(0, 0, 1), Err(Stale));
        assert_eq!(t.settle(0, 0, 2), Ok(Some(1)));
        assert_eq!(t.settle(3, 0, 1), Err(Stale));
    }

    #[test]
    fn exhausted_after_max_deliveries() {
        let mut t = OffsetTracker::new(2);
        deliver(&mut t, 0);
        t.release(0, 0, 1).unwrap();
        deliver(&mut t, 0);
        t.release(0, 0, 2).unwrap();

        assert_eq!(t.admit(0, 0), Admission::Exhausted { delivery_count: 3 });
        assert_eq!(t.settle(0, 0, 3), Ok(Some(1)));
        assert_eq!(t.outstanding(0), 0);
    }

    #[test]
    fn reassignment_from_older_commit_resets_partition() {
        let mut t = OffsetTracker::new(5);
        deliver(&mut t, 5);
        t.settle(0, 5, 1).unwrap();
        deliver(&mut t, 6);

        // Another consumer owned the partition and it came back at offset 3.
        assert_eq!(t.admit(0, 3), Admission::Deliver { delivery_count: 1 });
        assert_eq!(t.outstanding(0), 1);
    }

    #[test]
    fn partitions_are_independent() {
        let mut t = OffsetTracker::new(5);
        assert_eq!(t.admit(0, 0), Admission::Deliver { delivery_count: 1 });
        assert_eq!(t.admit(1, 0), Admission::Deliver { delivery_count: 1 });
        assert_eq!(t.settle(1, 0, 1), Ok(Some(1)));
        assert_eq!(t.outstanding(0), 1);
    }

    #[test]
    fn revoked_partition_resumes_committing_past_an_abandoned_offset() {
        let mut t = OffsetTracker::new(5);
        for o in 0..=10 {
            deliver(&mut t, o);
        }
        for o in (0..=10).filter(|o| *o != 5) {
            t.settle(0, o, 1).unwrap();
        }
        assert_eq!(t.release(0, 5, 1), Ok(5));

        // Another member moved past offset 5 while the partition was away.
        t.revoke(&[0]);
        assert_eq!(t.outstanding(0), 0);
        assert_eq!(t.settle(0, 5, 1), Err(Stale));

        let points: Vec<Option<i64>> = (21..=30)
            .map(|o| {
                deliver(&mut t, o);
                t.settle(0, o, 1).unwrap()
            })
            .collect();
        assert_eq!(points.first(), Some(&Some(22)));
        assert_eq!(points.last(), Some(&Some(31)));
        assert_eq!(t.outstanding(0), 0);
    }

    #[test]
    fn revoke_leaves_other_partitions_alone() {
        let mut t = OffsetTracker::new(5);
        deliver(&mut t, 0);
        assert_eq!(t.admit(1, 0), Admission::Deliver { delivery_count: 1 });

        t.revoke(&[1]);

        assert!(t.is_live(0, 0, 1));
        assert!(!t.is_live(1, 0, 1));
        assert_eq!(t.settle(0, 0, 1), Ok(Some(1)));
    }
}
