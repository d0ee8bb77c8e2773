//! Storage-engine snapshot bookkeeping: the ordered set of named
//! snapshots and the currently committed one.

use crate::repl::optime::{OpTime, SnapshotName};

/// Tracks `(opTime, name)` snapshots reported by the storage engine and
/// selects the current committed snapshot: the greatest tracked snapshot
/// whose position does not exceed the commit point.
#[derive(Default)]
pub struct SnapshotTracker {
    /// Tracked snapshots, sorted ascending by `(opTime, name)`.
    snapshots: Vec<(OpTime, SnapshotName)>,

    /// Current committed snapshot; monotone, reset only by drop-all.
    current: Option<(OpTime, SnapshotName)>,

    /// Source for reserved names; each reservation strictly exceeds prior
    /// ones.
    name_counter: u64,
}

impl SnapshotTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new snapshot from the storage engine.
    pub fn on_snapshot_create(&mut self, optime: OpTime, name: SnapshotName) {
        let pos = self
            .snapshots
            .partition_point(|&entry| entry < (optime, name));
        self.snapshots.insert(pos, (optime, name));
    }

    /// Re-selects the current committed snapshot against a (possibly just
    /// advanced) commit point. The selection never regresses.
    pub fn update_committed(&mut self, commit: OpTime) -> bool {
        let candidate = self
            .snapshots
            .iter()
            .rev()
            .find(|&&(optime, _)| optime <= commit)
            .copied();
        match candidate {
            Some(best) if Some(best) > self.current => {
                self.current = Some(best);
                true
            }
            _ => false,
        }
    }

    /// The current committed snapshot's position (zero if none).
    pub fn committed_optime(&self) -> OpTime {
        self.current.map(|(optime, _)| optime).unwrap_or(OpTime::ZERO)
    }

    /// The current committed snapshot's name, if one is selected.
    pub fn committed_name(&self) -> Option<SnapshotName> {
        self.current.map(|(_, name)| name)
    }

    /// Forgets every snapshot and resets the committed selection.
    pub fn drop_all(&mut self) {
        self.snapshots.clear();
        self.current = None;
    }

    /// Hands out a fresh monotone snapshot name.
    pub fn reserve_name(&mut self) -> SnapshotName {
        self.name_counter += 1;
        SnapshotName(self.name_counter)
    }
}

#[cfg(test)]
mod snapshot_tests {
    use super::*;

    #[test]
    fn closest_not_greater_selection() {
        let mut tracker = SnapshotTracker::new();
        let time = |inc| OpTime::from_parts(100, inc, 1);

        tracker.on_snapshot_create(time(1), SnapshotName(1));
        tracker.on_snapshot_create(time(2), SnapshotName(2));
        tracker.on_snapshot_create(time(5), SnapshotName(3));

        assert!(tracker.update_committed(time(3)));
        assert_eq!(tracker.committed_optime(), time(2));
        // commit at 4 still cannot reach the snapshot at 5
        assert!(!tracker.update_committed(time(4)));
        assert_eq!(tracker.committed_optime(), time(2));

        assert!(tracker.update_committed(time(6)));
        assert_eq!(tracker.committed_optime(), time(5));

        // a snapshot landing at/below commit advances immediately
        tracker.on_snapshot_create(time(6), SnapshotName(4));
        assert!(tracker.update_committed(time(6)));
        assert_eq!(tracker.committed_optime(), time(6));
        assert_eq!(tracker.committed_name(), Some(SnapshotName(4)));
    }

    #[test]
    fn selection_never_regresses() {
        let mut tracker = SnapshotTracker::new();
        let time = |inc| OpTime::from_parts(100, inc, 1);
        tracker.on_snapshot_create(time(2), SnapshotName(2));
        assert!(tracker.update_committed(time(2)));
        // smaller commit point cannot move the selection backward
        assert!(!tracker.update_committed(time(1)));
        assert_eq!(tracker.committed_optime(), time(2));
    }

    #[test]
    fn drop_all_resets() {
        let mut tracker = SnapshotTracker::new();
        tracker.on_snapshot_create(OpTime::from_parts(100, 1, 1), SnapshotName(1));
        tracker.update_committed(OpTime::from_parts(100, 1, 1));
        tracker.drop_all();
        assert_eq!(tracker.committed_optime(), OpTime::ZERO);
        assert_eq!(tracker.committed_name(), None);
    }

    #[test]
    fn reservations_strictly_increase() {
        let mut tracker = SnapshotTracker::new();
        let first = tracker.reserve_name();
        let second = tracker.reserve_name();
        assert!(second > first);
        assert!(first > SnapshotName::default());
    }
}
