//! Latest snapshot per identity.

use dashmap::DashMap;
use hostwatch_core::{Snapshot, StatusView};

use crate::roster::RosterMeta;

/// Concurrent identity → snapshot map. Last write wins.
#[derive(Default)]
pub struct SnapshotStore {
    snapshots: DashMap<String, Snapshot>,
}

impl SnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the snapshot for `snapshot.id`.
    pub fn put(&self, snapshot: Snapshot) {
        let _ = self.snapshots.insert(snapshot.id.clone(), snapshot);
    }

    /// Snapshot for `id`.
    pub fn get(&self, id: &str) -> Option<Snapshot> {
        self.snapshots.get(id).map(|s| s.clone())
    }

    /// Delete the snapshot for `id`.
    pub fn remove(&self, id: &str) -> Option<Snapshot> {
        self.snapshots.remove(id).map(|(_, s)| s)
    }

    /// Update display metadata in place, leaving metrics untouched.
    pub fn restamp(&self, id: &str, meta: &RosterMeta) {
        if let Some(mut snap) = self.snapshots.get_mut(id) {
            snap.name.clone_from(&meta.name);
            snap.group.clone_from(&meta.group);
            if let Some(loc) = meta.loc() {
                snap.loc = loc;
            }
        }
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Status views for every host, sorted by id.
    pub fn status_views(&self, now: i64, max_report_gap_secs: i64) -> Vec<StatusView> {
        let mut views: Vec<StatusView> = self
            .snapshots
            .iter()
            .map(|s| StatusView::from_snapshot(s.value(), now, max_report_gap_secs))
            .collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }
}
