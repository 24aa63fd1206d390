use std::collections::BTreeSet;

use cluster::ClusterState;
use models::{match_any, Entry};

/// Repository wildcard accepted by the read-only listing.
pub const ALL_REPOSITORIES: &str = "_all";

/// Read-only listing of in-progress snapshots of `repository` (or all
/// repositories with `_all`), optionally filtered by names and glob
/// patterns. Results are in start order.
pub fn current_snapshots(state: &ClusterState, repository: &str, names: &[String]) -> Vec<Entry> {
    let mut entries: Vec<Entry> = state
        .snapshots
        .entries
        .iter()
        .filter(|e| repository == ALL_REPOSITORIES || e.repository() == repository)
        .filter(|e| names.is_empty() || match_any(names, &e.snapshot.snapshot_id.name))
        .cloned()
        .collect();
    entries.sort_by(|a, b| {
        (a.start_time_ms, &a.snapshot.snapshot_id.name)
            .cmp(&(b.start_time_ms, &b.snapshot.snapshot_id.name))
    });
    entries
}

/// Of `candidates`, the indices currently being snapshotted. Used by the
/// index delete/close paths to refuse pulling an index out from under a
/// running snapshot.
pub fn snapshotting_indices<'a>(
    state: &ClusterState,
    candidates: &'a [String],
) -> BTreeSet<&'a str> {
    let mut busy = BTreeSet::new();
    for entry in &state.snapshots.entries {
        if entry.state.completed() || entry.is_clone() {
            continue;
        }
        for candidate in candidates {
            if entry.indices.iter().any(|i| &i.name == candidate) {
                busy.insert(candidate.as_str());
            }
        }
    }
    busy
}

/// Of `candidates`, the data streams currently being snapshotted.
pub fn snapshotting_data_streams<'a>(
    state: &ClusterState,
    candidates: &'a [String],
) -> BTreeSet<&'a str> {
    let mut busy = BTreeSet::new();
    for entry in &state.snapshots.entries {
        if entry.state.completed() || entry.is_clone() {
            continue;
        }
        for candidate in candidates {
            if entry.data_streams.contains(candidate) {
                busy.insert(candidate.as_str());
            }
        }
    }
    busy
}
