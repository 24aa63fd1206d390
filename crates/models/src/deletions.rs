use serde::{Deserialize, Serialize};

use crate::SnapshotId;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeletionState {
    /// Admitted but blocked by an in-flight write to the same repository.
    Waiting,
    Started,
}

/// One in-flight deletion of a batch of snapshots from a repository.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct DeletionEntry {
    pub uuid: uuid::Uuid,
    pub repository: String,
    pub snapshots: Vec<SnapshotId>,
    pub start_time_ms: i64,
    /// Repository generation observed when this deletion was admitted.
    pub repo_generation: i64,
    pub state: DeletionState,
}

impl DeletionEntry {
    pub fn contains(&self, id: &SnapshotId) -> bool {
        self.snapshots.contains(id)
    }

    pub fn started(&self) -> DeletionEntry {
        DeletionEntry {
            state: DeletionState::Started,
            ..self.clone()
        }
    }

    /// Merges further snapshot ids into this (still waiting) deletion.
    pub fn with_snapshots_added(&self, ids: &[SnapshotId]) -> DeletionEntry {
        let mut snapshots = self.snapshots.clone();
        for id in ids {
            if !snapshots.contains(id) {
                snapshots.push(id.clone());
            }
        }
        DeletionEntry {
            snapshots,
            ..self.clone()
        }
    }
}

/// The `SnapshotDeletionsInProgress` cluster-state section, in admission
/// order. At most one entry per repository is STARTED at any time.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct SnapshotDeletionsInProgress {
    pub entries: Vec<DeletionEntry>,
}

impl SnapshotDeletionsInProgress {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, uuid: &uuid::Uuid) -> Option<&DeletionEntry> {
        self.entries.iter().find(|e| &e.uuid == uuid)
    }

    pub fn for_repo<'a>(
        &'a self,
        repository: &'a str,
    ) -> impl Iterator<Item = &'a DeletionEntry> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.repository == repository)
    }

    pub fn started_for_repo<'a>(&'a self, repository: &'a str) -> Option<&'a DeletionEntry> {
        self.for_repo(repository)
            .find(|e| e.state == DeletionState::Started)
    }

    /// Whether the given snapshot is the subject of any in-flight deletion.
    pub fn deleting(&self, id: &SnapshotId) -> bool {
        self.entries.iter().any(|e| e.contains(id))
    }

    pub fn with_entry_replaced(&self, entry: DeletionEntry) -> SnapshotDeletionsInProgress {
        SnapshotDeletionsInProgress {
            entries: self
                .entries
                .iter()
                .map(|e| {
                    if e.uuid == entry.uuid {
                        entry.clone()
                    } else {
                        e.clone()
                    }
                })
                .collect(),
        }
    }

    pub fn with_entry_added(&self, entry: DeletionEntry) -> SnapshotDeletionsInProgress {
        let mut entries = self.entries.clone();
        entries.push(entry);
        SnapshotDeletionsInProgress { entries }
    }

    pub fn without(&self, uuid: &uuid::Uuid) -> SnapshotDeletionsInProgress {
        SnapshotDeletionsInProgress {
            entries: self
                .entries
                .iter()
                .filter(|e| &e.uuid != uuid)
                .cloned()
                .collect(),
        }
    }
}
