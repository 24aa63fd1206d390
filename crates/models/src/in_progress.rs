use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    IndexId, RepositoryShardId, ShardGeneration, ShardId, ShardSnapshotStatus, ShardState,
    Snapshot, SnapshotId, Version,
};

/// Failure text recorded on entries aborted by an overlapping deletion.
pub const ABORTED_BY_DELETION: &str = "Snapshot was aborted by deletion";

/// Lifecycle state of an in-progress snapshot or clone entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotState {
    Init,
    Started,
    Success,
    Failed,
    Aborted,
}

impl SnapshotState {
    /// Completed entries are retained in cluster state only until their
    /// finalization removes them. ABORTED is not completed: data nodes
    /// still have to acknowledge the abort shard by shard.
    pub fn completed(&self) -> bool {
        matches!(self, SnapshotState::Success | SnapshotState::Failed)
    }
}

/// One in-flight snapshot create or clone.
///
/// A normal snapshot tracks its work in `shards`, keyed by runtime routing
/// coordinates; a clone tracks `clones`, keyed by repository coordinates,
/// and records the `source` it copies from. Exactly one of the two maps is
/// populated once the entry has shards at all.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Entry {
    pub snapshot: Snapshot,
    pub include_global_state: bool,
    pub partial: bool,
    pub state: SnapshotState,
    pub indices: Vec<IndexId>,
    pub data_streams: Vec<String>,
    pub start_time_ms: i64,
    /// Repository generation observed when this entry was admitted.
    pub repo_generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_metadata: Option<serde_json::Value>,
    pub repository_meta_version: Version,
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        with = "crate::map_as_pairs"
    )]
    pub shards: BTreeMap<ShardId, ShardSnapshotStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SnapshotId>,
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        with = "crate::map_as_pairs"
    )]
    pub clones: BTreeMap<RepositoryShardId, ShardSnapshotStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Entry {
    pub fn is_clone(&self) -> bool {
        self.source.is_some()
    }

    pub fn repository(&self) -> &str {
        &self.snapshot.repository
    }

    /// Resolves the repository identity of a live index of this entry.
    pub fn index_id(&self, index_name: &str) -> Option<&IndexId> {
        self.indices.iter().find(|i| i.name == index_name)
    }

    /// All shard statuses of this entry, keyed by repository coordinates.
    /// For clone entries this is the native keying; for snapshot entries
    /// the runtime ShardId is translated through `indices`.
    pub fn repo_shard_statuses(
        &self,
    ) -> impl Iterator<Item = (RepositoryShardId, &ShardSnapshotStatus)> {
        let from_clones = self.clones.iter().map(|(id, status)| (id.clone(), status));
        let from_shards = self.shards.iter().filter_map(|(id, status)| {
            let index = self.index_id(&id.index)?;
            Some((RepositoryShardId::new(index.clone(), id.shard), status))
        });
        from_clones.chain(from_shards)
    }

    fn statuses(&self) -> impl Iterator<Item = &ShardSnapshotStatus> {
        self.shards.values().chain(self.clones.values())
    }

    /// Whether every shard of this entry reached a terminal status.
    pub fn all_shards_completed(&self) -> bool {
        self.statuses().all(|s| s.state.completed())
    }

    pub fn has_failed_shards(&self) -> bool {
        self.statuses().any(|s| s.state.failed())
    }

    /// Marks every non-completed shard aborted in response to a deletion of
    /// this snapshot. Returns `None` when the entry had done no work at all
    /// (every shard still queued, or no shards assigned yet), in which case
    /// it is removed from cluster state outright instead.
    pub fn abort(&self) -> Option<Entry> {
        let mut all_queued = true;
        let mut completed = true;

        let patch = |status: &ShardSnapshotStatus, all_queued: &mut bool, completed: &mut bool| {
            *all_queued &= status.state == ShardState::Queued;
            let status = if status.state.completed() {
                status.clone()
            } else if status.node_id.is_some() {
                ShardSnapshotStatus {
                    state: ShardState::Aborted,
                    node_id: status.node_id.clone(),
                    reason: Some(ABORTED_BY_DELETION.to_string()),
                    generation: status.generation.clone(),
                }
            } else {
                // Never reached a data node: fail it outright.
                ShardSnapshotStatus::failed(
                    None,
                    ABORTED_BY_DELETION,
                    status.generation.clone(),
                )
            };
            *completed &= status.state.completed();
            status
        };

        let shards: BTreeMap<_, _> = self
            .shards
            .iter()
            .map(|(id, s)| (id.clone(), patch(s, &mut all_queued, &mut completed)))
            .collect();
        let clones: BTreeMap<_, _> = self
            .clones
            .iter()
            .map(|(id, s)| (id.clone(), patch(s, &mut all_queued, &mut completed)))
            .collect();

        if all_queued {
            return None;
        }
        Some(Entry {
            state: if completed {
                SnapshotState::Success
            } else {
                SnapshotState::Aborted
            },
            failure: Some(ABORTED_BY_DELETION.to_string()),
            shards,
            clones,
            ..self.clone()
        })
    }

    /// Returns this entry with one shard status replaced, recomputing the
    /// entry-level state when the patch completes the last shard.
    pub fn with_shard_status(
        &self,
        key: &EntryShardKey,
        status: ShardSnapshotStatus,
    ) -> Entry {
        let mut updated = self.clone();
        match key {
            EntryShardKey::Routing(id) => {
                updated.shards.insert(id.clone(), status);
            }
            EntryShardKey::Repository(id) => {
                updated.clones.insert(id.clone(), status);
            }
        }
        if updated.state == SnapshotState::Started && updated.all_shards_completed() {
            updated.state = if updated.has_failed_shards() && !updated.partial {
                SnapshotState::Failed
            } else {
                SnapshotState::Success
            };
        }
        updated
    }

    /// Looks up the status slot addressed by either coordinate system.
    pub fn shard_status(&self, key: &EntryShardKey) -> Option<&ShardSnapshotStatus> {
        match key {
            EntryShardKey::Routing(id) => self.shards.get(id),
            EntryShardKey::Repository(id) => self.clones.get(id),
        }
    }
}

/// Address of one shard slot of an entry, in whichever coordinate system
/// the entry uses.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum EntryShardKey {
    Routing(ShardId),
    Repository(RepositoryShardId),
}

/// The `SnapshotsInProgress` cluster-state section: all in-flight snapshot
/// and clone entries, in admission order.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct SnapshotsInProgress {
    pub entries: Vec<Entry>,
}

impl SnapshotsInProgress {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, snapshot: &Snapshot) -> Option<&Entry> {
        self.entries.iter().find(|e| &e.snapshot == snapshot)
    }

    pub fn for_repo<'a>(&'a self, repository: &'a str) -> impl Iterator<Item = &'a Entry> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.repository() == repository)
    }

    pub fn with_entry_replaced(&self, entry: Entry) -> SnapshotsInProgress {
        SnapshotsInProgress {
            entries: self
                .entries
                .iter()
                .map(|e| {
                    if e.snapshot == entry.snapshot {
                        entry.clone()
                    } else {
                        e.clone()
                    }
                })
                .collect(),
        }
    }

    pub fn without(&self, snapshot: &Snapshot) -> SnapshotsInProgress {
        SnapshotsInProgress {
            entries: self
                .entries
                .iter()
                .filter(|e| &e.snapshot != snapshot)
                .cloned()
                .collect(),
        }
    }
}

/// Index of which repository shards are currently held by in-flight
/// operations of one repository, plus the latest successfully written
/// generation per shard. Computed from the entries of that repository and
/// consulted when admitting new shard-level work.
#[derive(Debug, Default)]
pub struct InFlightShardStates {
    active: BTreeSet<RepositoryShardId>,
    generations: BTreeMap<RepositoryShardId, ShardGeneration>,
}

impl InFlightShardStates {
    pub fn from_entries<'a>(entries: impl Iterator<Item = &'a Entry>) -> Self {
        let mut states = Self::default();
        for entry in entries {
            if entry.state.completed() {
                continue;
            }
            for (repo_shard, status) in entry.repo_shard_statuses() {
                if status.is_active() {
                    states.active.insert(repo_shard);
                } else if status.state == ShardState::Success {
                    if let Some(gen) = &status.generation {
                        // Entries iterate oldest-first; the newest
                        // successful write wins.
                        states.generations.insert(repo_shard, gen.clone());
                    }
                }
            }
        }
        states
    }

    pub fn is_active(&self, repo_shard: &RepositoryShardId) -> bool {
        self.active.contains(repo_shard)
    }

    pub fn generation(&self, repo_shard: &RepositoryShardId) -> Option<&ShardGeneration> {
        self.generations.get(repo_shard)
    }
}
