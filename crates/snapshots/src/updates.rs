use cluster::RoutingTable;
use models::{
    Entry, EntryShardKey, NodeId, RepositoryShardId, ShardId, ShardSnapshotStatus, Snapshot,
    SnapshotsInProgress,
};

/// A shard-level status report: from a data node (routing coordinates) or
/// from the local shard-clone runner (repository coordinates).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardSnapshotUpdate {
    pub snapshot: Snapshot,
    pub key: EntryShardKey,
    pub status: ShardSnapshotStatus,
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub snapshots: SnapshotsInProgress,
    /// Number of updates that patched an entry (as opposed to idempotent
    /// retries and updates for since-removed entries, which are no-ops).
    pub executed: usize,
}

enum Slot<'a> {
    Pending(&'a ShardSnapshotUpdate),
    /// Applied to its target entry with a terminal status: the repository
    /// shard it released may be handed to one queued waiter.
    Released {
        update: &'a ShardSnapshotUpdate,
        repo_shard: RepositoryShardId,
    },
    Consumed,
}

/// Folds a batch of shard updates into the in-progress entries as one
/// aggregate transition.
///
/// Entries are visited oldest-first and updates are matched in batch
/// order, so a repository shard released by the oldest operation is handed
/// to the next-oldest queued waiter, and each released shard starts at
/// most one waiter. Updates whose slot already holds a terminal status are
/// dropped, tolerating at-least-once delivery from data nodes.
pub fn apply_shard_updates(
    current: &SnapshotsInProgress,
    routing: &RoutingTable,
    local_node: Option<&NodeId>,
    updates: &[ShardSnapshotUpdate],
) -> BatchOutcome {
    let mut slots: Vec<Slot> = updates.iter().map(Slot::Pending).collect();
    let mut entries = Vec::with_capacity(current.entries.len());
    let mut executed = 0;

    for entry in &current.entries {
        if entry.state.completed() {
            entries.push(entry.clone());
            continue;
        }
        let mut updated = entry.clone();

        for slot in slots.iter_mut() {
            match slot {
                Slot::Consumed => {}
                Slot::Pending(update) => {
                    let update = *update;
                    if update.snapshot != updated.snapshot {
                        continue;
                    }
                    let existing_completed = updated
                        .shard_status(&update.key)
                        .map(|s| s.state.completed());
                    match existing_completed {
                        // A slot this entry never had, or an idempotent
                        // retry of an already-terminal one: drop it.
                        None | Some(true) => *slot = Slot::Consumed,
                        Some(false) => {
                            updated = updated.with_shard_status(&update.key, update.status.clone());
                            executed += 1;
                            tracing::debug!(
                                snapshot = %update.snapshot,
                                key = ?update.key,
                                state = ?update.status.state,
                                "applied shard snapshot update"
                            );
                            *slot = match repo_shard_of(&updated, &update.key) {
                                Some(repo_shard) if update.status.state.completed() => {
                                    Slot::Released { update, repo_shard }
                                }
                                _ => Slot::Consumed,
                            };
                        }
                    }
                }
                Slot::Released { update, repo_shard } => {
                    let update = *update;
                    if update.snapshot.repository != updated.repository()
                        || update.snapshot == updated.snapshot
                    {
                        continue;
                    }
                    let promoted =
                        promote_queued(&updated, update, repo_shard, routing, local_node);
                    if let Some((key, status)) = promoted {
                        tracing::debug!(
                            snapshot = %updated.snapshot,
                            key = ?key,
                            state = ?status.state,
                            "promoted queued shard after release"
                        );
                        updated = updated.with_shard_status(&key, status);
                        *slot = Slot::Consumed;
                    }
                }
            }
        }
        entries.push(updated);
    }

    BatchOutcome {
        snapshots: SnapshotsInProgress { entries },
        executed,
    }
}

fn repo_shard_of(entry: &Entry, key: &EntryShardKey) -> Option<RepositoryShardId> {
    match key {
        EntryShardKey::Repository(id) => Some(id.clone()),
        EntryShardKey::Routing(id) => entry
            .index_id(&id.index)
            .map(|index| RepositoryShardId::new(index.clone(), id.shard)),
    }
}

/// If `entry` has a queued slot for the released repository shard,
/// computes its fresh active status: a clone starts on the local
/// (cluster-manager) node, a snapshot on the node that released the shard
/// or, when the release came from a clone, on the shard's current primary.
fn promote_queued(
    entry: &Entry,
    update: &ShardSnapshotUpdate,
    repo_shard: &RepositoryShardId,
    routing: &RoutingTable,
    local_node: Option<&NodeId>,
) -> Option<(EntryShardKey, ShardSnapshotStatus)> {
    let generation = update.status.generation.clone();

    if entry.is_clone() {
        let key = EntryShardKey::Repository(repo_shard.clone());
        let status = entry.shard_status(&key)?;
        if !status.is_unassigned_queued() {
            return None;
        }
        let node = local_node?.clone();
        return Some((key, ShardSnapshotStatus::init(node, generation)));
    }

    // Translate repository coordinates back through the entry's own index
    // list; a same-named index with a different repository identity is a
    // different index.
    let index = entry.index_id(&repo_shard.index.name)?;
    if *index != repo_shard.index {
        return None;
    }
    let shard_id = ShardId::new(repo_shard.index.name.clone(), repo_shard.shard);
    let key = EntryShardKey::Routing(shard_id.clone());
    let status = entry.shard_status(&key)?;
    if !status.is_unassigned_queued() {
        return None;
    }

    let released_by = match &update.key {
        EntryShardKey::Routing(_) => update.status.node_id.clone(),
        // A clone ran on the cluster-manager; route the snapshot to the
        // shard's actual primary instead.
        EntryShardKey::Repository(_) => None,
    };
    let status = match released_by {
        Some(node) => ShardSnapshotStatus::init(node, generation),
        None => match routing.primary(&shard_id) {
            Some(primary) if primary.is_started() => match &primary.node {
                Some(node) => ShardSnapshotStatus::init(node.clone(), generation),
                None => ShardSnapshotStatus::failed(None, "shard is unassigned", generation),
            },
            _ => ShardSnapshotStatus::failed(None, "shard is unassigned", generation),
        },
    };
    Some((key, status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::{
        IndexId, ShardGeneration, ShardState, SnapshotId, SnapshotState, Version,
    };
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn index() -> IndexId {
        IndexId::new("idx", uuid::Uuid::from_u128(10))
    }

    fn snapshot(n: u128) -> Snapshot {
        Snapshot::new("repo", SnapshotId::new(format!("s{n}"), uuid::Uuid::from_u128(n)))
    }

    fn entry(n: u128, shards: Vec<(ShardId, ShardSnapshotStatus)>) -> Entry {
        Entry {
            snapshot: snapshot(n),
            include_global_state: true,
            partial: false,
            state: SnapshotState::Started,
            indices: vec![index()],
            data_streams: Vec::new(),
            start_time_ms: n as i64,
            repo_generation: 0,
            user_metadata: None,
            repository_meta_version: Version::CURRENT,
            shards: shards.into_iter().collect(),
            source: None,
            clones: BTreeMap::new(),
            failure: None,
        }
    }

    fn success_update(n: u128, shard: u32) -> ShardSnapshotUpdate {
        ShardSnapshotUpdate {
            snapshot: snapshot(n),
            key: EntryShardKey::Routing(ShardId::new("idx", shard)),
            status: ShardSnapshotStatus::success(
                NodeId::new("n1"),
                Some(ShardGeneration::new("g-next")),
            ),
        }
    }

    #[test]
    fn completes_entry_and_promotes_queued_waiter() {
        let older = entry(
            1,
            vec![(
                ShardId::new("idx", 0),
                ShardSnapshotStatus::init(NodeId::new("n1"), Some(ShardGeneration::new("g0"))),
            )],
        );
        let newer = entry(
            2,
            vec![(
                ShardId::new("idx", 0),
                ShardSnapshotStatus::unassigned_queued(),
            )],
        );
        let current = SnapshotsInProgress {
            entries: vec![older, newer],
        };

        let outcome = apply_shard_updates(
            &current,
            &RoutingTable::default(),
            None,
            &[success_update(1, 0)],
        );
        assert_eq!(outcome.executed, 1);

        let older = &outcome.snapshots.entries[0];
        assert_eq!(older.state, SnapshotState::Success);

        let newer = &outcome.snapshots.entries[1];
        let promoted = &newer.shards[&ShardId::new("idx", 0)];
        assert_eq!(promoted.state, ShardState::Init);
        assert_eq!(promoted.node_id.as_ref().unwrap().as_str(), "n1");
        assert_eq!(promoted.generation.as_ref().unwrap().as_str(), "g-next");
    }

    #[test]
    fn released_shard_goes_to_oldest_waiter_only() {
        let holder = entry(
            1,
            vec![(
                ShardId::new("idx", 0),
                ShardSnapshotStatus::init(NodeId::new("n1"), None),
            )],
        );
        let second = entry(
            2,
            vec![(
                ShardId::new("idx", 0),
                ShardSnapshotStatus::unassigned_queued(),
            )],
        );
        let third = entry(
            3,
            vec![(
                ShardId::new("idx", 0),
                ShardSnapshotStatus::unassigned_queued(),
            )],
        );
        let current = SnapshotsInProgress {
            entries: vec![holder, second, third],
        };

        let outcome = apply_shard_updates(
            &current,
            &RoutingTable::default(),
            None,
            &[success_update(1, 0)],
        );

        assert_eq!(
            outcome.snapshots.entries[1].shards[&ShardId::new("idx", 0)].state,
            ShardState::Init
        );
        // The younger waiter keeps queueing behind the new holder.
        assert!(outcome.snapshots.entries[2].shards[&ShardId::new("idx", 0)]
            .is_unassigned_queued());
    }

    #[test]
    fn duplicate_update_is_idempotent() {
        let current = SnapshotsInProgress {
            entries: vec![entry(
                1,
                vec![(
                    ShardId::new("idx", 0),
                    ShardSnapshotStatus::init(NodeId::new("n1"), None),
                )],
            )],
        };
        let update = success_update(1, 0);

        let once = apply_shard_updates(&current, &RoutingTable::default(), None, &[update.clone()]);
        let twice = apply_shard_updates(
            &once.snapshots,
            &RoutingTable::default(),
            None,
            &[update.clone()],
        );
        assert_eq!(once.snapshots, twice.snapshots);
        assert_eq!(twice.executed, 0);

        // Both updates in a single batch behave the same way.
        let batched = apply_shard_updates(
            &current,
            &RoutingTable::default(),
            None,
            &[update.clone(), update],
        );
        assert_eq!(batched.snapshots, once.snapshots);
        assert_eq!(batched.executed, 1);
    }

    #[test]
    fn update_for_removed_entry_is_a_no_op() {
        let current = SnapshotsInProgress::default();
        let outcome = apply_shard_updates(
            &current,
            &RoutingTable::default(),
            None,
            &[success_update(9, 0)],
        );
        assert_eq!(outcome.executed, 0);
        assert!(outcome.snapshots.is_empty());
    }
}
