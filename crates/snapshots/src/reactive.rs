use std::collections::BTreeMap;
use std::sync::Arc;

use cluster::{ClusterChangedEvent, ClusterState, UpdateTask};
use models::{
    EntryShardKey, RepositoryShardId, ShardSnapshotStatus, ShardState, SnapshotsInProgress,
};

use crate::delete::ready_deletions;
use crate::{Error, SnapshotsService};

/// Reconciliation pass submitted in response to node departures, routing
/// changes, or a cluster-manager change. The generic applier picks up the
/// consequences (completed entries, startable deletions and clones) when
/// the resulting state applies.
pub(crate) struct ExternalChangesTask {
    pub service: Arc<SnapshotsService>,
}

impl UpdateTask for ExternalChangesTask {
    fn execute(&mut self, current: &ClusterState) -> anyhow::Result<ClusterState> {
        let snapshots = process_external_changes(current);
        let snapshot_deletions = ready_deletions(&snapshots, &current.snapshot_deletions);
        Ok(ClusterState {
            snapshots,
            snapshot_deletions,
            ..current.clone()
        })
    }

    fn applied(self: Box<Self>, source: &str, previous: &ClusterState, current: &ClusterState) {
        if previous.snapshots != current.snapshots {
            tracing::info!(%source, "adjusted in-progress snapshots for external changes");
        }
    }

    fn on_failure(self: Box<Self>, source: &str, error: anyhow::Error) {
        let error = Error::classify("_cluster", "_external_changes", error);
        tracing::warn!(%source, %error, "failed to adjust snapshots for external changes");
        if error.is_manager_failure() {
            self.service.fail_outstanding_listeners_on_failover();
        }
    }
}

/// Whether an applied cluster-state change requires a reconciliation pass
/// over the in-progress entries.
pub(crate) fn needs_update(event: &ClusterChangedEvent) -> bool {
    let current = &event.current;
    if current.snapshots.is_empty() && current.snapshot_deletions.is_empty() {
        return false;
    }
    // A fresh cluster-manager re-inspects everything it inherited.
    if !event.previously_cluster_manager() {
        return true;
    }
    if event
        .nodes_removed()
        .iter()
        .any(|node| hosts_incomplete_shard(current, &node.id))
    {
        return true;
    }
    event.routing_changed() && waiting_shards_changed(current)
}

fn hosts_incomplete_shard(state: &ClusterState, node: &models::NodeId) -> bool {
    state
        .snapshots
        .entries
        .iter()
        .filter(|e| !e.state.completed())
        .any(|entry| {
            entry
                .shards
                .values()
                .chain(entry.clones.values())
                .any(|s| !s.state.completed() && s.node_id.as_ref() == Some(node))
        })
}

/// Whether any WAITING shard's primary is now started (ready to go) or
/// gone (ready to fail).
fn waiting_shards_changed(state: &ClusterState) -> bool {
    for entry in &state.snapshots.entries {
        if entry.state.completed() || entry.is_clone() {
            continue;
        }
        for (shard_id, status) in &entry.shards {
            if status.state != ShardState::Waiting {
                continue;
            }
            match state.routing.primary(shard_id) {
                Some(primary) if primary.is_started() => return true,
                Some(primary) if primary.node.is_some() => {} // still coming up
                _ => return true,
            }
        }
    }
    false
}

/// One reconciliation pass: re-derives shard statuses from current node
/// membership and routing.
///
/// Failures are recorded per repository shard as they are discovered, so a
/// younger entry queued behind a shard that just failed inherits the same
/// failure instead of waiting forever (the holder will never release a
/// shard it never wrote).
pub(crate) fn process_external_changes(state: &ClusterState) -> SnapshotsInProgress {
    // Keyed by repository as well: a failure never crosses repositories.
    let mut known_failures: BTreeMap<(String, RepositoryShardId), String> = BTreeMap::new();
    let mut entries = Vec::with_capacity(state.snapshots.entries.len());

    for entry in &state.snapshots.entries {
        // Clones run on the cluster-manager itself and hold no data-node
        // assignments; node departures and routing don't touch them.
        if entry.state.completed() || entry.is_clone() {
            entries.push(entry.clone());
            continue;
        }
        let mut updated = entry.clone();

        for (shard_id, status) in &entry.shards {
            if status.state.completed() {
                continue;
            }
            let repo_shard = entry
                .index_id(&shard_id.index)
                .map(|index| RepositoryShardId::new(index.clone(), shard_id.shard));
            let key = EntryShardKey::Routing(shard_id.clone());

            let next = match status.state {
                ShardState::Queued if status.is_unassigned_queued() => repo_shard
                    .as_ref()
                    .and_then(|rs| {
                        known_failures.get(&(entry.repository().to_string(), rs.clone()))
                    })
                    .map(|reason| {
                        ShardSnapshotStatus::failed(None, reason.clone(), status.generation.clone())
                    }),
                ShardState::Waiting => match state.routing.primary(shard_id) {
                    Some(primary) if primary.is_started() => primary.node.clone().map(|node| {
                        ShardSnapshotStatus::init(node, status.generation.clone())
                    }),
                    Some(primary) if primary.node.is_some() => None, // keep waiting
                    _ => Some(ShardSnapshotStatus::failed(
                        None,
                        "shard is unassigned",
                        status.generation.clone(),
                    )),
                },
                // INIT, ABORTED, QUEUED-with-node, and
                // PAUSED_FOR_NODE_REMOVAL: fail when the assigned node
                // left the cluster.
                _ => match &status.node_id {
                    Some(node) if !state.nodes.contains(node) => {
                        Some(ShardSnapshotStatus::failed(
                            Some(node.clone()),
                            "node shutdown",
                            status.generation.clone(),
                        ))
                    }
                    _ => None,
                },
            };

            let Some(next) = next else { continue };
            if next.state == ShardState::Failed {
                if let (Some(repo_shard), Some(reason)) = (repo_shard, &next.reason) {
                    known_failures.insert(
                        (entry.repository().to_string(), repo_shard),
                        reason.clone(),
                    );
                }
            }
            updated = updated.with_shard_status(&key, next);
        }
        entries.push(updated);
    }

    SnapshotsInProgress { entries }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster::{DiscoveryNode, DiscoveryNodes, RoutingTable, ShardRouting};
    use models::{
        IndexId, NodeId, ShardId, Snapshot, SnapshotId, SnapshotState, Version,
    };
    use std::collections::BTreeMap;

    fn fixture(shards: Vec<(ShardId, ShardSnapshotStatus)>) -> models::Entry {
        models::Entry {
            snapshot: Snapshot::new("repo", SnapshotId::new("s1", uuid::Uuid::from_u128(1))),
            include_global_state: true,
            partial: true,
            state: SnapshotState::Started,
            indices: vec![IndexId::new("idx", uuid::Uuid::from_u128(2))],
            data_streams: Vec::new(),
            start_time_ms: 0,
            repo_generation: 0,
            user_metadata: None,
            repository_meta_version: Version::CURRENT,
            shards: shards.into_iter().collect(),
            source: None,
            clones: BTreeMap::new(),
            failure: None,
        }
    }

    fn state_with(
        entries: Vec<models::Entry>,
        nodes: &[&str],
        routing: RoutingTable,
    ) -> ClusterState {
        let mut discovery = DiscoveryNodes::default();
        for node in nodes {
            discovery.nodes.insert(
                NodeId::new(*node),
                DiscoveryNode::new(*node, Version::CURRENT),
            );
        }
        ClusterState {
            nodes: discovery,
            routing,
            snapshots: SnapshotsInProgress { entries },
            ..Default::default()
        }
    }

    #[test]
    fn fails_shards_of_departed_nodes() {
        let entry = fixture(vec![
            (
                ShardId::new("idx", 0),
                ShardSnapshotStatus::init(NodeId::new("gone"), None),
            ),
            (
                ShardId::new("idx", 1),
                ShardSnapshotStatus::init(NodeId::new("n2"), None),
            ),
        ]);
        let state = state_with(vec![entry], &["n2"], RoutingTable::default());

        let updated = process_external_changes(&state);
        let shards = &updated.entries[0].shards;
        assert_eq!(shards[&ShardId::new("idx", 0)].state, ShardState::Failed);
        assert_eq!(
            shards[&ShardId::new("idx", 0)].reason.as_deref(),
            Some("node shutdown")
        );
        assert_eq!(shards[&ShardId::new("idx", 1)].state, ShardState::Init);
    }

    #[test]
    fn starts_waiting_shard_when_primary_starts() {
        let entry = fixture(vec![(
            ShardId::new("idx", 0),
            ShardSnapshotStatus::waiting(None),
        )]);
        let routing = RoutingTable::default()
            .with_primary(ShardId::new("idx", 0), ShardRouting::started("n1"));
        let state = state_with(vec![entry], &["n1"], routing);

        let updated = process_external_changes(&state);
        let status = &updated.entries[0].shards[&ShardId::new("idx", 0)];
        assert_eq!(status.state, ShardState::Init);
        assert_eq!(status.node_id.as_ref().unwrap().as_str(), "n1");
    }

    #[test]
    fn queued_shard_inherits_known_failure() {
        let holder = fixture(vec![(
            ShardId::new("idx", 0),
            ShardSnapshotStatus::init(NodeId::new("gone"), None),
        )]);
        let mut waiter = fixture(vec![(
            ShardId::new("idx", 0),
            ShardSnapshotStatus::unassigned_queued(),
        )]);
        waiter.snapshot = Snapshot::new("repo", SnapshotId::new("s2", uuid::Uuid::from_u128(3)));

        let state = state_with(vec![holder, waiter], &[], RoutingTable::default());
        let updated = process_external_changes(&state);

        let queued = &updated.entries[1].shards[&ShardId::new("idx", 0)];
        assert_eq!(queued.state, ShardState::Failed);
        assert_eq!(queued.reason.as_deref(), Some("node shutdown"));
    }

    #[test]
    fn waiting_shard_with_initializing_primary_keeps_waiting() {
        let entry = fixture(vec![(
            ShardId::new("idx", 0),
            ShardSnapshotStatus::waiting(None),
        )]);
        let routing = RoutingTable::default()
            .with_primary(ShardId::new("idx", 0), ShardRouting::initializing("n1"));
        let state = state_with(vec![entry], &["n1"], routing.clone());

        let updated = process_external_changes(&state);
        assert_eq!(
            updated.entries[0].shards[&ShardId::new("idx", 0)].state,
            ShardState::Waiting
        );
    }
}
