use std::collections::BTreeSet;

use models::{SnapshotDeletionsInProgress, SnapshotId, SnapshotsInProgress, Version};
use serde::{Deserialize, Serialize};

use crate::{DiscoveryNodes, Metadata, RoutingTable};

/// The consensus-replicated cluster-state document, reduced to the
/// sections the snapshot engine reads and writes. Values are cheap to
/// clone and compare; every mutation goes through an `UpdateTask` so the
/// document itself is immutable from the engine's point of view.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct ClusterState {
    pub version: u64,
    pub nodes: DiscoveryNodes,
    pub routing: RoutingTable,
    pub metadata: Metadata,
    pub snapshots: SnapshotsInProgress,
    pub snapshot_deletions: SnapshotDeletionsInProgress,
    /// Repositories with a cleanup in flight; snapshot admission is
    /// rejected for them.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub repository_cleanups: BTreeSet<String>,
    /// Snapshots currently being restored; deletion is rejected for them.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub restoring: BTreeSet<SnapshotId>,
}

impl ClusterState {
    pub fn min_peer_version(&self) -> Version {
        self.nodes.min_version()
    }

    pub fn local_is_cluster_manager(&self) -> bool {
        self.nodes.local_is_cluster_manager()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DiscoveryNode, IndexMetadata, ShardRouting};
    use models::{NodeId, ShardId};
    use pretty_assertions::assert_eq;

    #[test]
    fn state_round_trips_through_serde() {
        let mut state = ClusterState::default();
        state.nodes.local_node_id = Some(NodeId::new("m"));
        state.nodes.cluster_manager_id = Some(NodeId::new("m"));
        state.nodes.nodes.insert(
            NodeId::new("m"),
            DiscoveryNode::new("m", Version::CURRENT),
        );
        state.metadata.indices.insert(
            "idx".to_string(),
            IndexMetadata {
                name: "idx".to_string(),
                num_shards: 2,
            },
        );
        state.routing = state
            .routing
            .with_primary(ShardId::new("idx", 0), ShardRouting::started("m"));

        let json = serde_json::to_string(&state).unwrap();
        let parsed: ClusterState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, parsed);
    }

    #[test]
    fn min_version_over_peers() {
        let mut state = ClusterState::default();
        assert_eq!(state.min_peer_version(), Version::CURRENT);
        state.nodes.nodes.insert(
            NodeId::new("old"),
            DiscoveryNode::new("old", Version::new(6)),
        );
        state.nodes.nodes.insert(
            NodeId::new("new"),
            DiscoveryNode::new("new", Version::CURRENT),
        );
        assert_eq!(state.min_peer_version(), Version::new(6));
    }
}
