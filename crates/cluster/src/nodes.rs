use std::collections::BTreeMap;

use models::{NodeId, Version};
use serde::{Deserialize, Serialize};

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct DiscoveryNode {
    pub id: NodeId,
    pub version: Version,
}

impl DiscoveryNode {
    pub fn new(id: impl Into<NodeId>, version: Version) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }
}

/// The cluster's current node membership, as replicated in cluster state.
/// `local_node_id` is this process's own identity and is what makes one
/// node's view of the same document differ from another's.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct DiscoveryNodes {
    pub local_node_id: Option<NodeId>,
    pub cluster_manager_id: Option<NodeId>,
    pub nodes: BTreeMap<NodeId, DiscoveryNode>,
}

impl DiscoveryNodes {
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&DiscoveryNode> {
        self.nodes.get(id)
    }

    pub fn local_is_cluster_manager(&self) -> bool {
        match (&self.local_node_id, &self.cluster_manager_id) {
            (Some(local), Some(manager)) => local == manager,
            _ => false,
        }
    }

    /// Minimum feature version across all current members. Behavior gated
    /// on this never asks an older peer to handle state it cannot parse.
    pub fn min_version(&self) -> Version {
        self.nodes
            .values()
            .map(|n| n.version)
            .min()
            .unwrap_or(Version::CURRENT)
    }
}
