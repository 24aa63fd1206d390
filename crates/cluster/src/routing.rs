use std::collections::BTreeMap;

use models::{NodeId, ShardId};
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardRoutingState {
    Unassigned,
    Initializing,
    Started,
    Relocating,
}

/// Routing of one primary shard. The engine only snapshots primaries, so
/// the table tracks nothing else.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRouting {
    pub state: ShardRoutingState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
}

impl ShardRouting {
    pub fn unassigned() -> Self {
        Self {
            state: ShardRoutingState::Unassigned,
            node: None,
        }
    }

    pub fn started(node: impl Into<NodeId>) -> Self {
        Self {
            state: ShardRoutingState::Started,
            node: Some(node.into()),
        }
    }

    pub fn initializing(node: impl Into<NodeId>) -> Self {
        Self {
            state: ShardRoutingState::Initializing,
            node: Some(node.into()),
        }
    }

    pub fn is_started(&self) -> bool {
        self.state == ShardRoutingState::Started
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IndexRoutingTable {
    pub shards: BTreeMap<u32, ShardRouting>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoutingTable {
    pub indices: BTreeMap<String, IndexRoutingTable>,
}

impl RoutingTable {
    pub fn primary(&self, shard: &ShardId) -> Option<&ShardRouting> {
        self.indices.get(&shard.index)?.shards.get(&shard.shard)
    }

    pub fn with_primary(mut self, shard: ShardId, routing: ShardRouting) -> Self {
        self.indices
            .entry(shard.index)
            .or_default()
            .shards
            .insert(shard.shard, routing);
        self
    }
}
