use serde::{Deserialize, Serialize};

use crate::{IndexId, NodeId};

/// ShardId is the runtime routing coordinate of a shard: the live index
/// name plus the shard number.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId {
    pub index: String,
    pub shard: u32,
}

impl ShardId {
    pub fn new(index: impl Into<String>, shard: u32) -> Self {
        Self {
            index: index.into(),
            shard,
        }
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}

impl std::fmt::Debug for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

/// RepositoryShardId is the repository-persistent coordinate of a shard:
/// the IndexId under which the repository tracks the index, plus the shard
/// number. Clone operations address shards this way because the cloned
/// index need not exist in the cluster at all.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RepositoryShardId {
    pub index: IndexId,
    pub shard: u32,
}

impl RepositoryShardId {
    pub fn new(index: IndexId, shard: u32) -> Self {
        Self { index, shard }
    }
}

impl std::fmt::Display for RepositoryShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.index, self.shard)
    }
}

impl std::fmt::Debug for RepositoryShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

/// ShardGeneration is the per-shard version tag under which a shard's
/// repository metadata was last written, enabling incremental writes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardGeneration(String);

impl ShardGeneration {
    /// Sentinel generation for the first snapshot of a shard of an index
    /// that is new to the repository.
    pub const NEW_SHARD: &'static str = "_new";

    pub fn new(gen: impl Into<String>) -> Self {
        Self(gen.into())
    }
    pub fn new_shard() -> Self {
        Self(Self::NEW_SHARD.to_string())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ShardGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for ShardGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

/// State of a single shard-level snapshot operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardState {
    Init,
    Waiting,
    Queued,
    Success,
    Failed,
    Missing,
    Aborted,
    PausedForNodeRemoval,
}

impl ShardState {
    /// A completed shard has reached a terminal status and no longer
    /// occupies its repository shard. ABORTED is not completed: the data
    /// node still owns the shard until it acknowledges the abort.
    pub fn completed(&self) -> bool {
        matches!(
            self,
            ShardState::Success | ShardState::Failed | ShardState::Missing
        )
    }

    pub fn failed(&self) -> bool {
        matches!(
            self,
            ShardState::Failed | ShardState::Aborted | ShardState::Missing
        )
    }

    /// Whether a shard in this state holds (is actively writing to) its
    /// repository shard. QUEUED waits for the holder; PAUSED_FOR_NODE_REMOVAL
    /// is non-completed but not actively writing.
    pub fn active(&self) -> bool {
        matches!(
            self,
            ShardState::Init | ShardState::Waiting | ShardState::Aborted
        )
    }
}

/// Status of one shard of an in-progress snapshot or clone entry.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ShardSnapshotStatus {
    pub state: ShardState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<ShardGeneration>,
}

impl ShardSnapshotStatus {
    pub fn init(node_id: NodeId, generation: Option<ShardGeneration>) -> Self {
        Self {
            state: ShardState::Init,
            node_id: Some(node_id),
            reason: None,
            generation,
        }
    }

    pub fn waiting(generation: Option<ShardGeneration>) -> Self {
        Self {
            state: ShardState::Waiting,
            node_id: None,
            reason: None,
            generation,
        }
    }

    /// The shard must wait because another operation owns its repository
    /// shard. Carries neither node nor generation; both are assigned when
    /// the holder releases the shard.
    pub fn unassigned_queued() -> Self {
        Self {
            state: ShardState::Queued,
            node_id: None,
            reason: None,
            generation: None,
        }
    }

    pub fn missing(reason: impl Into<String>) -> Self {
        Self {
            state: ShardState::Missing,
            node_id: None,
            reason: Some(reason.into()),
            generation: None,
        }
    }

    pub fn success(node_id: NodeId, generation: Option<ShardGeneration>) -> Self {
        Self {
            state: ShardState::Success,
            node_id: Some(node_id),
            reason: None,
            generation,
        }
    }

    pub fn failed(
        node_id: Option<NodeId>,
        reason: impl Into<String>,
        generation: Option<ShardGeneration>,
    ) -> Self {
        Self {
            state: ShardState::Failed,
            node_id,
            reason: Some(reason.into()),
            generation,
        }
    }

    pub fn is_unassigned_queued(&self) -> bool {
        self.state == ShardState::Queued && self.node_id.is_none()
    }

    pub fn is_active(&self) -> bool {
        self.state.active()
    }
}
