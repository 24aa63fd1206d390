use models::{SnapshotId, SnapshotState};
use serde::{Deserialize, Serialize};

/// Failure of a single shard, as recorded in a finalized snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotShardFailure {
    pub index: String,
    pub shard: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<models::NodeId>,
    pub reason: String,
}

/// The durable description of a finalized snapshot, written to the
/// repository during finalization and returned to completion listeners.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot: SnapshotId,
    pub state: SnapshotState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub indices: Vec<String>,
    pub data_streams: Vec<String>,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub total_shards: usize,
    pub successful_shards: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shard_failures: Vec<SnapshotShardFailure>,
    pub include_global_state: bool,
}

impl SnapshotInfo {
    pub fn failed_indices(&self) -> impl Iterator<Item = &str> {
        self.shard_failures.iter().map(|f| f.index.as_str())
    }
}
