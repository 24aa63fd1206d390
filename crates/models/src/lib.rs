mod deletions;
mod id;
mod in_progress;
mod names;
mod shard;
mod version;

/// Serde adapter for maps whose keys are structured types: serialized as
/// a sequence of pairs, since document formats only allow string keys.
pub mod map_as_pairs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<K, V, S>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        V: Serialize,
        S: Serializer,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, K, V, D>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let pairs = Vec::<(K, V)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

pub use deletions::{DeletionEntry, DeletionState, SnapshotDeletionsInProgress};
pub use id::{IndexId, NodeId, Snapshot, SnapshotId};
pub use in_progress::{
    Entry, EntryShardKey, InFlightShardStates, SnapshotState, SnapshotsInProgress,
    ABORTED_BY_DELETION,
};
pub use names::{match_any, simple_match, validate_snapshot_name, InvalidName};
pub use shard::{
    RepositoryShardId, ShardGeneration, ShardId, ShardSnapshotStatus, ShardState,
};
pub use version::Version;
