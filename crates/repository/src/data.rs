use std::collections::BTreeMap;

use models::{IndexId, RepositoryShardId, ShardGeneration, SnapshotId};
use serde::{Deserialize, Serialize};

/// The root metadata document of a repository: which snapshots it holds,
/// which indices those snapshots cover, and the latest per-shard
/// generations. `gen_id` labels the version of this document; every
/// finalized write produces a strictly larger generation.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RepositoryData {
    pub gen_id: i64,
    pub snapshots: Vec<SnapshotId>,
    /// Repository identity of every index any held snapshot covers,
    /// keyed by index name.
    pub indices: BTreeMap<String, IndexId>,
    /// Latest written generation per shard, present only on repositories
    /// written by shard-generation-aware versions.
    #[serde(default, with = "models::map_as_pairs")]
    pub shard_generations: BTreeMap<RepositoryShardId, ShardGeneration>,
    /// Which indices each held snapshot covers, keyed by snapshot uuid.
    #[serde(default)]
    pub snapshot_indices: BTreeMap<uuid::Uuid, Vec<IndexId>>,
}

impl RepositoryData {
    /// Generation of a repository that has never been written.
    pub const EMPTY_GENERATION: i64 = -1;

    pub fn has_snapshot_name(&self, name: &str) -> bool {
        self.snapshots.iter().any(|s| s.name == name)
    }

    pub fn snapshot_by_name(&self, name: &str) -> Option<&SnapshotId> {
        self.snapshots.iter().find(|s| s.name == name)
    }

    pub fn contains(&self, id: &SnapshotId) -> bool {
        self.snapshots.contains(id)
    }

    /// Resolves the repository identity for a live index name, reusing the
    /// identity of a previously snapshotted index of the same name.
    pub fn index_id(&self, name: &str) -> Option<&IndexId> {
        self.indices.get(name)
    }

    pub fn shard_generation(&self, shard: &RepositoryShardId) -> Option<&ShardGeneration> {
        self.shard_generations.get(shard)
    }

    /// Whether the repository has ever written the given index.
    pub fn has_index(&self, index: &IndexId) -> bool {
        self.indices.values().any(|i| i == index)
    }

    /// The indices covered by one held snapshot.
    pub fn indices_of(&self, id: &SnapshotId) -> &[IndexId] {
        self.snapshot_indices
            .get(&id.uuid)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_held_snapshots_and_indices() {
        let index = IndexId::new("idx", uuid::Uuid::from_u128(1));
        let id = SnapshotId::new("s1", uuid::Uuid::from_u128(2));
        let mut data = RepositoryData {
            gen_id: 3,
            ..Default::default()
        };
        data.snapshots.push(id.clone());
        data.indices.insert("idx".to_string(), index.clone());
        data.snapshot_indices.insert(id.uuid, vec![index.clone()]);
        data.shard_generations.insert(
            RepositoryShardId::new(index.clone(), 0),
            ShardGeneration::new("g3"),
        );

        assert!(data.has_snapshot_name("s1"));
        assert!(!data.has_snapshot_name("s2"));
        assert_eq!(data.snapshot_by_name("s1"), Some(&id));
        assert_eq!(data.index_id("idx"), Some(&index));
        assert!(data.has_index(&index));
        assert_eq!(data.indices_of(&id), &[index.clone()]);
        assert_eq!(
            data.shard_generation(&RepositoryShardId::new(index, 0))
                .map(|g| g.as_str()),
            Some("g3")
        );

        let json = serde_json::to_string(&data).unwrap();
        let parsed: RepositoryData = serde_json::from_str(&json).unwrap();
        assert_eq!(data, parsed);
    }
}
