use std::collections::BTreeMap;

use cluster::{Metadata, RoutingTable, ShardRoutingState};
use models::{
    IndexId, InFlightShardStates, RepositoryShardId, ShardGeneration, ShardId,
    ShardSnapshotStatus,
};
use repository::RepositoryData;

pub(crate) struct ShardAssignment<'a> {
    pub metadata: &'a Metadata,
    pub routing: &'a RoutingTable,
    pub repo_data: &'a RepositoryData,
    pub in_flight: &'a InFlightShardStates,
    /// A STARTED deletion holds the whole repository: every new shard
    /// queues behind it.
    pub deletion_started: bool,
    pub use_shard_generations: bool,
}

impl ShardAssignment<'_> {
    /// Computes the initial shard statuses for a snapshot over `indices`.
    pub fn assign(&self, indices: &[IndexId]) -> BTreeMap<ShardId, ShardSnapshotStatus> {
        let mut shards = BTreeMap::new();
        for index in indices {
            let Some(meta) = self.metadata.index(&index.name) else {
                // The index went away between resolution and admission.
                shards.insert(
                    ShardId::new(index.name.clone(), 0),
                    ShardSnapshotStatus::missing("index deleted"),
                );
                continue;
            };
            for number in 0..meta.num_shards {
                let shard_id = ShardId::new(index.name.clone(), number);
                let repo_shard = RepositoryShardId::new(index.clone(), number);
                shards.insert(shard_id.clone(), self.assign_one(&shard_id, &repo_shard));
            }
        }
        shards
    }

    fn assign_one(
        &self,
        shard_id: &ShardId,
        repo_shard: &RepositoryShardId,
    ) -> ShardSnapshotStatus {
        if self.deletion_started || self.in_flight.is_active(repo_shard) {
            return ShardSnapshotStatus::unassigned_queued();
        }
        let generation = self.starting_generation(repo_shard);
        match self.routing.primary(shard_id) {
            None => ShardSnapshotStatus::missing("primary shard is not allocated"),
            Some(primary) => match (primary.state, &primary.node) {
                (ShardRoutingState::Started, Some(node)) => {
                    ShardSnapshotStatus::init(node.clone(), generation)
                }
                (ShardRoutingState::Initializing | ShardRoutingState::Relocating, _) => {
                    ShardSnapshotStatus::waiting(generation)
                }
                (ShardRoutingState::Unassigned, _) => {
                    ShardSnapshotStatus::missing("primary shard is not allocated")
                }
                // Assigned, not relocating or initializing, yet not
                // started either.
                _ => ShardSnapshotStatus::missing("primary shard hasn't been started yet"),
            },
        }
    }

    /// The generation the next write of this shard builds on: the latest
    /// in-flight success, else what the repository last recorded, else the
    /// new-shard sentinel.
    pub fn starting_generation(&self, repo_shard: &RepositoryShardId) -> Option<ShardGeneration> {
        if !self.use_shard_generations {
            return None;
        }
        Some(
            self.in_flight
                .generation(repo_shard)
                .or_else(|| self.repo_data.shard_generation(repo_shard))
                .cloned()
                .unwrap_or_else(ShardGeneration::new_shard),
        )
    }
}
