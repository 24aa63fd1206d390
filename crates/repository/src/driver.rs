use std::collections::BTreeMap;
use std::sync::Arc;

use models::{
    IndexId, RepositoryShardId, ShardGeneration, SnapshotId, Version,
};

use crate::{RepositoryData, SnapshotInfo};

/// Per-index metadata of a snapshot held in the repository, as needed to
/// clone it: notably the shard count the index had when snapshotted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexSnapshotMeta {
    pub index: IndexId,
    pub shard_count: u32,
}

/// Driver of one content-addressed object repository.
///
/// Implementations perform blocking I/O and are always invoked from
/// spawned tasks, never from the cluster-state update thread. All methods
/// take `&self`; the driver serializes its own internal mutations. Errors
/// are reported as `anyhow::Error` and classified by the caller.
#[async_trait::async_trait]
pub trait RepositoryDriver: Send + Sync + 'static {
    /// Reads the latest root metadata document. The returned `gen_id` is
    /// the generation any subsequent write of this operation must build
    /// on.
    async fn get_repository_data(&self) -> anyhow::Result<RepositoryData>;

    async fn get_snapshot_info(&self, id: &SnapshotId) -> anyhow::Result<SnapshotInfo>;

    async fn get_snapshot_index_metadata(
        &self,
        repo_data: &RepositoryData,
        id: &SnapshotId,
        index: &IndexId,
    ) -> anyhow::Result<IndexSnapshotMeta>;

    async fn get_snapshot_global_metadata(
        &self,
        id: &SnapshotId,
    ) -> anyhow::Result<serde_json::Value>;

    /// Writes initial snapshot metadata before any shard work starts.
    /// Only invoked on the legacy path, for peers that expect it.
    async fn initialize_snapshot(
        &self,
        id: &SnapshotId,
        indices: &[IndexId],
        global_metadata: serde_json::Value,
    ) -> anyhow::Result<()>;

    /// Writes the `SnapshotInfo` plus an updated root document, making the
    /// snapshot durable. `gen_id` is the generation the write builds on;
    /// the returned data carries the strictly larger successor generation.
    async fn finalize_snapshot(
        &self,
        shard_generations: BTreeMap<RepositoryShardId, ShardGeneration>,
        gen_id: i64,
        info: SnapshotInfo,
        repo_meta_version: Version,
    ) -> anyhow::Result<RepositoryData>;

    /// Deletes the given snapshots from the repository, building on
    /// `gen_id`, and returns the updated root document.
    async fn delete_snapshots(
        &self,
        ids: &[SnapshotId],
        gen_id: i64,
        repo_meta_version: Version,
    ) -> anyhow::Result<RepositoryData>;

    /// Copies one shard of `source` into `target` repository-side and
    /// returns the generation of the written shard metadata.
    async fn clone_shard_snapshot(
        &self,
        source: &SnapshotId,
        target: &SnapshotId,
        shard: &RepositoryShardId,
        generation: Option<ShardGeneration>,
    ) -> anyhow::Result<ShardGeneration>;
}

/// Resolves repository names to drivers.
pub trait RepositoryRegistry: Send + Sync + 'static {
    fn repository(&self, name: &str) -> Result<Arc<dyn RepositoryDriver>, crate::Error>;
}
