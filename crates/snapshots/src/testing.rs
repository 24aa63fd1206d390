//! Test support: an in-memory repository driver and cluster-state
//! fixtures for driving the engine deterministically.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use cluster::{
    ClusterState, DiscoveryNode, DiscoveryNodes, IndexMetadata, RepositoryMetadata,
    ShardRouting, ShardRoutingState,
};
use models::{
    IndexId, NodeId, RepositoryShardId, ShardGeneration, ShardId, SnapshotId, Version,
};
use repository::{
    IndexSnapshotMeta, RepositoryData, RepositoryDriver, RepositoryRegistry, SnapshotInfo,
};

/// An in-memory `RepositoryDriver` with injectable failures.
pub struct MockRepository {
    name: String,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    data: RepositoryData,
    infos: BTreeMap<uuid::Uuid, SnapshotInfo>,
    shard_counts: BTreeMap<uuid::Uuid, u32>,
    fail_next_finalize: Option<String>,
    fail_next_delete: Option<String>,
    delete_gate: Option<tokio::sync::oneshot::Receiver<()>>,
    clone_counter: u64,
}

impl MockRepository {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                data: RepositoryData {
                    gen_id: 0,
                    ..Default::default()
                },
                ..Default::default()
            }),
        })
    }

    pub fn data(&self) -> RepositoryData {
        self.inner.lock().unwrap().data.clone()
    }

    pub fn snapshot_info(&self, id: &SnapshotId) -> Option<SnapshotInfo> {
        self.inner.lock().unwrap().infos.get(&id.uuid).cloned()
    }

    pub fn fail_next_finalize(&self, reason: impl Into<String>) {
        self.inner.lock().unwrap().fail_next_finalize = Some(reason.into());
    }

    pub fn fail_next_delete(&self, reason: impl Into<String>) {
        self.inner.lock().unwrap().fail_next_delete = Some(reason.into());
    }

    /// Makes the next repository-side delete wait until the returned
    /// sender fires, so tests can observe the state while it runs.
    pub fn gate_next_delete(&self) -> tokio::sync::oneshot::Sender<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.inner.lock().unwrap().delete_gate = Some(rx);
        tx
    }

    /// Pre-populates a held snapshot, as if written by an earlier
    /// finalization.
    pub fn seed_snapshot(
        &self,
        id: &SnapshotId,
        indices: &[(IndexId, u32)],
        info: SnapshotInfo,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.data.gen_id += 1;
        inner.data.snapshots.push(id.clone());
        inner
            .data
            .snapshot_indices
            .insert(id.uuid, indices.iter().map(|(i, _)| i.clone()).collect());
        for (index, shard_count) in indices {
            inner.data.indices.insert(index.name.clone(), index.clone());
            inner.shard_counts.insert(index.id, *shard_count);
            for shard in 0..*shard_count {
                inner.data.shard_generations.insert(
                    RepositoryShardId::new(index.clone(), shard),
                    ShardGeneration::new(format!("seed-{}-{shard}", index.name)),
                );
            }
        }
        inner.infos.insert(id.uuid, info);
    }
}

#[async_trait::async_trait]
impl RepositoryDriver for MockRepository {
    async fn get_repository_data(&self) -> anyhow::Result<RepositoryData> {
        Ok(self.inner.lock().unwrap().data.clone())
    }

    async fn get_snapshot_info(&self, id: &SnapshotId) -> anyhow::Result<SnapshotInfo> {
        self.inner
            .lock()
            .unwrap()
            .infos
            .get(&id.uuid)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no snapshot info for [{id}]"))
    }

    async fn get_snapshot_index_metadata(
        &self,
        _repo_data: &RepositoryData,
        _id: &SnapshotId,
        index: &IndexId,
    ) -> anyhow::Result<IndexSnapshotMeta> {
        let shard_count = self
            .inner
            .lock()
            .unwrap()
            .shard_counts
            .get(&index.id)
            .copied()
            .unwrap_or(1);
        Ok(IndexSnapshotMeta {
            index: index.clone(),
            shard_count,
        })
    }

    async fn get_snapshot_global_metadata(
        &self,
        _id: &SnapshotId,
    ) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::json!({}))
    }

    async fn initialize_snapshot(
        &self,
        _id: &SnapshotId,
        _indices: &[IndexId],
        _global_metadata: serde_json::Value,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn finalize_snapshot(
        &self,
        shard_generations: BTreeMap<RepositoryShardId, ShardGeneration>,
        gen_id: i64,
        info: SnapshotInfo,
        _repo_meta_version: Version,
    ) -> anyhow::Result<RepositoryData> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(reason) = inner.fail_next_finalize.take() {
            anyhow::bail!("[{}] finalization failed: {reason}", self.name);
        }
        anyhow::ensure!(
            gen_id == inner.data.gen_id,
            "[{}] concurrent repository modification: expected generation [{}], got [{}]",
            self.name,
            inner.data.gen_id,
            gen_id,
        );
        inner.data.gen_id += 1;
        if !inner.data.snapshots.contains(&info.snapshot) {
            inner.data.snapshots.push(info.snapshot.clone());
        }
        let indices: Vec<IndexId> = shard_generations
            .keys()
            .map(|rs| rs.index.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        for index in &indices {
            inner.data.indices.insert(index.name.clone(), index.clone());
        }
        inner
            .data
            .snapshot_indices
            .insert(info.snapshot.uuid, indices);
        for (repo_shard, generation) in shard_generations {
            inner.data.shard_generations.insert(repo_shard, generation);
        }
        inner.infos.insert(info.snapshot.uuid, info);
        Ok(inner.data.clone())
    }

    async fn delete_snapshots(
        &self,
        ids: &[SnapshotId],
        gen_id: i64,
        _repo_meta_version: Version,
    ) -> anyhow::Result<RepositoryData> {
        let gate = self.inner.lock().unwrap().delete_gate.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(reason) = inner.fail_next_delete.take() {
            anyhow::bail!("[{}] delete failed: {reason}", self.name);
        }
        anyhow::ensure!(
            gen_id == inner.data.gen_id,
            "[{}] concurrent repository modification: expected generation [{}], got [{}]",
            self.name,
            inner.data.gen_id,
            gen_id,
        );
        inner.data.gen_id += 1;
        inner.data.snapshots.retain(|s| !ids.contains(s));
        for id in ids {
            inner.infos.remove(&id.uuid);
            inner.data.snapshot_indices.remove(&id.uuid);
        }
        Ok(inner.data.clone())
    }

    async fn clone_shard_snapshot(
        &self,
        _source: &SnapshotId,
        _target: &SnapshotId,
        _shard: &RepositoryShardId,
        _generation: Option<ShardGeneration>,
    ) -> anyhow::Result<ShardGeneration> {
        let mut inner = self.inner.lock().unwrap();
        inner.clone_counter += 1;
        Ok(ShardGeneration::new(format!("clone-{}", inner.clone_counter)))
    }
}

/// Registry over a fixed set of mock repositories.
#[derive(Default)]
pub struct MockRegistry {
    repositories: BTreeMap<String, Arc<MockRepository>>,
}

impl MockRegistry {
    pub fn with(repositories: impl IntoIterator<Item = Arc<MockRepository>>) -> Arc<Self> {
        Arc::new(Self {
            repositories: repositories
                .into_iter()
                .map(|r| (r.name.clone(), r))
                .collect(),
        })
    }
}

impl RepositoryRegistry for MockRegistry {
    fn repository(&self, name: &str) -> Result<Arc<dyn RepositoryDriver>, repository::Error> {
        self.repositories
            .get(name)
            .cloned()
            .map(|r| r as Arc<dyn RepositoryDriver>)
            .ok_or_else(|| repository::Error::Missing(name.to_string()))
    }
}

/// Builder for the cluster-state fixtures the scenario tests start from.
pub struct StateBuilder {
    state: ClusterState,
}

impl StateBuilder {
    /// A state whose local node is the elected cluster-manager.
    pub fn new(local: &str) -> Self {
        let mut nodes = DiscoveryNodes {
            local_node_id: Some(NodeId::new(local)),
            cluster_manager_id: Some(NodeId::new(local)),
            nodes: BTreeMap::new(),
        };
        nodes.nodes.insert(
            NodeId::new(local),
            DiscoveryNode::new(local, Version::CURRENT),
        );
        StateBuilder {
            state: ClusterState {
                nodes,
                ..Default::default()
            },
        }
    }

    pub fn node(mut self, id: &str, version: Version) -> Self {
        self.state
            .nodes
            .nodes
            .insert(NodeId::new(id), DiscoveryNode::new(id, version));
        self
    }

    pub fn manager(mut self, id: &str) -> Self {
        self.state.nodes.cluster_manager_id = Some(NodeId::new(id));
        self
    }

    pub fn repository(mut self, name: &str) -> Self {
        self.state.metadata.repositories.insert(
            name.to_string(),
            RepositoryMetadata {
                name: name.to_string(),
                readonly: false,
            },
        );
        self
    }

    pub fn readonly_repository(mut self, name: &str) -> Self {
        self.state.metadata.repositories.insert(
            name.to_string(),
            RepositoryMetadata {
                name: name.to_string(),
                readonly: true,
            },
        );
        self
    }

    /// An index with one primary per listed (node, routing-state) pair.
    pub fn index(mut self, name: &str, primaries: &[(&str, ShardRoutingState)]) -> Self {
        self.state.metadata.indices.insert(
            name.to_string(),
            IndexMetadata {
                name: name.to_string(),
                num_shards: primaries.len() as u32,
            },
        );
        for (shard, (node, routing_state)) in primaries.iter().enumerate() {
            let routing = ShardRouting {
                state: *routing_state,
                node: (*routing_state != ShardRoutingState::Unassigned)
                    .then(|| NodeId::new(*node)),
            };
            self.state.routing = std::mem::take(&mut self.state.routing)
                .with_primary(ShardId::new(name, shard as u32), routing);
        }
        self
    }

    pub fn data_stream(mut self, name: &str, backing: &[&str]) -> Self {
        self.state.metadata.data_streams.insert(
            name.to_string(),
            cluster::DataStream {
                name: name.to_string(),
                indices: backing.iter().map(|s| s.to_string()).collect(),
            },
        );
        self
    }

    pub fn build(self) -> ClusterState {
        self.state
    }
}

/// Yields to the runtime until `predicate` holds, panicking after a
/// bounded number of turns. With the current-thread runtime and the
/// in-memory collaborators this makes scenario tests deterministic.
pub async fn eventually(mut predicate: impl FnMut() -> bool) {
    for _ in 0..1024 {
        if predicate() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition did not become true");
}
