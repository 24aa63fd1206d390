use std::collections::BTreeMap;
use std::sync::Arc;

use cluster::{ClusterState, UpdateTask};
use models::{
    validate_snapshot_name, Entry, EntryShardKey, IndexId, InFlightShardStates, match_any,
    RepositoryShardId, ShardGeneration, ShardSnapshotStatus, ShardState, Snapshot, SnapshotId,
    SnapshotState, Version,
};
use repository::RepositoryData;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::create::ensure_admittable;
use crate::updates::ShardSnapshotUpdate;
use crate::{now_ms, Error, SnapshotsService};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloneSnapshotRequest {
    pub repository: String,
    pub source: String,
    pub target: String,
    pub indices: Vec<String>,
}

impl SnapshotsService {
    /// Clones an existing snapshot repository-side, without re-reading any
    /// shard data from the cluster. Resolves once the clone is fully
    /// written.
    #[tracing::instrument(skip_all, fields(
        repository = %request.repository,
        source = %request.source,
        target = %request.target,
    ))]
    pub async fn clone_snapshot(&self, request: CloneSnapshotRequest) -> Result<(), Error> {
        validate_snapshot_name(&request.target).map_err(|e| Error::InvalidSnapshotName {
            repository: request.repository.clone(),
            name: e.name,
            reason: e.reason,
        })?;
        if request.indices.is_empty() {
            return Err(Error::snapshot(
                &request.repository,
                &request.target,
                "no indices requested for clone",
            ));
        }
        let driver = self.driver(&request.repository)?;
        let repo_data = driver
            .get_repository_data()
            .await
            .map_err(|e| Error::classify(&request.repository, &request.target, e))?;

        let snapshot = Snapshot::new(
            request.repository.clone(),
            SnapshotId::new(request.target.clone(), uuid::Uuid::new_v4()),
        );
        let (admission, admission_rx) = oneshot::channel();
        let (completion, completion_rx) = oneshot::channel();

        self.bus.submit_update(
            &format!("clone_snapshot [{snapshot}]"),
            Box::new(CloneSnapshotTask {
                service: self.arc(),
                request,
                repo_data,
                snapshot,
                start_time_ms: now_ms(),
                admission,
                completion: Some(completion),
            }),
        );
        admission_rx.await.unwrap_or(Err(Error::NotClusterManager))?;
        completion_rx
            .await
            .unwrap_or(Err(Error::NotClusterManager))
            .map(|_| ())
    }
}

struct CloneSnapshotTask {
    service: Arc<SnapshotsService>,
    request: CloneSnapshotRequest,
    repo_data: RepositoryData,
    snapshot: Snapshot,
    start_time_ms: i64,
    admission: oneshot::Sender<Result<(), Error>>,
    completion: Option<crate::listeners::CompletionSender>,
}

impl UpdateTask for CloneSnapshotTask {
    fn execute(&mut self, current: &ClusterState) -> anyhow::Result<ClusterState> {
        let repository = &self.request.repository;
        let target = &self.request.target;

        ensure_admittable(current, &self.repo_data, repository, target)?;
        let min_peer = current.min_peer_version();
        if min_peer < Version::CLONE_SNAPSHOT {
            return Err(Error::snapshot(
                repository,
                target,
                format!(
                    "the snapshot clone feature requires all peers at or above {}",
                    Version::CLONE_SNAPSHOT
                ),
            )
            .into());
        }
        self.service
            .ensure_below_concurrency_limit(current, repository, target)?;

        let source = self
            .repo_data
            .snapshot_by_name(&self.request.source)
            .cloned()
            .ok_or_else(|| Error::SnapshotMissing {
                repository: repository.clone(),
                snapshot: self.request.source.clone(),
            })?;
        if current.snapshot_deletions.deleting(&source) {
            return Err(Error::concurrent(
                repository,
                target,
                format!("cannot clone from snapshot [{source}] that is targeted by a deletion"),
            )
            .into());
        }

        let indices: Vec<IndexId> = self
            .repo_data
            .indices_of(&source)
            .iter()
            .filter(|index| match_any(&self.request.indices, &index.name))
            .cloned()
            .collect();
        if indices.is_empty() {
            return Err(Error::snapshot(
                repository,
                target,
                format!("no indices in source snapshot [{source}] match the requested patterns"),
            )
            .into());
        }

        let entry = Entry {
            snapshot: self.snapshot.clone(),
            include_global_state: false,
            partial: false,
            state: SnapshotState::Started,
            indices,
            data_streams: Vec::new(),
            start_time_ms: self.start_time_ms,
            repo_generation: self.repo_data.gen_id,
            user_metadata: None,
            repository_meta_version: min_peer.min(Version::CURRENT),
            shards: BTreeMap::new(),
            source: Some(source),
            clones: BTreeMap::new(),
            failure: None,
        };
        let mut snapshots = current.snapshots.clone();
        snapshots.entries.push(entry);
        Ok(ClusterState {
            snapshots,
            ..current.clone()
        })
    }

    fn applied(self: Box<Self>, _source: &str, _previous: &ClusterState, current: &ClusterState) {
        let Self {
            service,
            snapshot,
            admission,
            completion,
            repo_data,
            ..
        } = *self;
        service
            .initializing_clones
            .lock()
            .unwrap()
            .insert(snapshot.clone());
        if let Some(completion) = completion {
            service.listeners.add_completion(snapshot.clone(), completion);
        }
        let _ = admission.send(Ok(()));

        let Some(entry) = current.snapshots.get(&snapshot).cloned() else {
            return;
        };
        tracing::info!(%snapshot, "clone admitted, starting shard enumeration");
        tokio::spawn(async move { service.start_cloning(entry, repo_data).await });
    }

    fn on_failure(self: Box<Self>, source: &str, error: anyhow::Error) {
        let error = Error::classify(&self.request.repository, &self.request.target, error);
        tracing::debug!(%source, %error, "clone admission failed");
        if error.is_manager_failure() {
            self.service.fail_outstanding_listeners_on_failover();
        }
        let _ = self.admission.send(Err(error));
    }
}

impl SnapshotsService {
    /// Clone preparation after admission: load the source's
    /// `SnapshotInfo`, read each index's shard count, then propose the
    /// state update that fills the entry's clone shards.
    async fn start_cloning(self: Arc<Self>, entry: Entry, repo_data: RepositoryData) {
        let snapshot = entry.snapshot.clone();
        let source = entry.source.clone().expect("clone entry has a source");
        match self.prepare_clone_shards(&entry, &source, &repo_data).await {
            Ok(counts) => {
                self.bus.submit_update(
                    &format!("start_clone [{snapshot}]"),
                    Box::new(StartCloneTask {
                        service: self.clone(),
                        snapshot,
                        repo_data,
                        counts,
                    }),
                );
            }
            Err(error) => {
                tracing::warn!(%snapshot, %error, "failed to prepare snapshot clone");
                self.initializing_clones.lock().unwrap().remove(&snapshot);
                self.remove_failed_snapshot(snapshot, error);
            }
        }
    }

    async fn prepare_clone_shards(
        &self,
        entry: &Entry,
        source: &SnapshotId,
        repo_data: &RepositoryData,
    ) -> Result<Vec<(IndexId, u32)>, Error> {
        let repository = entry.repository();
        let target = &entry.snapshot.snapshot_id.name;
        let driver = self.driver(repository)?;

        let info = driver
            .get_snapshot_info(source)
            .await
            .map_err(|e| Error::classify(repository, target, e))?;
        for index in &entry.indices {
            if info.failed_indices().any(|name| name == index.name) {
                return Err(Error::snapshot(
                    repository,
                    target,
                    format!(
                        "cannot clone index [{}] because its snapshot was not successful",
                        index.name
                    ),
                ));
            }
        }

        let mut counts = Vec::with_capacity(entry.indices.len());
        for index in &entry.indices {
            let meta = driver
                .get_snapshot_index_metadata(repo_data, source, index)
                .await
                .map_err(|e| Error::classify(repository, target, e))?;
            counts.push((index.clone(), meta.shard_count));
        }
        Ok(counts)
    }

    /// Dispatches every clone shard assigned to this node that is not
    /// already running. Idempotent through `currently_cloning`; also how a
    /// new cluster-manager adopts clones begun by its predecessor.
    pub(crate) fn run_ready_clone_operations(&self, state: &ClusterState) {
        let Some(local) = state.nodes.local_node_id.clone() else {
            return;
        };
        for entry in &state.snapshots.entries {
            if !entry.is_clone() || entry.state.completed() {
                continue;
            }
            let source = entry.source.clone().expect("clone entry has a source");
            for (repo_shard, status) in &entry.clones {
                if status.state != ShardState::Init || status.node_id.as_ref() != Some(&local) {
                    continue;
                }
                let marker = (entry.snapshot.clone(), repo_shard.clone());
                if !self.currently_cloning.lock().unwrap().insert(marker) {
                    continue;
                }
                let service = self.arc();
                let snapshot = entry.snapshot.clone();
                let source = source.clone();
                let repo_shard = repo_shard.clone();
                let generation = status.generation.clone();
                let node = local.clone();
                tokio::spawn(async move {
                    service
                        .run_shard_clone(snapshot, source, repo_shard, generation, node)
                        .await;
                });
            }
        }
    }

    async fn run_shard_clone(
        self: Arc<Self>,
        snapshot: Snapshot,
        source: SnapshotId,
        repo_shard: RepositoryShardId,
        generation: Option<ShardGeneration>,
        node: models::NodeId,
    ) {
        let result = match self.driver(&snapshot.repository) {
            Ok(driver) => {
                driver
                    .clone_shard_snapshot(
                        &source,
                        &snapshot.snapshot_id,
                        &repo_shard,
                        generation.clone(),
                    )
                    .await
            }
            Err(error) => Err(error.into()),
        };
        let status = match result {
            Ok(new_generation) => ShardSnapshotStatus::success(node, Some(new_generation)),
            Err(error) => {
                tracing::warn!(%snapshot, %repo_shard, error = %format!("{error:#}"), "shard clone failed");
                ShardSnapshotStatus::failed(
                    Some(node),
                    format!("failed to clone shard: {error:#}"),
                    generation,
                )
            }
        };
        let update = ShardSnapshotUpdate {
            snapshot: snapshot.clone(),
            key: EntryShardKey::Repository(repo_shard.clone()),
            status,
        };
        if let Err(error) = self.update_shard_state(update).await {
            tracing::warn!(%snapshot, %error, "failed to report shard clone status");
            self.currently_cloning
                .lock()
                .unwrap()
                .remove(&(snapshot, repo_shard));
        }
    }
}

struct StartCloneTask {
    service: Arc<SnapshotsService>,
    snapshot: Snapshot,
    repo_data: RepositoryData,
    counts: Vec<(IndexId, u32)>,
}

impl UpdateTask for StartCloneTask {
    fn execute(&mut self, current: &ClusterState) -> anyhow::Result<ClusterState> {
        let Some(entry) = current.snapshots.get(&self.snapshot).cloned() else {
            return Err(Error::snapshot(
                &self.snapshot.repository,
                &self.snapshot.snapshot_id.name,
                "clone was aborted before its shards were enumerated",
            )
            .into());
        };
        if entry.state != SnapshotState::Started {
            return Err(Error::snapshot(
                &self.snapshot.repository,
                &self.snapshot.snapshot_id.name,
                format!("clone is no longer startable in state [{:?}]", entry.state),
            )
            .into());
        }
        let repository = self.snapshot.repository.clone();
        let local = current
            .nodes
            .local_node_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("local node id is unknown"))?;

        let in_flight = InFlightShardStates::from_entries(
            current
                .snapshots
                .for_repo(&repository)
                .filter(|e| e.snapshot != self.snapshot),
        );
        let deletion_started = current
            .snapshot_deletions
            .started_for_repo(&repository)
            .is_some();

        let mut clones = BTreeMap::new();
        for (index, shard_count) in &self.counts {
            for number in 0..*shard_count {
                let repo_shard = RepositoryShardId::new(index.clone(), number);
                let status = if deletion_started || in_flight.is_active(&repo_shard) {
                    ShardSnapshotStatus::unassigned_queued()
                } else {
                    let generation = in_flight
                        .generation(&repo_shard)
                        .or_else(|| self.repo_data.shard_generation(&repo_shard))
                        .cloned()
                        .unwrap_or_else(ShardGeneration::new_shard);
                    ShardSnapshotStatus::init(local.clone(), Some(generation))
                };
                clones.insert(repo_shard, status);
            }
        }
        let updated = Entry { clones, ..entry };
        Ok(ClusterState {
            snapshots: current.snapshots.with_entry_replaced(updated),
            ..current.clone()
        })
    }

    fn applied(self: Box<Self>, _source: &str, _previous: &ClusterState, current: &ClusterState) {
        self.service
            .initializing_clones
            .lock()
            .unwrap()
            .remove(&self.snapshot);
        // The generic applier pass has already dispatched ready clone
        // shards for this state; nothing further to do here.
        let _ = current;
    }

    fn on_failure(self: Box<Self>, source: &str, error: anyhow::Error) {
        let error = Error::classify(
            &self.snapshot.repository,
            &self.snapshot.snapshot_id.name,
            error,
        );
        tracing::warn!(%source, %error, "failed to start snapshot clone");
        self.service
            .initializing_clones
            .lock()
            .unwrap()
            .remove(&self.snapshot);
        if error.is_manager_failure() {
            self.service.fail_outstanding_listeners_on_failover();
        } else {
            self.service
                .listeners
                .resolve_completions(&self.snapshot, Err(error));
        }
    }
}
