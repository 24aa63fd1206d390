use std::collections::BTreeMap;
use std::sync::Arc;

use cluster::{ClusterState, UpdateTask};
use itertools::Itertools;
use models::{
    validate_snapshot_name, Entry, IndexId, InFlightShardStates, ShardState, Snapshot,
    SnapshotId, SnapshotState, Version,
};
use repository::{RepositoryData, SnapshotInfo};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::listeners::CompletionSender;
use crate::shards::ShardAssignment;
use crate::{now_ms, Error, SnapshotsService};

fn default_indices() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub repository: String,
    pub snapshot: String,
    #[serde(default = "default_indices")]
    pub indices: Vec<String>,
    #[serde(default = "default_true")]
    pub include_global_state: bool,
    #[serde(default)]
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_metadata: Option<serde_json::Value>,
}

impl SnapshotsService {
    /// Admits a new snapshot. Resolves once the entry is in applied
    /// cluster state; shard work proceeds asynchronously from there.
    #[tracing::instrument(skip_all, fields(repository = %request.repository, snapshot = %request.snapshot))]
    pub async fn create_snapshot(
        &self,
        request: CreateSnapshotRequest,
    ) -> Result<Snapshot, Error> {
        self.admit_create(request, None).await
    }

    /// Admits a new snapshot and resolves only when it has fully
    /// completed, with the finalized `SnapshotInfo`.
    #[tracing::instrument(skip_all, fields(repository = %request.repository, snapshot = %request.snapshot))]
    pub async fn execute_snapshot(
        &self,
        request: CreateSnapshotRequest,
    ) -> Result<SnapshotInfo, Error> {
        let (tx, rx) = oneshot::channel();
        let snapshot = self.admit_create(request, Some(tx)).await?;
        let info = rx.await.unwrap_or(Err(Error::NotClusterManager))?;
        if info.state == SnapshotState::Failed {
            return Err(Error::snapshot(
                &snapshot.repository,
                &snapshot.snapshot_id.name,
                info.reason
                    .unwrap_or_else(|| "snapshot failed".to_string()),
            ));
        }
        Ok(info)
    }

    async fn admit_create(
        &self,
        request: CreateSnapshotRequest,
        completion: Option<CompletionSender>,
    ) -> Result<Snapshot, Error> {
        validate_snapshot_name(&request.snapshot).map_err(|e| Error::InvalidSnapshotName {
            repository: request.repository.clone(),
            name: e.name,
            reason: e.reason,
        })?;
        let driver = self.driver(&request.repository)?;
        let repo_data = driver
            .get_repository_data()
            .await
            .map_err(|e| Error::classify(&request.repository, &request.snapshot, e))?;

        let snapshot = Snapshot::new(
            request.repository.clone(),
            SnapshotId::new(request.snapshot.clone(), uuid::Uuid::new_v4()),
        );
        let (admission, rx) = oneshot::channel();

        let min_peer = self.bus.state().min_peer_version();
        if min_peer >= Version::FULL_CONCURRENCY {
            self.bus.submit_update(
                &format!("create_snapshot [{snapshot}]"),
                Box::new(CreateSnapshotTask {
                    service: self.arc(),
                    request,
                    repo_data,
                    snapshot,
                    start_time_ms: now_ms(),
                    admission,
                    completion,
                }),
            );
        } else {
            self.bus.submit_update(
                &format!("legacy_create_snapshot [{snapshot}]"),
                Box::new(LegacyCreateTask {
                    service: self.arc(),
                    request,
                    repo_data,
                    snapshot,
                    start_time_ms: now_ms(),
                    min_peer,
                    admission,
                    completion,
                }),
            );
        }
        rx.await.unwrap_or(Err(Error::NotClusterManager))
    }
}

/// Admission checks shared by both create paths and by clone admission.
pub(crate) fn ensure_admittable(
    state: &ClusterState,
    repo_data: &RepositoryData,
    repository: &str,
    name: &str,
) -> Result<(), Error> {
    let meta = state
        .metadata
        .repository(repository)
        .ok_or_else(|| Error::RepositoryMissing(repository.to_string()))?;
    if meta.readonly {
        return Err(Error::Repository {
            repository: repository.to_string(),
            reason: "repository is readonly".to_string(),
        });
    }
    if state
        .snapshots
        .for_repo(repository)
        .any(|e| e.snapshot.snapshot_id.name == name)
    {
        return Err(Error::InvalidSnapshotName {
            repository: repository.to_string(),
            name: name.to_string(),
            reason: "snapshot with the same name is already in-progress".to_string(),
        });
    }
    if repo_data.has_snapshot_name(name) {
        return Err(Error::InvalidSnapshotName {
            repository: repository.to_string(),
            name: name.to_string(),
            reason: "snapshot with the same name already exists".to_string(),
        });
    }
    if state.repository_cleanups.contains(repository) {
        return Err(Error::concurrent(
            repository,
            name,
            "cannot snapshot while a repository cleanup is in-progress",
        ));
    }
    Ok(())
}

/// Maps live index names onto their repository identities, reusing the
/// identity of previously snapshotted indices of the same name.
pub(crate) fn resolve_index_ids(repo_data: &RepositoryData, names: &[String]) -> Vec<IndexId> {
    names
        .iter()
        .map(|name| {
            repo_data
                .index_id(name)
                .cloned()
                .unwrap_or_else(|| IndexId::new(name.clone(), uuid::Uuid::new_v4()))
        })
        .collect()
}

fn missing_shard_indices(
    shards: &BTreeMap<models::ShardId, models::ShardSnapshotStatus>,
) -> Vec<String> {
    shards
        .iter()
        .filter(|(_, s)| s.state == ShardState::Missing)
        .map(|(id, _)| id.index.clone())
        .unique()
        .collect()
}

struct CreateSnapshotTask {
    service: Arc<SnapshotsService>,
    request: CreateSnapshotRequest,
    repo_data: RepositoryData,
    snapshot: Snapshot,
    start_time_ms: i64,
    admission: oneshot::Sender<Result<Snapshot, Error>>,
    completion: Option<CompletionSender>,
}

impl UpdateTask for CreateSnapshotTask {
    fn execute(&mut self, current: &ClusterState) -> anyhow::Result<ClusterState> {
        let repository = &self.request.repository;
        let name = &self.request.snapshot;

        ensure_admittable(current, &self.repo_data, repository, name)?;

        let min_peer = current.min_peer_version();
        if min_peer < Version::FULL_CONCURRENCY
            && !(current.snapshots.is_empty() && current.snapshot_deletions.is_empty())
        {
            return Err(Error::concurrent(
                repository,
                name,
                "cluster contains peers without concurrent snapshot support \
                 and another operation is running",
            )
            .into());
        }
        self.service
            .ensure_below_concurrency_limit(current, repository, name)?;

        let (index_names, data_streams) = current.metadata.resolve_indices(&self.request.indices);
        let indices = resolve_index_ids(&self.repo_data, &index_names);
        let repository_meta_version = min_peer.min(Version::CURRENT);

        let in_flight = InFlightShardStates::from_entries(current.snapshots.for_repo(repository));
        let assignment = ShardAssignment {
            metadata: &current.metadata,
            routing: &current.routing,
            repo_data: &self.repo_data,
            in_flight: &in_flight,
            deletion_started: current
                .snapshot_deletions
                .started_for_repo(repository)
                .is_some(),
            use_shard_generations: repository_meta_version >= Version::SHARD_GEN_IN_REPO_DATA,
        };
        let shards = assignment.assign(&indices);

        if !self.request.partial {
            let missing = missing_shard_indices(&shards);
            if !missing.is_empty() {
                return Err(Error::snapshot(
                    repository,
                    name,
                    format!("indices [{}] don't have primary shards", missing.join(", ")),
                )
                .into());
            }
        }

        let entry = Entry {
            snapshot: self.snapshot.clone(),
            include_global_state: self.request.include_global_state,
            partial: self.request.partial,
            state: SnapshotState::Started,
            indices,
            data_streams,
            start_time_ms: self.start_time_ms,
            repo_generation: self.repo_data.gen_id,
            user_metadata: self.request.user_metadata.clone(),
            repository_meta_version,
            shards,
            source: None,
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
            ..
        } = *self;
        tracing::info!(%snapshot, "snapshot started");
        if let Some(completion) = completion {
            service.listeners.add_completion(snapshot.clone(), completion);
        }
        let _ = admission.send(Ok(snapshot.clone()));
        debug_assert!(
            current.snapshots.get(&snapshot).is_some()
                || service.ending_snapshots.lock().unwrap().contains(&snapshot)
        );
    }

    fn on_failure(self: Box<Self>, source: &str, error: anyhow::Error) {
        let error = Error::classify(&self.request.repository, &self.request.snapshot, error);
        tracing::debug!(%source, %error, "snapshot admission failed");
        if error.is_manager_failure() {
            self.service.fail_outstanding_listeners_on_failover();
        }
        let _ = self.admission.send(Err(error));
    }
}

struct LegacyCreateTask {
    service: Arc<SnapshotsService>,
    request: CreateSnapshotRequest,
    repo_data: RepositoryData,
    snapshot: Snapshot,
    start_time_ms: i64,
    min_peer: Version,
    admission: oneshot::Sender<Result<Snapshot, Error>>,
    completion: Option<CompletionSender>,
}

impl UpdateTask for LegacyCreateTask {
    fn execute(&mut self, current: &ClusterState) -> anyhow::Result<ClusterState> {
        let repository = &self.request.repository;
        let name = &self.request.snapshot;

        ensure_admittable(current, &self.repo_data, repository, name)?;
        if !current.snapshots.is_empty() {
            return Err(Error::concurrent(repository, name, "a snapshot is already running").into());
        }
        if !current.snapshot_deletions.is_empty() {
            return Err(Error::concurrent(
                repository,
                name,
                "cannot snapshot while a snapshot deletion is in-progress",
            )
            .into());
        }
        self.service
            .ensure_below_concurrency_limit(current, repository, name)?;

        let (index_names, data_streams) = current.metadata.resolve_indices(&self.request.indices);
        let indices = resolve_index_ids(&self.repo_data, &index_names);

        let entry = Entry {
            snapshot: self.snapshot.clone(),
            include_global_state: self.request.include_global_state,
            partial: self.request.partial,
            state: SnapshotState::Init,
            indices,
            data_streams,
            start_time_ms: self.start_time_ms,
            repo_generation: self.repo_data.gen_id,
            user_metadata: self.request.user_metadata.clone(),
            repository_meta_version: self.min_peer.min(Version::CURRENT),
            shards: BTreeMap::new(),
            source: None,
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
            min_peer,
            ..
        } = *self;
        service
            .initializing_snapshots
            .lock()
            .unwrap()
            .insert(snapshot.clone());
        if let Some(completion) = completion {
            service.listeners.add_completion(snapshot.clone(), completion);
        }
        let _ = admission.send(Ok(snapshot.clone()));

        let Some(entry) = current.snapshots.get(&snapshot).cloned() else {
            return;
        };
        tokio::spawn(async move {
            service
                .begin_legacy_snapshot(entry, repo_data, min_peer)
                .await;
        });
    }

    fn on_failure(self: Box<Self>, source: &str, error: anyhow::Error) {
        let error = Error::classify(&self.request.repository, &self.request.snapshot, error);
        tracing::debug!(%source, %error, "snapshot admission failed");
        if error.is_manager_failure() {
            self.service.fail_outstanding_listeners_on_failover();
        }
        let _ = self.admission.send(Err(error));
    }
}

impl SnapshotsService {
    /// Legacy second phase: optionally pre-initialize repository metadata,
    /// then move the entry from INIT to STARTED with shard assignments.
    async fn begin_legacy_snapshot(
        self: Arc<Self>,
        entry: Entry,
        repo_data: RepositoryData,
        min_peer: Version,
    ) {
        let snapshot = entry.snapshot.clone();
        if min_peer < Version::NO_REPO_INITIALIZE {
            let init = match self.driver(&snapshot.repository) {
                Ok(driver) => {
                    driver
                        .initialize_snapshot(
                            &snapshot.snapshot_id,
                            &entry.indices,
                            serde_json::json!({}),
                        )
                        .await
                }
                Err(error) => Err(error.into()),
            };
            if let Err(error) = init {
                let error = Error::classify(
                    &snapshot.repository,
                    &snapshot.snapshot_id.name,
                    error,
                );
                tracing::warn!(%snapshot, %error, "failed to initialize snapshot in repository");
                self.initializing_snapshots.lock().unwrap().remove(&snapshot);
                self.remove_failed_snapshot(snapshot, error);
                return;
            }
        }
        self.bus.submit_update(
            &format!("start_snapshot [{snapshot}]"),
            Box::new(LegacyStartTask {
                service: self.clone(),
                snapshot,
                repo_data,
                aborted_during_init: false,
            }),
        );
    }
}

struct LegacyStartTask {
    service: Arc<SnapshotsService>,
    snapshot: Snapshot,
    repo_data: RepositoryData,
    aborted_during_init: bool,
}

impl UpdateTask for LegacyStartTask {
    fn execute(&mut self, current: &ClusterState) -> anyhow::Result<ClusterState> {
        let Some(entry) = current.snapshots.get(&self.snapshot).cloned() else {
            // A deletion removed the entry while repository metadata was
            // being initialized.
            self.aborted_during_init = true;
            return Ok(current.clone());
        };
        if entry.state != SnapshotState::Init {
            self.aborted_during_init = true;
            return Ok(current.clone());
        }

        let in_flight = InFlightShardStates::default();
        let assignment = ShardAssignment {
            metadata: &current.metadata,
            routing: &current.routing,
            repo_data: &self.repo_data,
            in_flight: &in_flight,
            deletion_started: false,
            use_shard_generations: entry.repository_meta_version
                >= Version::SHARD_GEN_IN_REPO_DATA,
        };
        let shards = assignment.assign(&entry.indices);

        let updated = if !entry.partial {
            let missing = missing_shard_indices(&shards);
            if !missing.is_empty() {
                Entry {
                    state: SnapshotState::Failed,
                    failure: Some(format!(
                        "indices [{}] don't have primary shards",
                        missing.join(", ")
                    )),
                    shards,
                    ..entry
                }
            } else {
                Entry {
                    state: SnapshotState::Started,
                    shards,
                    ..entry
                }
            }
        } else {
            Entry {
                state: SnapshotState::Started,
                shards,
                ..entry
            }
        };
        Ok(ClusterState {
            snapshots: current.snapshots.with_entry_replaced(updated),
            ..current.clone()
        })
    }

    fn applied(self: Box<Self>, _source: &str, _previous: &ClusterState, _current: &ClusterState) {
        self.service
            .initializing_snapshots
            .lock()
            .unwrap()
            .remove(&self.snapshot);
        if self.aborted_during_init {
            // Historical quirk, kept on purpose: when a deletion aborts an
            // entry mid-initialization, both this path and the deletion
            // path may hand the entry to finalization. The ending-set
            // usually de-duplicates the two, but a failover that clears it
            // in between re-opens the window for a double finalization.
            tracing::debug!(snapshot = %self.snapshot, "snapshot aborted during initialization");
        }
        // Entries that started with nothing to do (or failed outright)
        // are picked up by the generic applier pass.
    }

    fn on_failure(self: Box<Self>, source: &str, error: anyhow::Error) {
        let error = Error::classify(
            &self.snapshot.repository,
            &self.snapshot.snapshot_id.name,
            error,
        );
        tracing::warn!(%source, %error, "failed to start snapshot");
        self.service
            .initializing_snapshots
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
