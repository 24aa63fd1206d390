use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cluster::{ClusterState, UpdateTask};
use models::{
    match_any, ABORTED_BY_DELETION, DeletionEntry, DeletionState, EntryShardKey,
    RepositoryShardId, ShardGeneration, ShardId, ShardSnapshotStatus, Snapshot, SnapshotId,
    SnapshotDeletionsInProgress, SnapshotsInProgress, Version,
};
use repository::RepositoryData;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::{now_ms, Error, SnapshotsService};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteSnapshotsRequest {
    pub repository: String,
    /// Names to delete; glob patterns are supported.
    pub snapshots: Vec<String>,
}

/// Promotes WAITING deletions whose repository has no writers left: no
/// in-progress snapshot entries (entries leave state only at
/// finalization) and no other STARTED deletion. At most one deletion per
/// repository is ever STARTED.
pub(crate) fn ready_deletions(
    snapshots: &SnapshotsInProgress,
    deletions: &SnapshotDeletionsInProgress,
) -> SnapshotDeletionsInProgress {
    let mut started_repos: BTreeSet<String> = deletions
        .entries
        .iter()
        .filter(|e| e.state == DeletionState::Started)
        .map(|e| e.repository.clone())
        .collect();
    let entries = deletions
        .entries
        .iter()
        .map(|entry| {
            if entry.state == DeletionState::Started {
                return entry.clone();
            }
            if snapshots.for_repo(&entry.repository).next().is_none()
                && !started_repos.contains(&entry.repository)
            {
                started_repos.insert(entry.repository.clone());
                entry.started()
            } else {
                entry.clone()
            }
        })
        .collect();
    SnapshotDeletionsInProgress { entries }
}

impl SnapshotsService {
    /// Deletes snapshots by name or glob. Resolves when the snapshots are
    /// gone from the repository (or immediately, when nothing matches).
    #[tracing::instrument(skip_all, fields(
        repository = %request.repository,
        snapshots = %request.snapshots.join(","),
    ))]
    pub async fn delete_snapshots(
        &self,
        request: DeleteSnapshotsRequest,
    ) -> Result<(), Error> {
        let label = request.snapshots.join(",");
        let driver = self.driver(&request.repository)?;
        let repo_data = driver
            .get_repository_data()
            .await
            .map_err(|e| Error::classify(&request.repository, &label, e))?;

        let (listener, rx) = oneshot::channel();
        self.bus.submit_update(
            &format!("delete_snapshots [{}:{label}]", request.repository),
            Box::new(DeleteSnapshotsTask {
                service: self.arc(),
                request,
                repo_data,
                uuid: uuid::Uuid::new_v4(),
                start_time_ms: now_ms(),
                listener,
                outcome: TaskOutcome::NoMatch,
                removed_outright: Vec::new(),
            }),
        );
        rx.await.unwrap_or(Err(Error::NotClusterManager))
    }

    /// Starts every STARTED deletion whose repository loop is free. The
    /// loop holder's own continuation picks up the rest.
    pub(crate) fn maybe_start_deletions(&self, state: &ClusterState) {
        for deletion in &state.snapshot_deletions.entries {
            if deletion.state != DeletionState::Started {
                continue;
            }
            let run = {
                let mut finalizing = self.currently_finalizing.lock().unwrap();
                let mut ongoing = self.ongoing.lock().unwrap();
                if ongoing.is_running_deletion(&deletion.uuid)
                    || finalizing.contains(&deletion.repository)
                {
                    false
                } else {
                    finalizing.insert(deletion.repository.clone());
                    ongoing.mark_deletion_running(deletion.uuid);
                    true
                }
            };
            if run {
                let service = self.arc();
                let deletion = deletion.clone();
                tokio::spawn(async move { service.run_deletion(deletion).await });
            }
        }
    }

    /// Runs with the repository loop held: performs the repository-side
    /// delete and proposes removal of the deletion entry.
    pub(crate) async fn run_deletion(self: Arc<Self>, deletion: DeletionEntry) {
        let result = self.delete_from_repository(&deletion).await;
        match &result {
            Ok(_) => {
                tracing::info!(
                    repository = %deletion.repository,
                    uuid = %deletion.uuid,
                    snapshots = deletion.snapshots.len(),
                    "deleted snapshots from repository"
                );
            }
            Err(error) => {
                tracing::warn!(
                    repository = %deletion.repository,
                    uuid = %deletion.uuid,
                    %error,
                    "failed to delete snapshots from repository"
                );
            }
        }
        self.bus.submit_update(
            &format!("remove snapshot deletion [{}:{}]", deletion.repository, deletion.uuid),
            Box::new(RemoveDeletionTask {
                service: self.clone(),
                deletion,
                result,
            }),
        );
    }

    async fn delete_from_repository(
        &self,
        deletion: &DeletionEntry,
    ) -> Result<RepositoryData, Error> {
        let repository = &deletion.repository;
        let label = deletion.uuid.to_string();
        let driver = self.driver(repository)?;
        let repo_data = driver
            .get_repository_data()
            .await
            .map_err(|e| Error::classify(repository, &label, e))?;
        if repo_data.gen_id < deletion.repo_generation {
            self.invariant_violation(
                repository,
                &format!(
                    "repository generation moved backwards: [{}] < [{}]",
                    repo_data.gen_id, deletion.repo_generation
                ),
            );
        }

        // Ids whose snapshot never reached the repository (aborted before
        // any work, or failed finalization) have nothing left to delete.
        let ids: Vec<SnapshotId> = deletion
            .snapshots
            .iter()
            .filter(|id| repo_data.contains(id))
            .cloned()
            .collect();
        if ids.is_empty() {
            return Ok(repo_data);
        }
        let repo_meta_version = self.bus.state().min_peer_version().min(Version::CURRENT);
        driver
            .delete_snapshots(&ids, repo_data.gen_id, repo_meta_version)
            .await
            .map_err(|e| Error::classify(repository, &label, e))
    }
}

enum TaskOutcome {
    /// Nothing matched: resolve immediately with success.
    NoMatch,
    /// Matches were handled without needing a deletion entry.
    Immediate,
    /// The listener waits on this deletion entry.
    Attach(uuid::Uuid),
}

struct DeleteSnapshotsTask {
    service: Arc<SnapshotsService>,
    request: DeleteSnapshotsRequest,
    repo_data: RepositoryData,
    uuid: uuid::Uuid,
    start_time_ms: i64,
    listener: oneshot::Sender<Result<(), Error>>,
    outcome: TaskOutcome,
    removed_outright: Vec<Snapshot>,
}

impl UpdateTask for DeleteSnapshotsTask {
    fn execute(&mut self, current: &ClusterState) -> anyhow::Result<ClusterState> {
        let repository = self.request.repository.clone();
        let label = self.request.snapshots.join(",");

        current
            .metadata
            .repository(&repository)
            .ok_or_else(|| Error::RepositoryMissing(repository.clone()))?;
        if current.repository_cleanups.contains(&repository) {
            return Err(Error::concurrent(
                &repository,
                &label,
                "cannot delete snapshots while a repository cleanup is in-progress",
            )
            .into());
        }
        let min_peer = current.min_peer_version();
        if min_peer < Version::MULTI_DELETE
            && (self.request.snapshots.len() > 1
                || self.request.snapshots.iter().any(|p| p.contains('*')))
        {
            return Err(Error::concurrent(
                &repository,
                &label,
                format!(
                    "deleting multiple snapshots or patterns requires all peers at or above {}",
                    Version::MULTI_DELETE
                ),
            )
            .into());
        }

        let matched_in_progress: Vec<models::Entry> = current
            .snapshots
            .for_repo(&repository)
            .filter(|e| match_any(&self.request.snapshots, &e.snapshot.snapshot_id.name))
            .cloned()
            .collect();
        let in_progress_names: BTreeSet<&str> = matched_in_progress
            .iter()
            .map(|e| e.snapshot.snapshot_id.name.as_str())
            .collect();
        let matched_repo_ids: Vec<SnapshotId> = self
            .repo_data
            .snapshots
            .iter()
            .filter(|id| match_any(&self.request.snapshots, &id.name))
            .filter(|id| !in_progress_names.contains(id.name.as_str()))
            .cloned()
            .collect();

        if matched_in_progress.is_empty() && matched_repo_ids.is_empty() {
            self.outcome = TaskOutcome::NoMatch;
            return Ok(current.clone());
        }

        for id in &matched_repo_ids {
            if current.restoring.contains(id) {
                return Err(Error::concurrent(
                    &repository,
                    &id.name,
                    "cannot delete snapshot during a restore",
                )
                .into());
            }
        }
        let all_matched: BTreeSet<&SnapshotId> = matched_repo_ids
            .iter()
            .chain(matched_in_progress.iter().map(|e| &e.snapshot.snapshot_id))
            .collect();
        for entry in current.snapshots.for_repo(&repository) {
            if entry.state.completed() || !entry.is_clone() {
                continue;
            }
            if let Some(source) = &entry.source {
                if all_matched.contains(source) {
                    return Err(Error::concurrent(
                        &repository,
                        &source.name,
                        "cannot delete snapshot while it is being cloned",
                    )
                    .into());
                }
            }
        }

        if min_peer < Version::FULL_CONCURRENCY {
            if !current.snapshot_deletions.is_empty() {
                return Err(Error::concurrent(
                    &repository,
                    &label,
                    "a snapshot deletion is already in progress",
                )
                .into());
            }
            let other_running = current.snapshots.entries.iter().any(|e| {
                !match_any(&self.request.snapshots, &e.snapshot.snapshot_id.name)
                    || e.repository() != repository
            });
            if other_running {
                return Err(Error::concurrent(
                    &repository,
                    &label,
                    "another snapshot is currently running",
                )
                .into());
            }
        }

        // Abort matching in-flight entries. Entries with no work done are
        // removed outright; the rest stay until their data nodes
        // acknowledge the abort and finalization writes them out.
        let mut snapshots = current.snapshots.clone();
        let mut deletion_ids = matched_repo_ids;
        for entry in &matched_in_progress {
            if entry.state.completed() {
                deletion_ids.push(entry.snapshot.snapshot_id.clone());
                continue;
            }
            match entry.abort() {
                Some(aborted) => {
                    snapshots = snapshots.with_entry_replaced(aborted);
                    deletion_ids.push(entry.snapshot.snapshot_id.clone());
                }
                None => {
                    snapshots = snapshots.without(&entry.snapshot);
                    self.removed_outright.push(entry.snapshot.clone());
                }
            }
        }

        let mut deletions = current.snapshot_deletions.clone();
        if deletion_ids.is_empty() {
            self.outcome = TaskOutcome::Immediate;
        } else if let Some(waiting) = current
            .snapshot_deletions
            .for_repo(&repository)
            .find(|e| e.state == DeletionState::Waiting)
        {
            deletions = deletions.with_entry_replaced(waiting.with_snapshots_added(&deletion_ids));
            self.outcome = TaskOutcome::Attach(waiting.uuid);
        } else if let Some(started) = current
            .snapshot_deletions
            .started_for_repo(&repository)
            .filter(|e| deletion_ids.iter().all(|id| e.contains(id)))
        {
            // Someone is already deleting exactly these; just wait on it.
            self.outcome = TaskOutcome::Attach(started.uuid);
        } else {
            let blocked = snapshots.for_repo(&repository).next().is_some()
                || deletions.started_for_repo(&repository).is_some();
            deletions = deletions.with_entry_added(DeletionEntry {
                uuid: self.uuid,
                repository: repository.clone(),
                snapshots: deletion_ids,
                start_time_ms: self.start_time_ms,
                repo_generation: self.repo_data.gen_id,
                state: if blocked {
                    DeletionState::Waiting
                } else {
                    DeletionState::Started
                },
            });
            self.outcome = TaskOutcome::Attach(self.uuid);
        }

        Ok(ClusterState {
            snapshots,
            snapshot_deletions: deletions,
            ..current.clone()
        })
    }

    fn applied(self: Box<Self>, _source: &str, _previous: &ClusterState, _current: &ClusterState) {
        let Self {
            service,
            listener,
            outcome,
            removed_outright,
            request,
            ..
        } = *self;
        for snapshot in removed_outright {
            tracing::info!(%snapshot, "removed aborted snapshot with no completed work");
            service.initializing_snapshots.lock().unwrap().remove(&snapshot);
            service.initializing_clones.lock().unwrap().remove(&snapshot);
            service.listeners.resolve_completions(
                &snapshot,
                Err(Error::snapshot(
                    &snapshot.repository,
                    &snapshot.snapshot_id.name,
                    ABORTED_BY_DELETION,
                )),
            );
        }
        match outcome {
            TaskOutcome::NoMatch | TaskOutcome::Immediate => {
                let _ = listener.send(Ok(()));
            }
            TaskOutcome::Attach(uuid) => {
                tracing::debug!(repository = %request.repository, %uuid, "waiting on deletion");
                service.listeners.add_deletion(uuid, listener);
            }
        }
    }

    fn on_failure(self: Box<Self>, source: &str, error: anyhow::Error) {
        let label = self.request.snapshots.join(",");
        let error = Error::classify(&self.request.repository, &label, error);
        tracing::debug!(%source, %error, "snapshot deletion rejected");
        if error.is_manager_failure() {
            self.service.fail_outstanding_listeners_on_failover();
        }
        let _ = self.listener.send(Err(error));
    }
}

/// Removes a finished (or failed) deletion and starts whatever it was
/// blocking: queued shards whose only blocker was the deletion, and the
/// repository's next WAITING deletion.
struct RemoveDeletionTask {
    service: Arc<SnapshotsService>,
    deletion: DeletionEntry,
    result: Result<RepositoryData, Error>,
}

impl UpdateTask for RemoveDeletionTask {
    fn execute(&mut self, current: &ClusterState) -> anyhow::Result<ClusterState> {
        let repository = self.deletion.repository.clone();
        let deletions = current.snapshot_deletions.without(&self.deletion.uuid);
        let remaining_started = deletions.started_for_repo(&repository).is_some();
        let new_repo_data = self.result.as_ref().ok();
        let local = current.nodes.local_node_id.clone();

        // Current holders and latest successful generations, to decide
        // which queued shards are now free and what they start from.
        let mut active: BTreeSet<RepositoryShardId> = BTreeSet::new();
        let mut latest: BTreeMap<RepositoryShardId, ShardGeneration> = BTreeMap::new();
        for entry in current.snapshots.for_repo(&repository) {
            if entry.state.completed() {
                continue;
            }
            for (repo_shard, status) in entry.repo_shard_statuses() {
                if status.is_active() {
                    active.insert(repo_shard);
                } else if status.state == models::ShardState::Success {
                    if let Some(gen) = &status.generation {
                        latest.insert(repo_shard, gen.clone());
                    }
                }
            }
        }

        let mut entries = Vec::with_capacity(current.snapshots.entries.len());
        for entry in &current.snapshots.entries {
            if entry.repository() != repository || entry.state.completed() {
                entries.push(entry.clone());
                continue;
            }
            let mut updated = entry.clone();
            let use_generations =
                entry.repository_meta_version >= Version::SHARD_GEN_IN_REPO_DATA;
            let starting_generation = |repo_shard: &RepositoryShardId| {
                if !use_generations {
                    return None;
                }
                Some(
                    latest
                        .get(repo_shard)
                        .cloned()
                        .or_else(|| {
                            new_repo_data
                                .and_then(|d| d.shard_generation(repo_shard).cloned())
                        })
                        .unwrap_or_else(ShardGeneration::new_shard),
                )
            };

            if entry.is_clone() {
                for (repo_shard, status) in &entry.clones {
                    if !status.is_unassigned_queued()
                        || remaining_started
                        || active.contains(repo_shard)
                    {
                        continue;
                    }
                    let Some(local) = local.clone() else { continue };
                    updated = updated.with_shard_status(
                        &EntryShardKey::Repository(repo_shard.clone()),
                        ShardSnapshotStatus::init(local, starting_generation(repo_shard)),
                    );
                    active.insert(repo_shard.clone());
                }
            } else {
                for (shard_id, status) in &entry.shards {
                    if !status.is_unassigned_queued() || remaining_started {
                        continue;
                    }
                    let Some(index) = entry.index_id(&shard_id.index) else {
                        continue;
                    };
                    let repo_shard = RepositoryShardId::new(index.clone(), shard_id.shard);
                    if active.contains(&repo_shard) {
                        continue;
                    }
                    let generation = starting_generation(&repo_shard);
                    let next = assign_after_release(current, shard_id, generation);
                    if next.is_active() {
                        active.insert(repo_shard);
                    }
                    updated = updated
                        .with_shard_status(&EntryShardKey::Routing(shard_id.clone()), next);
                }
            }
            entries.push(updated);
        }

        let snapshots = SnapshotsInProgress { entries };
        let snapshot_deletions = ready_deletions(&snapshots, &deletions);
        Ok(ClusterState {
            snapshots,
            snapshot_deletions,
            ..current.clone()
        })
    }

    fn applied(self: Box<Self>, _source: &str, _previous: &ClusterState, _current: &ClusterState) {
        let Self {
            service,
            deletion,
            result,
        } = *self;
        service.ongoing.lock().unwrap().deletion_done(&deletion.uuid);
        service
            .listeners
            .resolve_deletions(&deletion.uuid, result.map(|_| ()));
        service.run_next_queued_operation(&deletion.repository);
    }

    fn on_failure(self: Box<Self>, source: &str, error: anyhow::Error) {
        let error = Error::classify(
            &self.deletion.repository,
            &self.deletion.uuid.to_string(),
            error,
        );
        tracing::warn!(%source, %error, "failed to remove snapshot deletion from cluster state");
        let service = &self.service;
        service.ongoing.lock().unwrap().deletion_done(&self.deletion.uuid);
        service
            .listeners
            .resolve_deletions(&self.deletion.uuid, Err(error.clone()));
        if error.is_manager_failure() {
            service.fail_outstanding_listeners_on_failover();
        } else {
            service.run_next_queued_operation(&self.deletion.repository);
        }
    }
}

/// Status for a queued shard freed by a finished deletion, re-derived from
/// current routing the same way initial assignment does it.
fn assign_after_release(
    state: &ClusterState,
    shard_id: &ShardId,
    generation: Option<ShardGeneration>,
) -> ShardSnapshotStatus {
    use cluster::ShardRoutingState;
    match state.routing.primary(shard_id) {
        Some(primary) => match (primary.state, &primary.node) {
            (ShardRoutingState::Started, Some(node)) => {
                ShardSnapshotStatus::init(node.clone(), generation)
            }
            (ShardRoutingState::Initializing | ShardRoutingState::Relocating, _) => {
                ShardSnapshotStatus::waiting(generation)
            }
            _ => ShardSnapshotStatus::failed(None, "shard is unassigned", generation),
        },
        None => ShardSnapshotStatus::failed(None, "shard is unassigned", generation),
    }
}
