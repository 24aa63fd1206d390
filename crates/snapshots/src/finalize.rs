use std::sync::Arc;

use cluster::{ClusterState, UpdateTask};
use models::{Entry, Snapshot, SnapshotState};
use repository::{SnapshotInfo, SnapshotShardFailure};

use crate::delete::ready_deletions;
use crate::{now_ms, Error, SnapshotsService};

/// Whether an entry has reached the point where finalization may write it
/// out. A clone whose shard enumeration hasn't landed yet and a legacy
/// entry still initializing are not finalizable, even though their (empty)
/// shard maps are vacuously "all completed".
fn ready_to_finalize(entry: &Entry) -> bool {
    match entry.state {
        SnapshotState::Success | SnapshotState::Failed => true,
        SnapshotState::Init => false,
        SnapshotState::Started | SnapshotState::Aborted => {
            if entry.is_clone() && entry.clones.is_empty() {
                false
            } else {
                entry.all_shards_completed()
            }
        }
    }
}

enum Next {
    Finalize(Snapshot),
    Delete(models::DeletionEntry),
    Idle,
}

impl SnapshotsService {
    /// Hands every finished entry of the applied state to its repository
    /// loop. Idempotent: `ending_snapshots` keeps an entry from being
    /// submitted twice, and a fresh cluster-manager uses exactly this to
    /// adopt finished entries it inherited.
    pub(crate) fn end_completed_snapshots(&self, state: &ClusterState) {
        for entry in &state.snapshots.entries {
            if ready_to_finalize(entry) {
                self.end_snapshot(entry);
            }
        }
    }

    pub(crate) fn end_snapshot(&self, entry: &Entry) {
        let snapshot = entry.snapshot.clone();
        if !self
            .ending_snapshots
            .lock()
            .unwrap()
            .insert(snapshot.clone())
        {
            return;
        }
        tracing::debug!(%snapshot, state = ?entry.state, "snapshot ready to finalize");

        let repository = snapshot.repository.clone();
        let run = {
            let mut finalizing = self.currently_finalizing.lock().unwrap();
            let mut ongoing = self.ongoing.lock().unwrap();
            if finalizing.contains(&repository) {
                ongoing.enqueue_finalization(snapshot.clone());
                false
            } else {
                finalizing.insert(repository);
                true
            }
        };
        if run {
            let service = self.arc();
            tokio::spawn(async move { service.finalize_snapshot_entry(snapshot).await });
        }
    }

    /// Runs with the repository loop held. Writes the `SnapshotInfo` and
    /// updated repository data, then proposes removal of the entry from
    /// cluster state.
    pub(crate) async fn finalize_snapshot_entry(self: Arc<Self>, snapshot: Snapshot) {
        let repository = snapshot.repository.clone();
        let state = self.bus.state();
        let Some(entry) = state.snapshots.get(&snapshot).cloned() else {
            // Removed while queued (aborted by a deletion with no work
            // done); there is nothing to write.
            self.ending_snapshots.lock().unwrap().remove(&snapshot);
            self.run_next_queued_operation(&repository);
            return;
        };

        let outcome = self.write_finalization(&entry).await;
        match &outcome {
            Ok(info) => {
                tracing::info!(%snapshot, state = ?info.state, "finalized snapshot");
            }
            Err(error) => {
                tracing::warn!(%snapshot, %error, "failed to finalize snapshot");
            }
        }
        self.bus.submit_update(
            &format!("remove snapshot metadata [{snapshot}]"),
            Box::new(RemoveSnapshotTask {
                service: self.clone(),
                snapshot,
                outcome,
                holds_repo_loop: true,
            }),
        );
    }

    async fn write_finalization(&self, entry: &Entry) -> Result<SnapshotInfo, Error> {
        let repository = entry.repository();
        let snapshot_name = &entry.snapshot.snapshot_id.name;
        let driver = self.driver(repository)?;
        let repo_data = driver
            .get_repository_data()
            .await
            .map_err(|e| Error::classify(repository, snapshot_name, e))?;

        if repo_data.gen_id < entry.repo_generation {
            self.invariant_violation(
                repository,
                &format!(
                    "repository generation moved backwards: [{}] < [{}]",
                    repo_data.gen_id, entry.repo_generation
                ),
            );
        }

        let mut failures = Vec::new();
        let mut successful = 0usize;
        let mut shard_generations = std::collections::BTreeMap::new();
        for (repo_shard, status) in entry.repo_shard_statuses() {
            if status.state == models::ShardState::Success {
                successful += 1;
                if let Some(gen) = &status.generation {
                    if entry.repository_meta_version >= models::Version::SHARD_GEN_IN_REPO_DATA {
                        shard_generations.insert(repo_shard.clone(), gen.clone());
                    }
                }
            } else if status.state.failed() {
                failures.push(SnapshotShardFailure {
                    index: repo_shard.index.name.clone(),
                    shard: repo_shard.shard,
                    node_id: status.node_id.clone(),
                    reason: status
                        .reason
                        .clone()
                        .unwrap_or_else(|| "shard snapshot failed".to_string()),
                });
            }
        }

        let total_shards = entry.shards.len() + entry.clones.len();
        let state = match entry.state {
            SnapshotState::Aborted | SnapshotState::Failed => SnapshotState::Failed,
            _ if !failures.is_empty() && !entry.partial => SnapshotState::Failed,
            _ => SnapshotState::Success,
        };
        let reason = entry.failure.clone().or_else(|| {
            (state == SnapshotState::Failed)
                .then(|| format!("failed to snapshot [{}] shards", failures.len()))
        });

        let info = SnapshotInfo {
            snapshot: entry.snapshot.snapshot_id.clone(),
            state,
            reason,
            indices: entry.indices.iter().map(|i| i.name.clone()).collect(),
            data_streams: entry.data_streams.clone(),
            start_time_ms: entry.start_time_ms,
            end_time_ms: now_ms(),
            total_shards,
            successful_shards: successful,
            shard_failures: failures,
            include_global_state: entry.include_global_state,
        };

        driver
            .finalize_snapshot(
                shard_generations,
                repo_data.gen_id,
                info.clone(),
                entry.repository_meta_version,
            )
            .await
            .map_err(|e| Error::classify(repository, snapshot_name, e))?;
        Ok(info)
    }

    /// Removes a snapshot entry that failed before reaching its repository
    /// loop (clone preparation, legacy initialization).
    pub(crate) fn remove_failed_snapshot(&self, snapshot: Snapshot, error: Error) {
        self.bus.submit_update(
            &format!("remove failed snapshot [{snapshot}]"),
            Box::new(RemoveSnapshotTask {
                service: self.arc(),
                snapshot,
                outcome: Err(error),
                holds_repo_loop: false,
            }),
        );
    }

    /// Continues the repository's serialized loop after a finalization or
    /// deletion: next queued finalization first, else a started deletion,
    /// else release the loop.
    pub(crate) fn run_next_queued_operation(&self, repository: &str) {
        let next = {
            let mut finalizing = self.currently_finalizing.lock().unwrap();
            let mut ongoing = self.ongoing.lock().unwrap();
            if !finalizing.contains(repository) {
                // A cluster-manager failover cleared the loop from under
                // us; whoever is manager now owns the repository.
                return;
            }
            if let Some(snapshot) = ongoing.pop_finalization(repository) {
                Next::Finalize(snapshot)
            } else {
                let state = self.bus.state();
                match state.snapshot_deletions.started_for_repo(repository) {
                    Some(deletion) if !ongoing.is_running_deletion(&deletion.uuid) => {
                        ongoing.mark_deletion_running(deletion.uuid);
                        Next::Delete(deletion.clone())
                    }
                    _ => {
                        finalizing.remove(repository);
                        Next::Idle
                    }
                }
            }
        };
        match next {
            Next::Finalize(snapshot) => {
                let service = self.arc();
                tokio::spawn(async move { service.finalize_snapshot_entry(snapshot).await });
            }
            Next::Delete(deletion) => {
                let service = self.arc();
                tokio::spawn(async move { service.run_deletion(deletion).await });
            }
            Next::Idle => {}
        }
    }
}

struct RemoveSnapshotTask {
    service: Arc<SnapshotsService>,
    snapshot: Snapshot,
    outcome: Result<SnapshotInfo, Error>,
    holds_repo_loop: bool,
}

impl UpdateTask for RemoveSnapshotTask {
    fn execute(&mut self, current: &ClusterState) -> anyhow::Result<ClusterState> {
        let snapshots = current.snapshots.without(&self.snapshot);
        let snapshot_deletions = ready_deletions(&snapshots, &current.snapshot_deletions);
        Ok(ClusterState {
            snapshots,
            snapshot_deletions,
            ..current.clone()
        })
    }

    fn applied(self: Box<Self>, _source: &str, _previous: &ClusterState, _current: &ClusterState) {
        let service = &self.service;
        service.ending_snapshots.lock().unwrap().remove(&self.snapshot);
        service
            .initializing_clones
            .lock()
            .unwrap()
            .remove(&self.snapshot);
        service
            .listeners
            .resolve_completions(&self.snapshot, self.outcome.clone());
        if self.holds_repo_loop {
            service.run_next_queued_operation(&self.snapshot.repository);
        }
    }

    fn on_failure(self: Box<Self>, source: &str, error: anyhow::Error) {
        let error = Error::classify(
            &self.snapshot.repository,
            &self.snapshot.snapshot_id.name,
            error,
        );
        tracing::warn!(%source, %error, "failed to remove snapshot from cluster state");
        let service = &self.service;
        service.ending_snapshots.lock().unwrap().remove(&self.snapshot);
        if error.is_manager_failure() {
            service
                .listeners
                .resolve_completions(&self.snapshot, Err(Error::NotClusterManager));
            service.fail_outstanding_listeners_on_failover();
        } else {
            service
                .listeners
                .resolve_completions(&self.snapshot, Err(error));
            if self.holds_repo_loop {
                service.run_next_queued_operation(&self.snapshot.repository);
            }
        }
    }
}
