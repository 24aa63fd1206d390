use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use cluster::{
    ClusterChangedEvent, ClusterState, ClusterStateApplier, ClusterStateBus, UpdateTask,
};
use models::{RepositoryShardId, Snapshot};
use repository::{RepositoryDriver, RepositoryRegistry};
use tokio::sync::oneshot;

use crate::listeners::ListenerRegistry;
use crate::ongoing::OngoingOps;
use crate::updates::{apply_shard_updates, ShardSnapshotUpdate};
use crate::{reactive, Error, Settings};

/// The cluster-manager-side snapshot orchestration engine.
///
/// All lifecycle transitions go through cluster-state update tasks, which
/// the bus serializes; the engine itself only keeps transient execution
/// markers. Every mutable set lives on this one object, each behind its
/// own mutex, none held across I/O. The single permitted nested lock
/// order is `currently_finalizing` before `ongoing`.
pub struct SnapshotsService {
    pub(crate) bus: Arc<dyn ClusterStateBus>,
    pub(crate) repositories: Arc<dyn RepositoryRegistry>,
    max_concurrent_operations: AtomicUsize,
    /// Repositories whose finalize/delete loop is currently held.
    pub(crate) currently_finalizing: Mutex<BTreeSet<String>>,
    /// Snapshots handed to finalization (running or queued in `ongoing`).
    pub(crate) ending_snapshots: Mutex<BTreeSet<Snapshot>>,
    /// Legacy-path snapshots between admission and their STARTED
    /// transition.
    pub(crate) initializing_snapshots: Mutex<BTreeSet<Snapshot>>,
    /// Clones between admission and their shard enumeration.
    pub(crate) initializing_clones: Mutex<BTreeSet<Snapshot>>,
    /// Shard clones this node has already dispatched to the repository.
    pub(crate) currently_cloning: Mutex<BTreeSet<(Snapshot, RepositoryShardId)>>,
    pub(crate) ongoing: Mutex<OngoingOps>,
    pub(crate) listeners: ListenerRegistry,
    pending_updates: Mutex<PendingUpdates>,
    weak: Weak<SnapshotsService>,
}

#[derive(Default)]
struct PendingUpdates {
    queue: Vec<PendingUpdate>,
    task_queued: bool,
}

pub(crate) struct PendingUpdate {
    pub update: ShardSnapshotUpdate,
    pub ack: oneshot::Sender<Result<(), Error>>,
}

impl SnapshotsService {
    pub fn new(
        bus: Arc<dyn ClusterStateBus>,
        repositories: Arc<dyn RepositoryRegistry>,
        settings: Settings,
    ) -> Arc<Self> {
        let service = Arc::new_cyclic(|weak| SnapshotsService {
            bus: bus.clone(),
            repositories,
            max_concurrent_operations: AtomicUsize::new(settings.max_concurrent_operations.max(1)),
            currently_finalizing: Default::default(),
            ending_snapshots: Default::default(),
            initializing_snapshots: Default::default(),
            initializing_clones: Default::default(),
            currently_cloning: Default::default(),
            ongoing: Default::default(),
            listeners: Default::default(),
            pending_updates: Default::default(),
            weak: weak.clone(),
        });
        bus.add_applier(service.clone());
        service
    }

    pub(crate) fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("service is alive")
    }

    /// Dynamic update of `snapshot.max_concurrent_operations`.
    pub fn set_max_concurrent_operations(&self, limit: usize) -> anyhow::Result<()> {
        anyhow::ensure!(limit >= 1, "max_concurrent_operations must be at least 1");
        self.max_concurrent_operations.store(limit, Ordering::SeqCst);
        tracing::info!(limit, "updated snapshot.max_concurrent_operations");
        Ok(())
    }

    pub fn max_concurrent_operations(&self) -> usize {
        self.max_concurrent_operations.load(Ordering::SeqCst)
    }

    /// Admission bound over everything in flight, snapshots and deletions
    /// alike.
    pub(crate) fn ensure_below_concurrency_limit(
        &self,
        state: &ClusterState,
        repository: &str,
        name: &str,
    ) -> Result<(), Error> {
        let in_progress =
            state.snapshots.entries.len() + state.snapshot_deletions.entries.len();
        let limit = self.max_concurrent_operations();
        if in_progress >= limit {
            return Err(Error::concurrent(
                repository,
                name,
                format!(
                    "already running [{in_progress}] operations and \
                     [snapshot.max_concurrent_operations] is set to [{limit}]"
                ),
            ));
        }
        Ok(())
    }

    pub(crate) fn driver(&self, repository: &str) -> Result<Arc<dyn RepositoryDriver>, Error> {
        Ok(self.repositories.repository(repository)?)
    }

    /// Entry point for shard-status reports from data nodes and the local
    /// clone runner. Reports are batched: many may fold into one state
    /// transition. Resolves once the report is reflected in applied state.
    pub async fn update_shard_state(&self, update: ShardSnapshotUpdate) -> Result<(), Error> {
        let (ack, rx) = oneshot::channel();
        let submit = {
            let mut pending = self.pending_updates.lock().unwrap();
            pending.queue.push(PendingUpdate { update, ack });
            !std::mem::replace(&mut pending.task_queued, true)
        };
        if submit {
            self.bus.submit_update(
                "update snapshot state",
                Box::new(ShardUpdatesTask {
                    service: self.arc(),
                    batch: Vec::new(),
                }),
            );
        }
        rx.await.unwrap_or(Err(Error::NotClusterManager))
    }

    fn take_pending_updates(&self) -> Vec<PendingUpdate> {
        let mut pending = self.pending_updates.lock().unwrap();
        pending.task_queued = false;
        std::mem::take(&mut pending.queue)
    }

    /// Cluster-manager loss: this node must not write any further state.
    /// Fail everything waiting locally — except snapshots already
    /// finalizing, which fail through their own publication attempt — and
    /// drop the execution markers. The next elected cluster-manager
    /// reconciles from cluster state alone.
    pub(crate) fn fail_outstanding_listeners_on_failover(&self) {
        tracing::warn!("no longer cluster-manager; failing outstanding snapshot listeners");
        let ending = self.ending_snapshots.lock().unwrap().clone();
        self.listeners
            .fail_completions_except(&ending, Error::NotClusterManager);
        self.listeners.fail_all_deletions(Error::NotClusterManager);
        self.ongoing.lock().unwrap().clear();
        self.initializing_snapshots.lock().unwrap().clear();
        self.initializing_clones.lock().unwrap().clear();
        self.currently_cloning.lock().unwrap().clear();
        self.currently_finalizing.lock().unwrap().clear();
        for pending in self.take_pending_updates() {
            let _ = pending.ack.send(Err(Error::NotClusterManager));
        }
    }

    /// Reports an invariant violation. Debug builds crash; release builds
    /// log and fail the repository's waiters rather than wedging them.
    pub(crate) fn invariant_violation(&self, repository: &str, detail: &str) {
        debug_assert!(false, "invariant violation in [{repository}]: {detail}");
        tracing::error!(repository, detail, "snapshot state invariant violation");
        self.listeners.fail_completions_for_repo(
            repository,
            Error::Repository {
                repository: repository.to_string(),
                reason: format!("internal snapshot state error: {detail}"),
            },
        );
    }
}

impl ClusterStateApplier for SnapshotsService {
    fn apply_cluster_state(&self, event: &ClusterChangedEvent) {
        if !event.local_is_cluster_manager() {
            if event.previously_cluster_manager() {
                self.fail_outstanding_listeners_on_failover();
            }
            return;
        }

        if reactive::needs_update(event) {
            self.bus.submit_update(
                "update snapshot state after node or routing changes",
                Box::new(reactive::ExternalChangesTask {
                    service: self.arc(),
                }),
            );
        }

        // Pick up whatever this state makes runnable. Each of these is
        // idempotent against its marker set, so re-running them on every
        // applied state is safe and is what lets a fresh cluster-manager
        // adopt work started by its predecessor.
        let service = self.arc();
        service.end_completed_snapshots(&event.current);
        service.maybe_start_deletions(&event.current);
        service.run_ready_clone_operations(&event.current);
    }
}

struct ShardUpdatesTask {
    service: Arc<SnapshotsService>,
    batch: Vec<PendingUpdate>,
}

impl UpdateTask for ShardUpdatesTask {
    fn execute(&mut self, current: &ClusterState) -> anyhow::Result<ClusterState> {
        self.batch = self.service.take_pending_updates();
        let updates: Vec<ShardSnapshotUpdate> =
            self.batch.iter().map(|p| p.update.clone()).collect();
        let local_node = current.nodes.local_node_id.clone();
        let outcome = apply_shard_updates(
            &current.snapshots,
            &current.routing,
            local_node.as_ref(),
            &updates,
        );
        tracing::debug!(
            batch = updates.len(),
            executed = outcome.executed,
            "processed shard snapshot updates"
        );
        Ok(ClusterState {
            snapshots: outcome.snapshots,
            ..current.clone()
        })
    }

    fn applied(self: Box<Self>, _source: &str, _previous: &ClusterState, _current: &ClusterState) {
        let Self { service, batch } = *self;
        for pending in batch {
            if let models::EntryShardKey::Repository(repo_shard) = &pending.update.key {
                // A terminal clone report frees this node's runner slot.
                if pending.update.status.state.completed() {
                    service.currently_cloning.lock().unwrap().remove(&(
                        pending.update.snapshot.clone(),
                        repo_shard.clone(),
                    ));
                }
            }
            let _ = pending.ack.send(Ok(()));
        }
    }

    fn on_failure(self: Box<Self>, source: &str, error: anyhow::Error) {
        let Self { service, batch } = *self;
        let error = Error::classify("_cluster", "_shard_updates", error);
        tracing::warn!(%source, %error, "failed to apply shard snapshot updates");
        if error.is_manager_failure() {
            service.fail_outstanding_listeners_on_failover();
        }
        for pending in batch {
            let _ = pending.ack.send(Err(error.clone()));
        }
    }
}
