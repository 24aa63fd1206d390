use std::sync::Arc;

use crate::{ClusterState, DiscoveryNode};

/// Priority of an update task within the serialized state-update queue.
/// Higher priorities are applied first; submission order breaks ties.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal,
    High,
    Urgent,
    Immediate,
}

/// Publication failures surfaced to update tasks. These are terminal for
/// the submitting node: the task must not retry, and the engine reconciles
/// through the next elected cluster-manager instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PublicationError {
    #[error("no longer cluster-manager")]
    NotClusterManager,
    #[error("failed to commit cluster state: {0}")]
    FailedToCommit(String),
}

/// One proposed cluster-state transition.
///
/// `execute` computes the successor state; it runs on the (single) update
/// thread and must not block. Exactly one of `applied`,
/// `on_no_longer_cluster_manager`, or `on_failure` is then invoked,
/// consuming the task.
pub trait UpdateTask: Send + 'static {
    fn priority(&self) -> Priority {
        Priority::Normal
    }

    fn execute(&mut self, current: &ClusterState) -> anyhow::Result<ClusterState>;

    fn applied(self: Box<Self>, source: &str, previous: &ClusterState, current: &ClusterState);

    fn on_failure(self: Box<Self>, source: &str, error: anyhow::Error);

    fn on_no_longer_cluster_manager(self: Box<Self>, source: &str) {
        self.on_failure(source, anyhow::Error::new(PublicationError::NotClusterManager));
    }
}

/// Notification of one applied cluster-state change.
#[derive(Clone, Debug)]
pub struct ClusterChangedEvent {
    pub source: String,
    pub previous: ClusterState,
    pub current: ClusterState,
}

impl ClusterChangedEvent {
    pub fn nodes_removed(&self) -> Vec<&DiscoveryNode> {
        self.previous
            .nodes
            .nodes
            .values()
            .filter(|n| !self.current.nodes.contains(&n.id))
            .collect()
    }

    pub fn routing_changed(&self) -> bool {
        self.previous.routing != self.current.routing
    }

    pub fn local_is_cluster_manager(&self) -> bool {
        self.current.local_is_cluster_manager()
    }

    pub fn previously_cluster_manager(&self) -> bool {
        self.previous.local_is_cluster_manager()
    }
}

/// Observer of applied cluster-state changes.
pub trait ClusterStateApplier: Send + Sync + 'static {
    fn apply_cluster_state(&self, event: &ClusterChangedEvent);
}

/// The serialized cluster-state update queue. Implementations apply
/// submitted tasks one at a time in priority order, publish the result,
/// and notify appliers and then the task itself on success.
pub trait ClusterStateBus: Send + Sync + 'static {
    fn submit_update(&self, source: &str, task: Box<dyn UpdateTask>);

    fn add_applier(&self, applier: Arc<dyn ClusterStateApplier>);

    /// The latest applied state.
    fn state(&self) -> ClusterState;
}
