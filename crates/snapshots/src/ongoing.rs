use std::collections::{BTreeMap, BTreeSet, VecDeque};

use models::Snapshot;

/// Per-repository queues of work the engine has accepted but cannot run
/// yet because the repository's loop is busy, plus the deletions it is
/// currently executing.
#[derive(Default)]
pub(crate) struct OngoingOps {
    pending_finalizations: BTreeMap<String, VecDeque<Snapshot>>,
    running_deletions: BTreeSet<uuid::Uuid>,
}

impl OngoingOps {
    pub fn enqueue_finalization(&mut self, snapshot: Snapshot) {
        let queue = self
            .pending_finalizations
            .entry(snapshot.repository.clone())
            .or_default();
        if !queue.contains(&snapshot) {
            queue.push_back(snapshot);
        }
    }

    pub fn pop_finalization(&mut self, repository: &str) -> Option<Snapshot> {
        let queue = self.pending_finalizations.get_mut(repository)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            self.pending_finalizations.remove(repository);
        }
        next
    }

    pub fn is_running_deletion(&self, uuid: &uuid::Uuid) -> bool {
        self.running_deletions.contains(uuid)
    }

    pub fn mark_deletion_running(&mut self, uuid: uuid::Uuid) -> bool {
        self.running_deletions.insert(uuid)
    }

    pub fn deletion_done(&mut self, uuid: &uuid::Uuid) {
        self.running_deletions.remove(uuid);
    }

    pub fn clear(&mut self) {
        self.pending_finalizations.clear();
        self.running_deletions.clear();
    }
}
