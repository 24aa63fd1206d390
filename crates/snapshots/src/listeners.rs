use std::collections::BTreeMap;
use std::sync::Mutex;

use models::Snapshot;
use repository::SnapshotInfo;
use tokio::sync::oneshot;

use crate::Error;

pub(crate) type CompletionSender = oneshot::Sender<Result<SnapshotInfo, Error>>;
pub(crate) type DeletionSender = oneshot::Sender<Result<(), Error>>;

/// Pending completion and deletion callbacks, keyed by the operation they
/// wait on. Delivery is iterate-and-clear under the lock; a dropped
/// receiver is not an error.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    completions: Mutex<BTreeMap<Snapshot, Vec<CompletionSender>>>,
    deletions: Mutex<BTreeMap<uuid::Uuid, Vec<DeletionSender>>>,
}

impl ListenerRegistry {
    pub fn add_completion(&self, snapshot: Snapshot, sender: CompletionSender) {
        self.completions
            .lock()
            .unwrap()
            .entry(snapshot)
            .or_default()
            .push(sender);
    }

    pub fn resolve_completions(&self, snapshot: &Snapshot, result: Result<SnapshotInfo, Error>) {
        let senders = self.completions.lock().unwrap().remove(snapshot);
        for sender in senders.into_iter().flatten() {
            if sender.send(result.clone()).is_err() {
                tracing::debug!(%snapshot, "completion listener dropped");
            }
        }
    }

    /// Fails every completion listener except those of `keep`: snapshots
    /// already finalizing fail through their own publication attempt.
    pub fn fail_completions_except(
        &self,
        keep: &std::collections::BTreeSet<Snapshot>,
        error: Error,
    ) {
        let drained: Vec<(Snapshot, Vec<CompletionSender>)> = {
            let mut completions = self.completions.lock().unwrap();
            let failing: Vec<Snapshot> = completions
                .keys()
                .filter(|s| !keep.contains(s))
                .cloned()
                .collect();
            failing
                .into_iter()
                .map(|s| {
                    let senders = completions.remove(&s).unwrap_or_default();
                    (s, senders)
                })
                .collect()
        };
        for (snapshot, senders) in drained {
            tracing::debug!(%snapshot, %error, "failing completion listeners");
            for sender in senders {
                let _ = sender.send(Err(error.clone()));
            }
        }
    }

    /// Fails every completion listener of one repository.
    pub fn fail_completions_for_repo(&self, repository: &str, error: Error) {
        let drained: Vec<(Snapshot, Vec<CompletionSender>)> = {
            let mut completions = self.completions.lock().unwrap();
            let failing: Vec<Snapshot> = completions
                .keys()
                .filter(|s| s.repository == repository)
                .cloned()
                .collect();
            failing
                .into_iter()
                .map(|s| {
                    let senders = completions.remove(&s).unwrap_or_default();
                    (s, senders)
                })
                .collect()
        };
        for (snapshot, senders) in drained {
            tracing::debug!(%snapshot, %error, "failing completion listeners");
            for sender in senders {
                let _ = sender.send(Err(error.clone()));
            }
        }
    }

    pub fn add_deletion(&self, uuid: uuid::Uuid, sender: DeletionSender) {
        self.deletions
            .lock()
            .unwrap()
            .entry(uuid)
            .or_default()
            .push(sender);
    }

    pub fn resolve_deletions(&self, uuid: &uuid::Uuid, result: Result<(), Error>) {
        let senders = self.deletions.lock().unwrap().remove(uuid);
        for sender in senders.into_iter().flatten() {
            let _ = sender.send(result.clone());
        }
    }

    pub fn fail_all_deletions(&self, error: Error) {
        let drained: Vec<Vec<DeletionSender>> = {
            let mut deletions = self.deletions.lock().unwrap();
            let uuids: Vec<uuid::Uuid> = deletions.keys().cloned().collect();
            uuids
                .into_iter()
                .filter_map(|u| deletions.remove(&u))
                .collect()
        };
        for senders in drained {
            for sender in senders {
                let _ = sender.send(Err(error.clone()));
            }
        }
    }
}
