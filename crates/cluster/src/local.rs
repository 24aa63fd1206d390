use std::sync::{Arc, Mutex};

use crate::{
    ClusterChangedEvent, ClusterState, ClusterStateApplier, ClusterStateBus, Priority,
    PublicationError, UpdateTask,
};

/// A deterministic, in-process `ClusterStateBus`.
///
/// Tasks are applied one at a time in priority order. Callbacks run on the
/// submitting thread; a callback that submits further updates only grows
/// the queue, which the outermost `drain` keeps pumping, so recursion
/// depth stays bounded and application order stays deterministic.
///
/// This is scaffolding for tests and single-process embeddings; the
/// replicated bus of a real cluster lives behind the same trait.
pub struct LocalBus {
    inner: Mutex<Inner>,
    appliers: Mutex<Vec<Arc<dyn ClusterStateApplier>>>,
}

struct Inner {
    state: ClusterState,
    queue: Vec<Queued>,
    draining: bool,
    seq: u64,
    // (source substring, error) pairs; the first task whose source matches
    // consumes the injected publication failure.
    fail_matching: Vec<(String, PublicationError)>,
}

struct Queued {
    seq: u64,
    source: String,
    priority: Priority,
    task: Box<dyn UpdateTask>,
    // External transitions model state replicated from elsewhere (another
    // manager's publication); they apply regardless of whether the local
    // node is currently the cluster-manager.
    external: bool,
}

impl LocalBus {
    pub fn new(initial: ClusterState) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: initial,
                queue: Vec::new(),
                draining: false,
                seq: 0,
                fail_matching: Vec::new(),
            }),
            appliers: Mutex::new(Vec::new()),
        })
    }

    /// Injects a publication failure into the next submitted task whose
    /// source contains `source_substr`.
    pub fn fail_next_publication_matching(
        &self,
        source_substr: impl Into<String>,
        error: PublicationError,
    ) {
        self.inner
            .lock()
            .unwrap()
            .fail_matching
            .push((source_substr.into(), error));
    }

    /// Applies an arbitrary state transition, for tests that play the role
    /// of other cluster components (node joins/leaves, routing changes).
    pub fn mutate<F>(&self, source: &str, f: F)
    where
        F: FnOnce(&ClusterState) -> ClusterState + Send + 'static,
    {
        struct Closure<F>(Option<F>);
        impl<F> UpdateTask for Closure<F>
        where
            F: FnOnce(&ClusterState) -> ClusterState + Send + 'static,
        {
            fn execute(&mut self, current: &ClusterState) -> anyhow::Result<ClusterState> {
                let f = self.0.take().expect("executed once");
                Ok(f(current))
            }
            fn applied(self: Box<Self>, _: &str, _: &ClusterState, _: &ClusterState) {}
            fn on_failure(self: Box<Self>, source: &str, error: anyhow::Error) {
                tracing::warn!(%source, %error, "state mutation failed");
            }
        }
        self.submit_inner(source, Box::new(Closure(Some(f))), true);
    }

    fn submit_inner(&self, source: &str, task: Box<dyn UpdateTask>, external: bool) {
        let run = {
            let mut inner = self.inner.lock().unwrap();
            inner.seq += 1;
            let queued = Queued {
                seq: inner.seq,
                source: source.to_string(),
                priority: task.priority(),
                task,
                external,
            };
            inner.queue.push(queued);
            if inner.draining {
                false
            } else {
                inner.draining = true;
                true
            }
        };
        if run {
            self.drain();
        }
    }

    fn drain(&self) {
        loop {
            // Pick the highest-priority, oldest task, and snapshot what we
            // need while holding the lock; all callbacks run outside it.
            let (source, mut task, state, injected, external) = {
                let mut inner = self.inner.lock().unwrap();
                let Some(best) = inner
                    .queue
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, q)| (q.priority, std::cmp::Reverse(q.seq)))
                    .map(|(i, _)| i)
                else {
                    inner.draining = false;
                    return;
                };
                let queued = inner.queue.remove(best);
                let injected = inner
                    .fail_matching
                    .iter()
                    .position(|(substr, _)| queued.source.contains(substr.as_str()))
                    .map(|i| inner.fail_matching.remove(i).1);
                (
                    queued.source,
                    queued.task,
                    inner.state.clone(),
                    injected,
                    queued.external,
                )
            };

            if !external && !state.local_is_cluster_manager() {
                task.on_no_longer_cluster_manager(&source);
                continue;
            }

            let next = match task.execute(&state) {
                Ok(next) => next,
                Err(error) => {
                    task.on_failure(&source, error);
                    continue;
                }
            };

            if next == state {
                // Nothing to publish.
                task.applied(&source, &state, &state);
                continue;
            }

            match injected {
                Some(PublicationError::NotClusterManager) => {
                    task.on_no_longer_cluster_manager(&source);
                    continue;
                }
                Some(error @ PublicationError::FailedToCommit(_)) => {
                    task.on_failure(&source, anyhow::Error::new(error));
                    continue;
                }
                None => {}
            }

            let mut current = next;
            current.version = state.version + 1;
            self.inner.lock().unwrap().state = current.clone();

            tracing::debug!(%source, version = current.version, "applied cluster state");

            let event = ClusterChangedEvent {
                source: source.clone(),
                previous: state,
                current: current.clone(),
            };
            let appliers = self.appliers.lock().unwrap().clone();
            for applier in appliers {
                applier.apply_cluster_state(&event);
            }
            task.applied(&source, &event.previous, &event.current);
        }
    }
}

impl ClusterStateBus for LocalBus {
    fn submit_update(&self, source: &str, task: Box<dyn UpdateTask>) {
        self.submit_inner(source, task, false);
    }

    fn add_applier(&self, applier: Arc<dyn ClusterStateApplier>) {
        self.appliers.lock().unwrap().push(applier);
    }

    fn state(&self) -> ClusterState {
        self.inner.lock().unwrap().state.clone()
    }
}
