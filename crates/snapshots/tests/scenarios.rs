use std::sync::Arc;

use cluster::{ClusterState, ClusterStateBus, LocalBus, PublicationError, ShardRoutingState};
use models::{
    DeletionState, EntryShardKey, NodeId, ShardGeneration, ShardId, ShardSnapshotStatus,
    ShardState, Snapshot, SnapshotId, SnapshotState, Version,
};
use repository::SnapshotInfo;
use snapshots::testing::{eventually, MockRegistry, MockRepository, StateBuilder};
use snapshots::{
    CloneSnapshotRequest, CreateSnapshotRequest, DeleteSnapshotsRequest, Error,
    ShardSnapshotUpdate, SnapshotsService,
};

fn fixture(
    state: ClusterState,
    repositories: Vec<Arc<MockRepository>>,
    settings: snapshots::Settings,
) -> (Arc<LocalBus>, Arc<SnapshotsService>) {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("snapshots=debug")
        .try_init();
    let bus = LocalBus::new(state);
    let registry = MockRegistry::with(repositories);
    let service = SnapshotsService::new(bus.clone(), registry, settings);
    (bus, service)
}

fn two_shard_state() -> ClusterState {
    StateBuilder::new("m")
        .node("n1", Version::CURRENT)
        .node("n2", Version::CURRENT)
        .repository("repo")
        .index(
            "idx",
            &[
                ("n1", ShardRoutingState::Started),
                ("n2", ShardRoutingState::Started),
            ],
        )
        .build()
}

fn create_request(name: &str) -> CreateSnapshotRequest {
    CreateSnapshotRequest {
        repository: "repo".to_string(),
        snapshot: name.to_string(),
        indices: vec!["idx".to_string()],
        include_global_state: true,
        partial: false,
        user_metadata: None,
    }
}

fn in_progress_snapshot(bus: &LocalBus, name: &str) -> Option<Snapshot> {
    bus.state()
        .snapshots
        .entries
        .iter()
        .find(|e| e.snapshot.snapshot_id.name == name)
        .map(|e| e.snapshot.clone())
}

async fn report(
    service: &Arc<SnapshotsService>,
    snapshot: &Snapshot,
    shard: u32,
    status: ShardSnapshotStatus,
) -> Result<(), Error> {
    service
        .update_shard_state(ShardSnapshotUpdate {
            snapshot: snapshot.clone(),
            key: EntryShardKey::Routing(ShardId::new("idx", shard)),
            status,
        })
        .await
}

fn success_on(node: &str, generation: &str) -> ShardSnapshotStatus {
    ShardSnapshotStatus::success(
        NodeId::new(node),
        Some(ShardGeneration::new(generation)),
    )
}

// S1: a snapshot of one index with two started primaries runs to SUCCESS
// and is finalized into the repository.
#[tokio::test]
async fn successful_snapshot_of_two_shards() {
    let repo = MockRepository::new("repo");
    let (bus, service) = fixture(
        two_shard_state(),
        vec![repo.clone()],
        snapshots::Settings::default(),
    );

    let exec = {
        let service = service.clone();
        tokio::spawn(async move { service.execute_snapshot(create_request("s1")).await })
    };
    eventually(|| in_progress_snapshot(&bus, "s1").is_some()).await;

    let snapshot = in_progress_snapshot(&bus, "s1").unwrap();
    {
        let state = bus.state();
        let entry = state.snapshots.get(&snapshot).unwrap();
        assert_eq!(entry.state, SnapshotState::Started);
        assert_eq!(entry.shards.len(), 2);
        assert_eq!(entry.shards[&ShardId::new("idx", 0)].state, ShardState::Init);
        assert_eq!(
            entry.shards[&ShardId::new("idx", 0)]
                .node_id
                .as_ref()
                .unwrap()
                .as_str(),
            "n1"
        );
        assert_eq!(
            entry.shards[&ShardId::new("idx", 1)]
                .node_id
                .as_ref()
                .unwrap()
                .as_str(),
            "n2"
        );
    }

    report(&service, &snapshot, 0, success_on("n1", "g0"))
        .await
        .unwrap();
    report(&service, &snapshot, 1, success_on("n2", "g1"))
        .await
        .unwrap();

    let info: SnapshotInfo = exec.await.unwrap().unwrap();
    assert_eq!(info.state, SnapshotState::Success);
    assert_eq!(info.total_shards, 2);
    assert_eq!(info.successful_shards, 2);
    assert!(info.shard_failures.is_empty());

    // The entry is gone from cluster state and durable in the repository.
    assert!(bus.state().snapshots.is_empty());
    assert!(repo.data().has_snapshot_name("s1"));
    assert_eq!(repo.data().gen_id, 1);
}

// S2: deleting an in-flight snapshot aborts its shards; once data nodes
// acknowledge, the entry finalizes, the deletion starts, and the original
// create fails as aborted.
#[tokio::test]
async fn delete_aborts_running_snapshot() {
    let repo = MockRepository::new("repo");
    let (bus, service) = fixture(
        two_shard_state(),
        vec![repo.clone()],
        snapshots::Settings::default(),
    );

    let exec = {
        let service = service.clone();
        tokio::spawn(async move { service.execute_snapshot(create_request("s1")).await })
    };
    eventually(|| in_progress_snapshot(&bus, "s1").is_some()).await;
    let snapshot = in_progress_snapshot(&bus, "s1").unwrap();

    let delete = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .delete_snapshots(DeleteSnapshotsRequest {
                    repository: "repo".to_string(),
                    snapshots: vec!["s1".to_string()],
                })
                .await
        })
    };
    eventually(|| {
        bus.state()
            .snapshots
            .get(&snapshot)
            .is_some_and(|e| e.state == SnapshotState::Aborted)
    })
    .await;
    {
        let state = bus.state();
        let entry = state.snapshots.get(&snapshot).unwrap();
        assert!(entry
            .shards
            .values()
            .all(|s| s.state == ShardState::Aborted));
        // The deletion waits for the aborted entry to leave the state.
        assert_eq!(
            state.snapshot_deletions.entries[0].state,
            DeletionState::Waiting
        );
    }

    // Data nodes acknowledge the abort.
    for shard in [0, 1] {
        report(
            &service,
            &snapshot,
            shard,
            ShardSnapshotStatus::failed(
                Some(NodeId::new(if shard == 0 { "n1" } else { "n2" })),
                "aborted",
                None,
            ),
        )
        .await
        .unwrap();
    }

    delete.await.unwrap().unwrap();
    let err = exec.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("aborted"), "{err}");

    let state = bus.state();
    assert!(state.snapshots.is_empty());
    assert!(state.snapshot_deletions.is_empty());
    assert!(!repo.data().has_snapshot_name("s1"));
}

// S3: losing a data node mid-snapshot fails its shard; a partial snapshot
// still completes successfully, a non-partial one fails.
#[tokio::test]
async fn node_loss_fails_shard() {
    let repo = MockRepository::new("repo");
    let (bus, service) = fixture(
        two_shard_state(),
        vec![repo.clone()],
        snapshots::Settings::default(),
    );

    let mut request = create_request("s1");
    request.partial = true;
    let exec = {
        let service = service.clone();
        tokio::spawn(async move { service.execute_snapshot(request).await })
    };
    eventually(|| in_progress_snapshot(&bus, "s1").is_some()).await;
    let snapshot = in_progress_snapshot(&bus, "s1").unwrap();

    report(&service, &snapshot, 0, success_on("n1", "g0"))
        .await
        .unwrap();

    // n2 drops out of the cluster.
    bus.mutate("node-left", |state| {
        let mut state = state.clone();
        state.nodes.nodes.remove(&NodeId::new("n2"));
        state
    });

    let info = exec.await.unwrap().unwrap();
    assert_eq!(info.state, SnapshotState::Success);
    assert_eq!(info.total_shards, 2);
    assert_eq!(info.successful_shards, 1);
    assert_eq!(info.shard_failures.len(), 1);
    assert_eq!(info.shard_failures[0].reason, "node shutdown");
}

#[tokio::test]
async fn node_loss_fails_non_partial_snapshot() {
    let repo = MockRepository::new("repo");
    let (bus, service) = fixture(
        two_shard_state(),
        vec![repo.clone()],
        snapshots::Settings::default(),
    );

    let exec = {
        let service = service.clone();
        tokio::spawn(async move { service.execute_snapshot(create_request("s1")).await })
    };
    eventually(|| in_progress_snapshot(&bus, "s1").is_some()).await;

    bus.mutate("node-left", |state| {
        let mut state = state.clone();
        state.nodes.nodes.remove(&NodeId::new("n2"));
        state
    });
    let snapshot = in_progress_snapshot(&bus, "s1").unwrap();
    report(&service, &snapshot, 0, success_on("n1", "g0"))
        .await
        .unwrap();

    let err = exec.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("failed to snapshot"), "{err}");
}

// S4: a second snapshot covering a held shard queues behind the first and
// is promoted onto the releasing node when the holder finishes.
#[tokio::test]
async fn queued_shard_is_promoted_after_release() {
    let state = StateBuilder::new("m")
        .node("n1", Version::CURRENT)
        .repository("repo")
        .index("idx", &[("n1", ShardRoutingState::Started)])
        .build();
    let repo = MockRepository::new("repo");
    let (bus, service) = fixture(state, vec![repo.clone()], snapshots::Settings::default());

    let exec1 = {
        let service = service.clone();
        tokio::spawn(async move { service.execute_snapshot(create_request("s1")).await })
    };
    eventually(|| in_progress_snapshot(&bus, "s1").is_some()).await;
    let first = in_progress_snapshot(&bus, "s1").unwrap();

    let exec2 = {
        let service = service.clone();
        tokio::spawn(async move { service.execute_snapshot(create_request("s2")).await })
    };
    eventually(|| in_progress_snapshot(&bus, "s2").is_some()).await;
    let second = in_progress_snapshot(&bus, "s2").unwrap();

    {
        let state = bus.state();
        let entry = state.snapshots.get(&second).unwrap();
        assert!(entry.shards[&ShardId::new("idx", 0)].is_unassigned_queued());
    }

    report(&service, &first, 0, success_on("n1", "g1"))
        .await
        .unwrap();
    exec1.await.unwrap().unwrap();

    // The released shard was handed to s2, starting from the generation
    // s1 just wrote.
    eventually(|| {
        bus.state()
            .snapshots
            .get(&second)
            .is_some_and(|e| e.shards[&ShardId::new("idx", 0)].state == ShardState::Init)
    })
    .await;
    {
        let state = bus.state();
        let status = &state.snapshots.get(&second).unwrap().shards[&ShardId::new("idx", 0)];
        assert_eq!(status.node_id.as_ref().unwrap().as_str(), "n1");
        assert_eq!(status.generation.as_ref().unwrap().as_str(), "g1");
    }

    report(&service, &second, 0, success_on("n1", "g2"))
        .await
        .unwrap();
    exec2.await.unwrap().unwrap();

    // Finalizations happened in admission order with a strictly
    // increasing repository generation.
    let data = repo.data();
    assert_eq!(data.gen_id, 2);
    assert!(data.has_snapshot_name("s1") && data.has_snapshot_name("s2"));
}

// S5: a publication failure while removing the finalized entry fails the
// local listeners; the entry survives in cluster state and a re-elected
// cluster-manager finishes the job.
#[tokio::test]
async fn manager_loss_during_finalization() {
    let repo = MockRepository::new("repo");
    let (bus, service) = fixture(
        two_shard_state(),
        vec![repo.clone()],
        snapshots::Settings::default(),
    );

    let exec = {
        let service = service.clone();
        tokio::spawn(async move { service.execute_snapshot(create_request("s1")).await })
    };
    eventually(|| in_progress_snapshot(&bus, "s1").is_some()).await;
    let snapshot = in_progress_snapshot(&bus, "s1").unwrap();

    bus.fail_next_publication_matching(
        "remove snapshot metadata",
        PublicationError::NotClusterManager,
    );
    report(&service, &snapshot, 0, success_on("n1", "g0"))
        .await
        .unwrap();
    report(&service, &snapshot, 1, success_on("n2", "g1"))
        .await
        .unwrap();

    let err = exec.await.unwrap().unwrap_err();
    assert_eq!(err, Error::NotClusterManager);
    // The write itself happened; only the entry removal failed.
    assert!(bus.state().snapshots.get(&snapshot).is_some());
    assert!(repo.data().has_snapshot_name("s1"));

    // Another node is elected, then the local node is re-elected and
    // reconciles the leftover completed entry.
    bus.mutate("manager-away", |state| {
        let mut state = state.clone();
        state.nodes.cluster_manager_id = Some(NodeId::new("n1"));
        state
    });
    bus.mutate("manager-back", |state| {
        let mut state = state.clone();
        state.nodes.cluster_manager_id = Some(NodeId::new("m"));
        state
    });

    eventually(|| bus.state().snapshots.is_empty()).await;
    // The re-run finalization found the snapshot already written and the
    // repository generation advanced only once more.
    assert!(repo.data().has_snapshot_name("s1"));
}

// S6: the dynamic concurrency limit bounds snapshots and deletions alike.
#[tokio::test]
async fn concurrency_limit_rejects_third_operation() {
    let repo = MockRepository::new("repo");
    let (bus, service) = fixture(
        two_shard_state(),
        vec![repo.clone()],
        snapshots::Settings {
            max_concurrent_operations: 2,
        },
    );

    service.create_snapshot(create_request("s1")).await.unwrap();
    service.create_snapshot(create_request("s2")).await.unwrap();
    let err = service
        .create_snapshot(create_request("s3"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::ConcurrentSnapshotExecution { .. }),
        "{err}"
    );
    assert_eq!(bus.state().snapshots.entries.len(), 2);
}

#[tokio::test]
async fn empty_snapshot_succeeds_immediately() {
    let repo = MockRepository::new("repo");
    let (_bus, service) = fixture(
        two_shard_state(),
        vec![repo.clone()],
        snapshots::Settings::default(),
    );

    let mut request = create_request("empty");
    request.indices = vec!["matches-nothing-*".to_string()];
    let info = service.execute_snapshot(request).await.unwrap();
    assert_eq!(info.state, SnapshotState::Success);
    assert_eq!(info.total_shards, 0);
    assert!(repo.data().has_snapshot_name("empty"));
}

#[tokio::test]
async fn non_partial_snapshot_of_unallocated_shard_is_rejected() {
    let state = StateBuilder::new("m")
        .node("n1", Version::CURRENT)
        .repository("repo")
        .index("idx", &[("n1", ShardRoutingState::Unassigned)])
        .build();
    let repo = MockRepository::new("repo");
    let (bus, service) = fixture(state, vec![repo], snapshots::Settings::default());

    let err = service
        .create_snapshot(create_request("s1"))
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("don't have primary shards"),
        "{err}"
    );
    assert!(bus.state().snapshots.is_empty());
}

#[tokio::test]
async fn delete_matching_nothing_resolves_immediately() {
    let repo = MockRepository::new("repo");
    let (_bus, service) = fixture(
        two_shard_state(),
        vec![repo],
        snapshots::Settings::default(),
    );

    service
        .delete_snapshots(DeleteSnapshotsRequest {
            repository: "repo".to_string(),
            snapshots: vec!["no-such-*".to_string()],
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn invalid_names_and_missing_repositories_are_rejected() {
    let repo = MockRepository::new("repo");
    let (_bus, service) = fixture(
        two_shard_state(),
        vec![repo],
        snapshots::Settings::default(),
    );

    let err = service
        .create_snapshot(create_request("_bad"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSnapshotName { .. }), "{err}");

    let mut request = create_request("ok");
    request.repository = "nowhere".to_string();
    let err = service.create_snapshot(request).await.unwrap_err();
    assert_eq!(err, Error::RepositoryMissing("nowhere".to_string()));
}

#[tokio::test]
async fn duplicate_names_are_rejected() {
    let repo = MockRepository::new("repo");
    let (bus, service) = fixture(
        two_shard_state(),
        vec![repo],
        snapshots::Settings::default(),
    );

    service.create_snapshot(create_request("s1")).await.unwrap();
    let err = service
        .create_snapshot(create_request("s1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSnapshotName { .. }), "{err}");
    assert_eq!(bus.state().snapshots.entries.len(), 1);
}

// Two deletes of the same repository merge into one waiting deletion
// while a snapshot still writes; both resolve once it runs.
#[tokio::test]
async fn deletes_merge_into_waiting_deletion() {
    let source_index = models::IndexId::new("idx", uuid::Uuid::from_u128(40));
    let old = SnapshotId::new("old", uuid::Uuid::from_u128(41));
    let repo = MockRepository::new("repo");
    repo.seed_snapshot(
        &old,
        &[(source_index, 2)],
        SnapshotInfo {
            snapshot: old.clone(),
            state: SnapshotState::Success,
            reason: None,
            indices: vec!["idx".to_string()],
            data_streams: Vec::new(),
            start_time_ms: 0,
            end_time_ms: 1,
            total_shards: 2,
            successful_shards: 2,
            shard_failures: Vec::new(),
            include_global_state: true,
        },
    );
    let (bus, service) = fixture(
        two_shard_state(),
        vec![repo.clone()],
        snapshots::Settings::default(),
    );

    // A running snapshot holds the repository.
    let exec = {
        let service = service.clone();
        tokio::spawn(async move { service.execute_snapshot(create_request("s1")).await })
    };
    eventually(|| in_progress_snapshot(&bus, "s1").is_some()).await;
    let snapshot = in_progress_snapshot(&bus, "s1").unwrap();

    let delete1 = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .delete_snapshots(DeleteSnapshotsRequest {
                    repository: "repo".to_string(),
                    snapshots: vec!["old".to_string()],
                })
                .await
        })
    };
    eventually(|| !bus.state().snapshot_deletions.is_empty()).await;
    assert_eq!(
        bus.state().snapshot_deletions.entries[0].state,
        DeletionState::Waiting
    );

    let delete2 = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .delete_snapshots(DeleteSnapshotsRequest {
                    repository: "repo".to_string(),
                    snapshots: vec!["old".to_string()],
                })
                .await
        })
    };
    eventually(|| bus.state().snapshot_deletions.entries.len() == 1).await;

    report(&service, &snapshot, 0, success_on("n1", "g0"))
        .await
        .unwrap();
    report(&service, &snapshot, 1, success_on("n2", "g1"))
        .await
        .unwrap();
    exec.await.unwrap().unwrap();

    delete1.await.unwrap().unwrap();
    delete2.await.unwrap().unwrap();
    assert!(!repo.data().has_snapshot_name("old"));
    assert!(repo.data().has_snapshot_name("s1"));
    assert!(bus.state().snapshot_deletions.is_empty());
}

// A snapshot admitted while a deletion runs queues all shards; finishing
// the deletion starts them via the removal task.
#[tokio::test]
async fn snapshot_queues_behind_running_deletion() {
    let source_index = models::IndexId::new("idx", uuid::Uuid::from_u128(50));
    let old = SnapshotId::new("old", uuid::Uuid::from_u128(51));
    let repo = MockRepository::new("repo");
    repo.seed_snapshot(
        &old,
        &[(source_index, 1)],
        SnapshotInfo {
            snapshot: old.clone(),
            state: SnapshotState::Success,
            reason: None,
            indices: vec!["idx".to_string()],
            data_streams: Vec::new(),
            start_time_ms: 0,
            end_time_ms: 1,
            total_shards: 1,
            successful_shards: 1,
            shard_failures: Vec::new(),
            include_global_state: true,
        },
    );
    let state = StateBuilder::new("m")
        .node("n1", Version::CURRENT)
        .repository("repo")
        .index("idx", &[("n1", ShardRoutingState::Started)])
        .build();
    let gate = repo.gate_next_delete();
    let (bus, service) = fixture(state, vec![repo.clone()], snapshots::Settings::default());

    let delete = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .delete_snapshots(DeleteSnapshotsRequest {
                    repository: "repo".to_string(),
                    snapshots: vec!["old".to_string()],
                })
                .await
        })
    };
    eventually(|| {
        bus.state()
            .snapshot_deletions
            .started_for_repo("repo")
            .is_some()
    })
    .await;

    let exec = {
        let service = service.clone();
        tokio::spawn(async move { service.execute_snapshot(create_request("s1")).await })
    };
    eventually(|| in_progress_snapshot(&bus, "s1").is_some()).await;
    let snapshot = in_progress_snapshot(&bus, "s1").unwrap();
    assert!(bus.state().snapshots.get(&snapshot).unwrap().shards[&ShardId::new("idx", 0)]
        .is_unassigned_queued());

    // Let the repository-side delete finish.
    gate.send(()).unwrap();
    delete.await.unwrap().unwrap();

    eventually(|| {
        bus.state()
            .snapshots
            .get(&snapshot)
            .is_some_and(|e| e.shards[&ShardId::new("idx", 0)].state == ShardState::Init)
    })
    .await;

    report(&service, &snapshot, 0, success_on("n1", "g0"))
        .await
        .unwrap();
    exec.await.unwrap().unwrap();
    assert!(repo.data().has_snapshot_name("s1"));
    assert!(!repo.data().has_snapshot_name("old"));
}

// Cloning copies shards repository-side on the cluster-manager without
// touching data nodes.
#[tokio::test]
async fn clone_snapshot_runs_to_completion() {
    let source_index = models::IndexId::new("idx", uuid::Uuid::from_u128(60));
    let source = SnapshotId::new("src", uuid::Uuid::from_u128(61));
    let repo = MockRepository::new("repo");
    repo.seed_snapshot(
        &source,
        &[(source_index, 2)],
        SnapshotInfo {
            snapshot: source.clone(),
            state: SnapshotState::Success,
            reason: None,
            indices: vec!["idx".to_string()],
            data_streams: Vec::new(),
            start_time_ms: 0,
            end_time_ms: 1,
            total_shards: 2,
            successful_shards: 2,
            shard_failures: Vec::new(),
            include_global_state: true,
        },
    );
    let (bus, service) = fixture(
        two_shard_state(),
        vec![repo.clone()],
        snapshots::Settings::default(),
    );

    service
        .clone_snapshot(CloneSnapshotRequest {
            repository: "repo".to_string(),
            source: "src".to_string(),
            target: "copy".to_string(),
            indices: vec!["*".to_string()],
        })
        .await
        .unwrap();

    assert!(bus.state().snapshots.is_empty());
    let data = repo.data();
    assert!(data.has_snapshot_name("copy"));
    let copy_info = repo
        .snapshot_info(data.snapshot_by_name("copy").unwrap())
        .unwrap();
    assert_eq!(copy_info.total_shards, 2);
    assert_eq!(copy_info.successful_shards, 2);
}

#[tokio::test]
async fn clone_of_missing_or_deleting_source_is_rejected() {
    let source_index = models::IndexId::new("idx", uuid::Uuid::from_u128(70));
    let source = SnapshotId::new("src", uuid::Uuid::from_u128(71));
    let repo = MockRepository::new("repo");
    repo.seed_snapshot(
        &source,
        &[(source_index, 1)],
        SnapshotInfo {
            snapshot: source.clone(),
            state: SnapshotState::Success,
            reason: None,
            indices: vec!["idx".to_string()],
            data_streams: Vec::new(),
            start_time_ms: 0,
            end_time_ms: 1,
            total_shards: 1,
            successful_shards: 1,
            shard_failures: Vec::new(),
            include_global_state: true,
        },
    );
    let (bus, service) = fixture(
        two_shard_state(),
        vec![repo.clone()],
        snapshots::Settings::default(),
    );

    let err = service
        .clone_snapshot(CloneSnapshotRequest {
            repository: "repo".to_string(),
            source: "nope".to_string(),
            target: "copy".to_string(),
            indices: vec!["*".to_string()],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SnapshotMissing { .. }), "{err}");

    // Hold the repository with a running snapshot so a delete of the
    // source stays in flight, then try to clone from it.
    let exec = {
        let service = service.clone();
        tokio::spawn(async move { service.execute_snapshot(create_request("s1")).await })
    };
    eventually(|| in_progress_snapshot(&bus, "s1").is_some()).await;
    let snapshot = in_progress_snapshot(&bus, "s1").unwrap();

    let delete = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .delete_snapshots(DeleteSnapshotsRequest {
                    repository: "repo".to_string(),
                    snapshots: vec!["src".to_string()],
                })
                .await
        })
    };
    eventually(|| !bus.state().snapshot_deletions.is_empty()).await;

    let err = service
        .clone_snapshot(CloneSnapshotRequest {
            repository: "repo".to_string(),
            source: "src".to_string(),
            target: "copy".to_string(),
            indices: vec!["*".to_string()],
        })
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::ConcurrentSnapshotExecution { .. }),
        "{err}"
    );

    report(&service, &snapshot, 0, success_on("n1", "g0"))
        .await
        .unwrap();
    report(&service, &snapshot, 1, success_on("n2", "g1"))
        .await
        .unwrap();
    exec.await.unwrap().unwrap();
    delete.await.unwrap().unwrap();
}

// Pre-concurrency peers force the single-snapshot legacy path.
#[tokio::test]
async fn legacy_create_path_with_old_peers() {
    let state = StateBuilder::new("m")
        .node("n1", Version::new(4))
        .repository("repo")
        .index("idx", &[("n1", ShardRoutingState::Started)])
        .build();
    let repo = MockRepository::new("repo");
    let (bus, service) = fixture(state, vec![repo.clone()], snapshots::Settings::default());

    let exec = {
        let service = service.clone();
        tokio::spawn(async move { service.execute_snapshot(create_request("s1")).await })
    };
    eventually(|| {
        in_progress_snapshot(&bus, "s1").is_some_and(|s| {
            bus.state()
                .snapshots
                .get(&s)
                .is_some_and(|e| e.state == SnapshotState::Started)
        })
    })
    .await;
    let snapshot = in_progress_snapshot(&bus, "s1").unwrap();

    // A concurrent create is refused while one runs on the legacy path.
    let err = service
        .create_snapshot(create_request("s2"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::ConcurrentSnapshotExecution { .. }),
        "{err}"
    );

    report(&service, &snapshot, 0, success_on("n1", "g0"))
        .await
        .unwrap();
    let info = exec.await.unwrap().unwrap();
    assert_eq!(info.state, SnapshotState::Success);
    assert!(repo.data().has_snapshot_name("s1"));
    // Old peers predate shard generations in repository data.
    assert!(repo.data().shard_generations.is_empty());
}

#[tokio::test]
async fn read_only_views_filter_in_progress_entries() {
    let repo = MockRepository::new("repo");
    let (bus, service) = fixture(
        two_shard_state(),
        vec![repo],
        snapshots::Settings::default(),
    );

    service
        .create_snapshot(create_request("nightly-1"))
        .await
        .unwrap();
    service
        .create_snapshot(create_request("adhoc"))
        .await
        .unwrap();

    let state = bus.state();
    assert_eq!(snapshots::current_snapshots(&state, "_all", &[]).len(), 2);
    assert_eq!(
        snapshots::current_snapshots(&state, "repo", &["nightly-*".to_string()]).len(),
        1
    );
    assert!(snapshots::current_snapshots(&state, "other", &[]).is_empty());

    let candidates = vec!["idx".to_string(), "other-idx".to_string()];
    let busy = snapshots::snapshotting_indices(&state, &candidates);
    assert!(busy.contains("idx") && !busy.contains("other-idx"));
}
