//! Property tests of the shard-update batch reducer: it is a pure
//! function, so these drive it with arbitrary shard layouts and update
//! batches.

use std::collections::BTreeMap;

use cluster::RoutingTable;
use models::{
    Entry, EntryShardKey, IndexId, NodeId, ShardGeneration, ShardId, ShardSnapshotStatus,
    ShardState, Snapshot, SnapshotId, SnapshotState, SnapshotsInProgress, Version,
};
use quickcheck::{Arbitrary, Gen};
use quickcheck_macros::quickcheck;
use snapshots::{apply_shard_updates, ShardSnapshotUpdate};

const SHARDS: u32 = 3;

#[derive(Clone, Debug)]
struct ArbStatus(ShardSnapshotStatus);

impl Arbitrary for ArbStatus {
    fn arbitrary(g: &mut Gen) -> Self {
        let node = NodeId::new(*g.choose(&["n1", "n2"]).unwrap());
        let gen = Some(ShardGeneration::new("g"));
        let status = match *g.choose(&[0u8, 1, 2, 3, 4, 5]).unwrap() {
            0 => ShardSnapshotStatus::init(node, gen),
            1 => ShardSnapshotStatus::waiting(gen),
            2 => ShardSnapshotStatus::unassigned_queued(),
            3 => ShardSnapshotStatus::success(node, gen),
            4 => ShardSnapshotStatus::failed(Some(node), "boom", gen),
            _ => ShardSnapshotStatus::missing("gone"),
        };
        ArbStatus(status)
    }
}

#[derive(Clone, Debug)]
struct ArbUpdate(ShardSnapshotUpdate);

impl Arbitrary for ArbUpdate {
    fn arbitrary(g: &mut Gen) -> Self {
        let target = *g.choose(&[1u128, 2, 3]).unwrap();
        let shard = *g.choose(&[0u32, 1, 2]).unwrap();
        let node = NodeId::new("n1");
        let status = match *g.choose(&[0u8, 1, 2]).unwrap() {
            0 => ShardSnapshotStatus::success(node, Some(ShardGeneration::new("g-done"))),
            1 => ShardSnapshotStatus::failed(Some(node), "update failed", None),
            _ => ShardSnapshotStatus {
                state: ShardState::PausedForNodeRemoval,
                node_id: Some(node),
                reason: None,
                generation: None,
            },
        };
        ArbUpdate(ShardSnapshotUpdate {
            snapshot: snapshot(target),
            key: EntryShardKey::Routing(ShardId::new("idx", shard)),
            status,
        })
    }
}

fn index() -> IndexId {
    IndexId::new("idx", uuid::Uuid::from_u128(1000))
}

fn snapshot(n: u128) -> Snapshot {
    Snapshot::new(
        "repo",
        SnapshotId::new(format!("s{n}"), uuid::Uuid::from_u128(n)),
    )
}

fn entry(n: u128, statuses: &[ShardSnapshotStatus]) -> Entry {
    let shards: BTreeMap<ShardId, ShardSnapshotStatus> = statuses
        .iter()
        .enumerate()
        .map(|(i, s)| (ShardId::new("idx", i as u32), s.clone()))
        .collect();
    Entry {
        snapshot: snapshot(n),
        include_global_state: true,
        partial: true,
        state: SnapshotState::Started,
        indices: vec![index()],
        data_streams: Vec::new(),
        start_time_ms: n as i64,
        repo_generation: 0,
        user_metadata: None,
        repository_meta_version: Version::CURRENT,
        shards,
        source: None,
        clones: BTreeMap::new(),
        failure: None,
    }
}

fn fixture(layout: &[Vec<ArbStatus>]) -> SnapshotsInProgress {
    SnapshotsInProgress {
        entries: layout
            .iter()
            .enumerate()
            .map(|(i, statuses)| {
                let statuses: Vec<ShardSnapshotStatus> = statuses
                    .iter()
                    .take(SHARDS as usize)
                    .map(|s| s.0.clone())
                    .collect();
                entry((i + 1) as u128, &statuses)
            })
            .collect(),
    }
}

fn queued_count(state: &SnapshotsInProgress, shard: &ShardId) -> usize {
    state
        .entries
        .iter()
        .filter(|e| {
            e.shards
                .get(shard)
                .is_some_and(|s| s.is_unassigned_queued())
        })
        .count()
}

// Applying a batch twice yields the same state as applying it once:
// terminal statuses absorb their retries, and non-terminal re-deliveries
// re-patch the identical status.
#[quickcheck]
fn batch_application_is_idempotent(layout: Vec<Vec<ArbStatus>>, updates: Vec<ArbUpdate>) -> bool {
    let layout: Vec<Vec<ArbStatus>> = layout.into_iter().take(3).collect();
    let updates: Vec<ShardSnapshotUpdate> =
        updates.into_iter().take(6).map(|u| u.0).collect();
    let current = fixture(&layout);
    let routing = RoutingTable::default();

    let once = apply_shard_updates(&current, &routing, None, &updates);
    let twice = apply_shard_updates(&once.snapshots, &routing, None, &updates);
    once.snapshots == twice.snapshots
}

// Queued waiters only drain: a batch never enqueues new waiters, and each
// released shard starts at most one of them.
#[quickcheck]
fn queued_waiters_only_drain(layout: Vec<Vec<ArbStatus>>, updates: Vec<ArbUpdate>) -> bool {
    let layout: Vec<Vec<ArbStatus>> = layout.into_iter().take(3).collect();
    let updates: Vec<ShardSnapshotUpdate> =
        updates.into_iter().take(6).map(|u| u.0).collect();
    let current = fixture(&layout);
    let routing = RoutingTable::default();

    let outcome = apply_shard_updates(&current, &routing, None, &updates);
    (0..SHARDS).all(|shard| {
        let shard = ShardId::new("idx", shard);
        let before = queued_count(&current, &shard);
        let after = queued_count(&outcome.snapshots, &shard);
        // One release may promote at most one waiter per shard per batch.
        after <= before && before - after <= updates.len()
    })
}

// Entries of unrelated snapshots and untouched slots are preserved
// verbatim.
#[quickcheck]
fn untargeted_entries_are_untouched(layout: Vec<Vec<ArbStatus>>) -> bool {
    let layout: Vec<Vec<ArbStatus>> = layout.into_iter().take(3).collect();
    let current = fixture(&layout);
    let routing = RoutingTable::default();

    // An update batch for a snapshot that is not in the state at all.
    let updates = vec![ShardSnapshotUpdate {
        snapshot: snapshot(99),
        key: EntryShardKey::Routing(ShardId::new("idx", 0)),
        status: ShardSnapshotStatus::success(NodeId::new("n1"), None),
    }];
    let outcome = apply_shard_updates(&current, &routing, None, &updates);
    outcome.snapshots == current && outcome.executed == 0
}
