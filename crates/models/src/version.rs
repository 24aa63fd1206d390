use serde::{Deserialize, Serialize};

/// Feature version of a cluster node. The engine gates behavior on the
/// minimum version across all peers, so that a rolling upgrade never asks
/// an older node to handle state it cannot parse.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version(u32);

impl Version {
    /// Snapshots no longer pre-initialize repository metadata before the
    /// entry transitions to STARTED.
    pub const NO_REPO_INITIALIZE: Version = Version(5);
    /// Repository data tracks per-shard generations, enabling incremental
    /// shard writes.
    pub const SHARD_GEN_IN_REPO_DATA: Version = Version(6);
    /// A single delete request may carry multiple names and glob patterns.
    pub const MULTI_DELETE: Version = Version(8);
    /// Multiple snapshots and deletions may run concurrently.
    pub const FULL_CONCURRENCY: Version = Version(9);
    /// Snapshots can be cloned repository-side without re-reading shards.
    pub const CLONE_SNAPSHOT: Version = Version(10);

    pub const CURRENT: Version = Version(12);

    pub fn new(v: u32) -> Self {
        Self(v)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}
