mod clone;
mod create;
mod delete;
mod finalize;
mod listeners;
mod ongoing;
mod reactive;
mod read;
mod service;
mod shards;
pub mod testing;
mod updates;

pub use clone::CloneSnapshotRequest;
pub use create::CreateSnapshotRequest;
pub use delete::DeleteSnapshotsRequest;
pub use read::{
    current_snapshots, snapshotting_data_streams, snapshotting_indices, ALL_REPOSITORIES,
};
pub use service::SnapshotsService;
pub use updates::{apply_shard_updates, BatchOutcome, ShardSnapshotUpdate};

use cluster::PublicationError;
use serde::{Deserialize, Serialize};

/// The engine's stable error surface. Every variant is wire-visible and
/// cloneable so one failure can be fanned out to many waiting listeners.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("[{repository}:{name}] invalid snapshot name: {reason}")]
    InvalidSnapshotName {
        repository: String,
        name: String,
        reason: String,
    },
    #[error("[{repository}:{snapshot}] cannot execute: {reason}")]
    ConcurrentSnapshotExecution {
        repository: String,
        snapshot: String,
        reason: String,
    },
    #[error("[{repository}:{snapshot}] snapshot is missing")]
    SnapshotMissing { repository: String, snapshot: String },
    #[error("[{repository}:{snapshot}] {reason}")]
    Snapshot {
        repository: String,
        snapshot: String,
        reason: String,
    },
    #[error("[{repository}] {reason}")]
    Repository { repository: String, reason: String },
    #[error("[{0}] missing repository")]
    RepositoryMissing(String),
    #[error("no longer cluster-manager")]
    NotClusterManager,
    #[error("failed to commit cluster state: {0}")]
    FailedToCommitClusterState(String),
}

impl Error {
    pub fn concurrent(
        repository: impl Into<String>,
        snapshot: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ConcurrentSnapshotExecution {
            repository: repository.into(),
            snapshot: snapshot.into(),
            reason: reason.into(),
        }
    }

    pub fn snapshot(
        repository: impl Into<String>,
        snapshot: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Snapshot {
            repository: repository.into(),
            snapshot: snapshot.into(),
            reason: reason.into(),
        }
    }

    /// Maps an `anyhow` failure from an update task or repository call onto
    /// the stable surface, preserving typed errors that round-trip through
    /// the bus unchanged.
    pub(crate) fn classify(repository: &str, snapshot: &str, error: anyhow::Error) -> Error {
        let error = match error.downcast::<Error>() {
            Ok(typed) => return typed,
            Err(other) => other,
        };
        match error.downcast::<PublicationError>() {
            Ok(PublicationError::NotClusterManager) => Error::NotClusterManager,
            Ok(PublicationError::FailedToCommit(reason)) => {
                Error::FailedToCommitClusterState(reason)
            }
            Err(other) => Error::snapshot(repository, snapshot, format!("{other:#}")),
        }
    }

    /// Whether this failure means the local node must stop proposing state
    /// updates and let the next elected cluster-manager reconcile.
    pub(crate) fn is_manager_failure(&self) -> bool {
        matches!(
            self,
            Error::NotClusterManager | Error::FailedToCommitClusterState(_)
        )
    }
}

impl From<repository::Error> for Error {
    fn from(err: repository::Error) -> Self {
        match err {
            repository::Error::Missing(name) => Error::RepositoryMissing(name),
            repository::Error::Repository {
                repository,
                reason,
                source,
            } => Error::Repository {
                repository,
                reason: match source {
                    Some(source) => format!("{reason}: {source:#}"),
                    None => reason,
                },
            },
        }
    }
}

fn default_max_concurrent_operations() -> usize {
    Settings::DEFAULT_MAX_CONCURRENT_OPERATIONS
}

/// Engine settings. `max_concurrent_operations` is dynamic: it may be
/// raised or lowered at runtime through
/// [`SnapshotsService::set_max_concurrent_operations`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(
        rename = "snapshot.max_concurrent_operations",
        default = "default_max_concurrent_operations"
    )]
    pub max_concurrent_operations: usize,
}

impl Settings {
    pub const DEFAULT_MAX_CONCURRENT_OPERATIONS: usize = 1000;
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_operations: Self::DEFAULT_MAX_CONCURRENT_OPERATIONS,
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_deserialize_with_default() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.max_concurrent_operations, 1000);

        let settings: Settings =
            serde_json::from_str(r#"{"snapshot.max_concurrent_operations": 3}"#).unwrap();
        assert_eq!(settings.max_concurrent_operations, 3);
    }

    #[test]
    fn classify_preserves_typed_errors() {
        let err = Error::classify(
            "repo",
            "snap",
            anyhow::Error::new(Error::RepositoryMissing("repo".to_string())),
        );
        assert_eq!(err, Error::RepositoryMissing("repo".to_string()));

        let err = Error::classify(
            "repo",
            "snap",
            anyhow::Error::new(PublicationError::NotClusterManager),
        );
        assert!(err.is_manager_failure());

        let err = Error::classify("repo", "snap", anyhow::anyhow!("disk on fire"));
        assert_eq!(
            err,
            Error::snapshot("repo", "snap", "disk on fire".to_string())
        );
    }
}
