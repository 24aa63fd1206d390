mod data;
mod driver;
mod info;

pub use data::RepositoryData;
pub use driver::{IndexSnapshotMeta, RepositoryDriver, RepositoryRegistry};
pub use info::{SnapshotInfo, SnapshotShardFailure};

/// Errors raised when resolving or operating a repository.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("[{0}] missing repository")]
    Missing(String),
    #[error("[{repository}] {reason}")]
    Repository {
        repository: String,
        reason: String,
        source: Option<anyhow::Error>,
    },
}

impl Error {
    pub fn repository(repository: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Repository {
            repository: repository.into(),
            reason: reason.into(),
            source: None,
        }
    }

    pub fn wrap(
        repository: impl Into<String>,
        reason: impl Into<String>,
        source: anyhow::Error,
    ) -> Self {
        Self::Repository {
            repository: repository.into(),
            reason: reason.into(),
            source: Some(source),
        }
    }
}
