use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::entry::{HistoryEntry, Identity};
use crate::error::{Result, SuccessionError};
use crate::file_store::FileStore;
use crate::sqlite_store::SqliteStore;

/// Durable, cross-process ownership log.
///
/// Implementations serialize every mutation through an exclusive file lock
/// or a database transaction. A missing or unparseable backing store reads
/// as an empty log.
#[async_trait]
pub trait OwnershipStore: Send + Sync {
    fn backend(&self) -> Backend;
    fn path(&self) -> &Path;
    /// Append a new entry for `owner` and trim the log to the newest
    /// `max_history` entries, atomically with respect to other processes.
    async fn append(
        &self,
        owner: &Identity,
        max_history: usize,
        cancel: &CancellationToken,
    ) -> Result<HistoryEntry>;
    /// Consistent snapshot of the log, newest first.
    async fn read_all(&self, cancel: &CancellationToken) -> Result<Vec<HistoryEntry>>;
    /// Release any held handle. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Storage technology behind an [`OwnershipStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// JSON document guarded by flock, replaced via rename.
    #[default]
    File,
    /// SQLite table keyed by an autoincrementing sequence.
    Sqlite,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => f.write_str("file"),
            Self::Sqlite => f.write_str("sqlite"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown backend {other:?} (expected file or sqlite)")),
        }
    }
}

/// Open the store at `path` with the chosen backend.
pub async fn open(
    backend: Backend,
    path: &Path,
    lock_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Box<dyn OwnershipStore>> {
    Ok(match backend {
        Backend::File => Box::new(FileStore::new(path.to_path_buf(), lock_timeout)),
        Backend::Sqlite => {
            Box::new(SqliteStore::open(path.to_path_buf(), lock_timeout, cancel).await?)
        }
    })
}

/// Map a `spawn_blocking` join failure.
pub(crate) fn join_error(e: tokio::task::JoinError) -> SuccessionError {
    SuccessionError::Internal(format!("store task: {e}"))
}
