use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::entry::{HistoryEntry, Identity};
use crate::error::Result;
use crate::lock::{self, LockMode, LockWait};
use crate::store::{Backend, OwnershipStore, join_error};

/// On-disk document. `next_sequence` survives trimming so sequence numbers
/// are never reused.
#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryDocument {
    next_sequence: u64,
    history: Vec<HistoryEntry>,
}

/// Single-file store: a JSON document replaced atomically on every claim.
///
/// The flock lives on a sibling `<path>.lock` file because rename swaps
/// the document's inode, which would silently drop a lock held on it.
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl FileStore {
    pub fn new(path: PathBuf, lock_timeout: Duration) -> Self {
        Self {
            lock_path: lock::lock_path(&path),
            path,
            lock_timeout,
        }
    }
}

#[async_trait]
impl OwnershipStore for FileStore {
    fn backend(&self) -> Backend {
        Backend::File
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn append(
        &self,
        owner: &Identity,
        max_history: usize,
        cancel: &CancellationToken,
    ) -> Result<HistoryEntry> {
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();
        let owner = owner.as_str().to_string();
        let wait = LockWait::new(self.lock_timeout, cancel);
        tokio::task::spawn_blocking(move || -> Result<HistoryEntry> {
            let _guard = lock::acquire(&lock_path, LockMode::Exclusive, &wait)?;
            let mut doc = load(&path)?;

            let newest = doc.history.iter().map(|e| e.sequence).max().unwrap_or(0);
            let sequence = doc.next_sequence.max(newest + 1);
            let entry = HistoryEntry {
                owner,
                timestamp: Utc::now(),
                sequence,
            };
            doc.next_sequence = sequence + 1;
            doc.history.insert(0, entry.clone());
            doc.history.sort_by(|a, b| b.sequence.cmp(&a.sequence));
            doc.history.truncate(max_history.max(1));

            store(&path, &doc)?;
            debug!(path = %path.display(), sequence, entries = doc.history.len(), "appended claim");
            Ok(entry)
        })
        .await
        .map_err(join_error)?
    }

    async fn read_all(&self, cancel: &CancellationToken) -> Result<Vec<HistoryEntry>> {
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();
        let wait = LockWait::new(self.lock_timeout, cancel);
        tokio::task::spawn_blocking(move || -> Result<Vec<HistoryEntry>> {
            // Nothing to lock in a run directory that does not exist yet.
            if !path.exists() && !parent_dir(&lock_path).exists() {
                return Ok(Vec::new());
            }
            let _guard = lock::acquire(&lock_path, LockMode::Shared, &wait)?;
            let mut doc = load(&path)?;
            doc.history.sort_by(|a, b| b.sequence.cmp(&a.sequence));
            Ok(doc.history)
        })
        .await
        .map_err(join_error)?
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Read the document. Absent or unparseable contents yield an empty log.
fn load(path: &Path) -> Result<HistoryDocument> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HistoryDocument::default()),
        Err(e) => return Err(e.into()),
    };
    if data.is_empty() {
        return Ok(HistoryDocument::default());
    }
    match serde_json::from_slice(&data) {
        Ok(doc) => Ok(doc),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "succession history corrupted, starting fresh");
            Ok(HistoryDocument::default())
        }
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Atomic write: write to a temp file in the same directory, fsync, then rename.
fn store(path: &Path, doc: &HistoryDocument) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(parent_dir(path))?;
    serde_json::to_writer_pretty(&mut tmp, doc)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
