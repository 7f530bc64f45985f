use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, TransactionBehavior, params};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::entry::{HistoryEntry, Identity};
use crate::error::{Result, SuccessionError};
use crate::lock::{self, LOCK_RETRY, LockMode, LockWait};
use crate::store::{Backend, OwnershipStore, join_error};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS succession_history (
    sequence INTEGER PRIMARY KEY AUTOINCREMENT,
    owner TEXT NOT NULL,
    timestamp TEXT NOT NULL
);";

/// SQLite store: one row per claim, insert and trim in one immediate
/// transaction. `AUTOINCREMENT` keeps sequence numbers monotonic across
/// deletes.
pub struct SqliteStore {
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
    lock_timeout: Duration,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    ///
    /// A file that is not a readable database is moved aside to
    /// `<path>.corrupt` and replaced with an empty one.
    pub async fn open(
        path: PathBuf,
        lock_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let wait = LockWait::new(lock_timeout, cancel);
        let conn = tokio::task::spawn_blocking({
            let path = path.clone();
            move || open_or_recover(&path, &wait)
        })
        .await
        .map_err(join_error)??;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(Some(conn))),
            lock_timeout,
        })
    }

    /// Run `f` on the connection in a blocking task, retrying while the
    /// database is locked by another process.
    async fn with_conn<T, F>(&self, what: &'static str, cancel: &CancellationToken, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let wait = LockWait::new(self.lock_timeout, cancel);
        tokio::task::spawn_blocking(move || -> Result<T> {
            let mut guard = conn
                .lock()
                .map_err(|_| SuccessionError::Internal("connection mutex poisoned".into()))?;
            let conn = guard.as_mut().ok_or(SuccessionError::Closed)?;
            loop {
                match f(conn) {
                    Ok(value) => return Ok(value),
                    Err(e) if is_busy(&e) => wait.backoff(what)?,
                    Err(e) => return Err(e.into()),
                }
            }
        })
        .await
        .map_err(join_error)?
    }
}

#[async_trait]
impl OwnershipStore for SqliteStore {
    fn backend(&self) -> Backend {
        Backend::Sqlite
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
        let owner = owner.as_str().to_string();
        let keep = i64::try_from(max_history.max(1)).unwrap_or(i64::MAX);
        let entry = self
            .with_conn("write transaction", cancel, move |conn| {
                let timestamp = Utc::now();
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute(
                    "INSERT INTO succession_history (owner, timestamp) VALUES (?1, ?2)",
                    params![owner, timestamp],
                )?;
                let sequence = tx.last_insert_rowid();
                tx.execute(
                    "DELETE FROM succession_history WHERE sequence NOT IN (
                        SELECT sequence FROM succession_history ORDER BY sequence DESC LIMIT ?1
                    )",
                    params![keep],
                )?;
                tx.commit()?;
                Ok(HistoryEntry {
                    owner: owner.clone(),
                    timestamp,
                    sequence: u64::try_from(sequence).unwrap_or_default(),
                })
            })
            .await?;
        debug!(path = %self.path.display(), sequence = entry.sequence, "appended claim");
        Ok(entry)
    }

    async fn read_all(&self, cancel: &CancellationToken) -> Result<Vec<HistoryEntry>> {
        let result = self
            .with_conn("read", cancel, |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT owner, timestamp, sequence FROM succession_history
                     ORDER BY sequence DESC",
                )?;
                let rows = stmt.query_map([], |row| {
                    let timestamp: DateTime<Utc> = row.get(1)?;
                    let sequence: i64 = row.get(2)?;
                    Ok(HistoryEntry {
                        owner: row.get(0)?,
                        timestamp,
                        sequence: u64::try_from(sequence).unwrap_or_default(),
                    })
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await;
        match result {
            Err(SuccessionError::Sqlite(e)) if is_unreadable(&e) => {
                warn!(path = %self.path.display(), error = %e, "succession history unreadable, treating as empty");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    async fn close(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let taken = conn
                .lock()
                .map_err(|_| SuccessionError::Internal("connection mutex poisoned".into()))?
                .take();
            match taken {
                Some(conn) => conn.close().map_err(|(_, e)| e.into()),
                None => Ok(()),
            }
        })
        .await
        .map_err(join_error)?
    }
}

/// Connect while holding a shared lock on `<path>.lock`. Recovery of a
/// corrupt file takes the lock exclusively, so no other opener is between
/// `Connection::open` and schema setup while the file is swapped.
fn open_or_recover(path: &Path, wait: &LockWait) -> Result<Connection> {
    let lock_path = lock::lock_path(path);
    {
        let _shared = lock::acquire(&lock_path, LockMode::Shared, wait)?;
        match connect(path, wait) {
            Err(SuccessionError::Sqlite(e)) if is_corruption(&e) => {
                debug!(path = %path.display(), error = %e, "succession database unreadable");
            }
            other => return other,
        }
    }

    let _exclusive = lock::acquire(&lock_path, LockMode::Exclusive, wait)?;
    // Another opener may have replaced the file while we waited.
    match connect(path, wait) {
        Err(SuccessionError::Sqlite(e)) if is_corruption(&e) => {
            warn!(path = %path.display(), error = %e, "succession database corrupted, starting fresh");
            move_aside(path)?;
            connect(path, wait)
        }
        other => other,
    }
}

/// Rename the database and any leftover rollback journal to `.corrupt`
/// names, so the journal is not replayed into the fresh file.
fn move_aside(path: &Path) -> io::Result<()> {
    for (suffix, aside) in [("", ".corrupt"), ("-journal", ".corrupt-journal")] {
        let mut from = path.as_os_str().to_owned();
        from.push(suffix);
        let mut to = path.as_os_str().to_owned();
        to.push(aside);
        match std::fs::rename(&from, &to) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn connect(path: &Path, wait: &LockWait) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(LOCK_RETRY)?;
    loop {
        match conn.execute_batch(SCHEMA) {
            Ok(()) => return Ok(conn),
            Err(e) if is_busy(&e) => wait.backoff("schema lock")?,
            Err(e) => return Err(e.into()),
        }
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn is_corruption(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    )
}

/// Corrupt file, or a row that no longer decodes.
fn is_unreadable(e: &rusqlite::Error) -> bool {
    is_corruption(e)
        || matches!(
            e,
            rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::InvalidColumnType(..)
        )
}
