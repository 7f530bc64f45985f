//! Persisted ownership history for a managed daemon.
//!
//! Every instance that wants to run the daemon checks the shared log first:
//! the newest claim names the current owner, and an identity that claimed
//! before but is no longer newest has been superseded and must step aside.
//! The log lives in a lockable file or SQLite database next to the daemon's
//! runtime files and is shared by separate processes.

mod entry;
mod error;
mod file_store;
mod lock;
mod sqlite_store;
mod store;
mod tracker;

pub use entry::{HistoryEntry, Identity};
pub use error::{Result, SuccessionError};
pub use file_store::FileStore;
pub use sqlite_store::SqliteStore;
pub use store::{Backend, OwnershipStore, open};
pub use tracker::{
    DEFAULT_LOCK_TIMEOUT, MAX_HISTORY, Succession, SuccessionTracker, TrackerOptions, decide,
};
