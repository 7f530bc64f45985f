use std::fmt;
use std::path::Path;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::entry::{HistoryEntry, Identity};
use crate::error::Result;
use crate::store::{self, Backend, OwnershipStore};

/// Default cap on the ownership log.
pub const MAX_HISTORY: usize = 25;

/// Default wait for the store's lock or write transaction.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TrackerOptions {
    pub backend: Backend,
    pub max_history: usize,
    pub lock_timeout: Duration,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            max_history: MAX_HISTORY,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// Verdict of [`SuccessionTracker::check_succession`] for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Succession {
    /// Current owner, or the log is empty.
    Leader,
    /// Never claimed; free to take over from the current owner.
    Challenger,
    /// Claimed before and has since been replaced.
    Superseded,
}

impl Succession {
    pub fn should_proceed(self) -> bool {
        !self.is_replaced()
    }

    pub fn is_replaced(self) -> bool {
        self == Self::Superseded
    }
}

impl fmt::Display for Succession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leader => f.write_str("leader"),
            Self::Challenger => f.write_str("challenger"),
            Self::Superseded => f.write_str("superseded"),
        }
    }
}

/// Decide the verdict for `identity` from a newest-first history.
pub fn decide(identity: &Identity, history: &[HistoryEntry]) -> Succession {
    match history.first() {
        None => Succession::Leader,
        Some(newest) if newest.owner == identity.as_str() => Succession::Leader,
        Some(_) if history.iter().any(|e| e.owner == identity.as_str()) => Succession::Superseded,
        Some(_) => Succession::Challenger,
    }
}

/// Ownership decisions for one identity over a shared [`OwnershipStore`].
///
/// The in-process mutex only serializes calls on this handle; the store's
/// lock or transaction is what keeps separate processes consistent.
pub struct SuccessionTracker {
    identity: Identity,
    store: Box<dyn OwnershipStore>,
    max_history: usize,
    mu: Mutex<()>,
}

impl SuccessionTracker {
    /// Open the tracker on the store at `path`. The file backend creates
    /// its document lazily on first claim; SQLite creates its schema here
    /// and may wait up to `lock_timeout` or until `cancel` fires.
    pub async fn open(
        path: &Path,
        identity: Identity,
        opts: TrackerOptions,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let store = store::open(opts.backend, path, opts.lock_timeout, cancel).await?;
        debug!(path = %path.display(), backend = %opts.backend, identity = %identity, "opened succession store");
        Ok(Self::with_store(store, identity, opts.max_history))
    }

    pub fn with_store(store: Box<dyn OwnershipStore>, identity: Identity, max_history: usize) -> Self {
        Self {
            identity,
            store,
            max_history: max_history.max(1),
            mu: Mutex::new(()),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Should this identity proceed, or has it been replaced?
    pub async fn check_succession(&self, cancel: &CancellationToken) -> Result<Succession> {
        let _guard = self.mu.lock().await;
        let history = self.store.read_all(cancel).await?;
        let verdict = decide(&self.identity, &history);
        debug!(
            identity = %self.identity,
            current_owner = history.first().map(|e| e.owner.as_str()).unwrap_or_default(),
            %verdict,
            "checked succession"
        );
        Ok(verdict)
    }

    /// Record a new ownership claim for this identity and trim the log.
    pub async fn claim(&self, cancel: &CancellationToken) -> Result<HistoryEntry> {
        let _guard = self.mu.lock().await;
        let entry = self
            .store
            .append(&self.identity, self.max_history, cancel)
            .await?;
        info!(identity = %self.identity, sequence = entry.sequence, "claimed ownership");
        Ok(entry)
    }

    /// Owner of the newest claim, if any.
    pub async fn current_owner(&self, cancel: &CancellationToken) -> Result<Option<String>> {
        let _guard = self.mu.lock().await;
        let history = self.store.read_all(cancel).await?;
        Ok(history.into_iter().next().map(|e| e.owner))
    }

    /// Full (trimmed) log, newest first.
    pub async fn history(&self, cancel: &CancellationToken) -> Result<Vec<HistoryEntry>> {
        let _guard = self.mu.lock().await;
        self.store.read_all(cancel).await
    }

    pub async fn close(&self) -> Result<()> {
        let _guard = self.mu.lock().await;
        self.store.close().await
    }
}

impl fmt::Display for SuccessionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SuccessionTracker{{path={}, identity={}}}",
            self.store.path().display(),
            self.identity
        )
    }
}
