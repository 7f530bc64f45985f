use std::io;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use tracing::debug;

use crate::error::{ControlError, Result};

/// Runtime directory holding pid markers, control sockets and succession stores.
pub const DEFAULT_RUN_DIR: &str = "/run/openvswitch";

/// Per-binary runtime paths under the run directory.
///
/// For a binary `ovs-vswitchd` running as pid 42:
/// - `ovs-vswitchd.pid` holds `42`
/// - `ovs-vswitchd.42.ctl` is its control socket
/// - `.ovs-vswitchd.succession.db` is the succession store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDir {
    root: PathBuf,
}

impl Default for RunDir {
    fn default() -> Self {
        Self::new(DEFAULT_RUN_DIR)
    }
}

impl RunDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pid_file(&self, binary: &str) -> PathBuf {
        self.root.join(format!("{binary}.pid"))
    }

    pub fn ctl_socket(&self, binary: &str, pid: u32) -> PathBuf {
        self.root.join(format!("{binary}.{pid}.ctl"))
    }

    /// Glob pattern matching every control socket of `binary`, whatever its pid.
    pub fn ctl_pattern(&self, binary: &str) -> PathBuf {
        self.root.join(ctl_glob(binary))
    }

    pub fn succession_store(&self, binary: &str) -> PathBuf {
        self.root.join(format!(".{binary}.succession.db"))
    }

    /// Read the pid of the running instance of `binary`.
    ///
    /// A missing pid file is [`ControlError::NoPidFile`], the "no running
    /// peer" case rather than a failure.
    pub async fn read_pid(&self, binary: &str) -> Result<u32> {
        let path = self.pid_file(binary);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ControlError::NoPidFile(path));
            }
            Err(e) => return Err(ControlError::Io(e)),
        };
        match contents.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => Ok(pid),
            _ => Err(ControlError::InvalidPid { path, contents }),
        }
    }

    /// Best-effort removal of the pid marker and every control socket of
    /// `binary`. Entries that are already gone count as removed.
    pub async fn cleanup(&self, binary: &str) -> Result<()> {
        remove_if_exists(&self.pid_file(binary)).await?;

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ControlError::Io(e)),
        };
        let matcher = ctl_matcher(binary)?;
        while let Some(entry) = entries.next_entry().await? {
            if matcher.is_match(Path::new(&entry.file_name())) {
                remove_if_exists(&entry.path()).await?;
            }
        }
        Ok(())
    }
}

fn ctl_glob(binary: &str) -> String {
    format!("{binary}.*.ctl")
}

/// File-name matcher for [`RunDir::ctl_pattern`]. `*` stays within one
/// path component.
fn ctl_matcher(binary: &str) -> Result<GlobMatcher> {
    Ok(GlobBuilder::new(&ctl_glob(binary))
        .literal_separator(true)
        .build()?
        .compile_matcher())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "removed");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ControlError::Io(e)),
    }
}
