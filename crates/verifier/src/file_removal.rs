use std::ffi::OsStr;
use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use globset::{GlobBuilder, GlobMatcher};
use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tracing::debug;

use crate::context::Context;
use crate::error::{Result, VerifyError};
use crate::Verifier;

/// Waits until no file matching a path or glob exists.
///
/// The directory part is taken literally; the file-name part may be a
/// glob (`ovs-vswitchd.*.ctl`). Returns at once when nothing matches,
/// otherwise on the first matching delete or rename-away in the
/// directory. The deadline is reported as [`VerifyError::Timeout`].
#[derive(Debug, Clone)]
pub struct FileRemoval {
    pattern: String,
    dir: PathBuf,
    matcher: GlobMatcher,
}

impl FileRemoval {
    pub fn new(pattern: impl AsRef<Path>) -> Result<Self> {
        let path = pattern.as_ref();
        let pattern = path.display().to_string();
        let invalid = |reason: String| VerifyError::InvalidPattern {
            pattern: pattern.clone(),
            reason,
        };

        let name = path
            .file_name()
            .and_then(OsStr::to_str)
            .ok_or_else(|| invalid("no utf-8 file name".into()))?;
        let matcher = GlobBuilder::new(name)
            .literal_separator(true)
            .build()
            .map_err(|e| invalid(e.to_string()))?
            .compile_matcher();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        Ok(Self {
            pattern,
            dir,
            matcher,
        })
    }

    fn matches(&self, name: &OsStr) -> bool {
        self.matcher.is_match(Path::new(name))
    }

    async fn any_match(&self) -> Result<bool> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if self.matches(&entry.file_name()) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn is_removal(&self, event: &InotifyEvent) -> bool {
        // The watched directory itself went away.
        if event.mask.intersects(
            AddWatchFlags::IN_DELETE_SELF | AddWatchFlags::IN_MOVE_SELF | AddWatchFlags::IN_IGNORED,
        ) {
            return true;
        }
        event
            .mask
            .intersects(AddWatchFlags::IN_DELETE | AddWatchFlags::IN_MOVED_FROM)
            && event.name.as_deref().is_some_and(|name| self.matches(name))
    }
}

#[async_trait]
impl Verifier for FileRemoval {
    fn describe(&self) -> String {
        format!("file removal {}", self.pattern)
    }

    async fn verify(&self, ctx: &Context) -> Result<()> {
        // Watch before looking so a removal between the two is not lost.
        let watch = watch_dir(&self.dir).map_err(|source| VerifyError::Watch {
            dir: self.dir.clone(),
            source,
        })?;
        let Some(watch) = watch else {
            debug!(pattern = %self.pattern, "directory absent, nothing to wait for");
            return Ok(());
        };
        if !self.any_match().await? {
            debug!(pattern = %self.pattern, "no matching files");
            return Ok(());
        }

        debug!(pattern = %self.pattern, "waiting for removal");
        loop {
            let events = {
                let mut guard = tokio::select! {
                    interrupt = ctx.done() => return Err(interrupt.into()),
                    ready = watch.readable() => ready?,
                };
                match guard.try_io(|fd| fd.get_ref().0.read_events().map_err(io::Error::from)) {
                    Ok(events) => events?,
                    Err(_would_block) => continue,
                }
            };

            for event in &events {
                if self.is_removal(event) {
                    debug!(pattern = %self.pattern, name = ?event.name, "removed");
                    return Ok(());
                }
            }
            // Dropped events: fall back to looking at the directory.
            if events
                .iter()
                .any(|e| e.mask.contains(AddWatchFlags::IN_Q_OVERFLOW))
                && !self.any_match().await?
            {
                return Ok(());
            }
        }
    }
}

/// inotify instance registered with the reactor. Owns its fd.
struct Watch(Inotify);

impl AsRawFd for Watch {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_fd().as_raw_fd()
    }
}

/// Watch `dir` for entries leaving it. `None` when the directory does not
/// exist.
fn watch_dir(dir: &Path) -> io::Result<Option<AsyncFd<Watch>>> {
    let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
    let mask = AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_MOVED_FROM
        | AddWatchFlags::IN_DELETE_SELF
        | AddWatchFlags::IN_MOVE_SELF;
    match inotify.add_watch(dir, mask) {
        Ok(_) => {}
        Err(Errno::ENOENT) => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    // SAFETY: `Watch` owns the inotify fd and is never swapped out of the
    // AsyncFd, so the fd stays open and unchanged until the AsyncFd drops.
    let registered = unsafe { AsyncFd::register_with_interest(Watch(inotify), Interest::READABLE) };
    Ok(Some(registered?))
}
