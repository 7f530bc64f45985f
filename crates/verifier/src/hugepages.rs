use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::context::{Context, Interrupt};
use crate::error::{Result, VerifyError};
use crate::Verifier;

pub const DEFAULT_MEMINFO: &str = "/proc/meminfo";

/// Poll interval for the meminfo counters.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Waits for hugepages held by the previous daemon to be freed.
///
/// Best effort: nothing configured, unreadable telemetry and an expired
/// deadline all count as released. Only cancellation is an error.
#[derive(Debug, Clone)]
pub struct HugePages {
    meminfo: PathBuf,
    interval: Duration,
}

impl Default for HugePages {
    fn default() -> Self {
        Self::new(DEFAULT_MEMINFO)
    }
}

impl HugePages {
    pub fn new(meminfo: impl Into<PathBuf>) -> Self {
        Self {
            meminfo: meminfo.into(),
            interval: POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn meminfo(&self) -> &Path {
        &self.meminfo
    }

    /// One look at the counters: true when there is nothing left to wait for.
    async fn released(&self) -> bool {
        let contents = match tokio::fs::read_to_string(&self.meminfo).await {
            Ok(contents) => contents,
            Err(e) => {
                warn!(path = %self.meminfo.display(), error = %e, "meminfo unreadable, assuming hugepages released");
                return true;
            }
        };
        match parse_meminfo(&contents) {
            Some(counts) if counts.total == 0 => true,
            Some(counts) => counts.free > 0,
            None => {
                warn!(path = %self.meminfo.display(), "no hugepage counters, assuming hugepages released");
                true
            }
        }
    }
}

#[async_trait]
impl Verifier for HugePages {
    fn describe(&self) -> String {
        "hugepages release".to_string()
    }

    async fn verify(&self, ctx: &Context) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                interrupt = ctx.done() => match interrupt {
                    Interrupt::DeadlineExceeded => {
                        warn!("hugepages still in use at deadline, continuing");
                        return Ok(());
                    }
                    Interrupt::Cancelled => return Err(VerifyError::Cancelled),
                },
                _ = ticker.tick() => {
                    if self.released().await {
                        debug!("hugepages available");
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HugePageCounts {
    total: u64,
    free: u64,
}

fn parse_meminfo(contents: &str) -> Option<HugePageCounts> {
    let mut total = None;
    let mut free = None;
    for line in contents.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.split_whitespace().next().and_then(|v| v.parse::<u64>().ok());
        match key.trim() {
            "HugePages_Total" => total = value,
            "HugePages_Free" => free = value,
            _ => {}
        }
    }
    Some(HugePageCounts {
        total: total?,
        free: free?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUSY: &str = "MemTotal:       16318412 kB\n\
                        HugePages_Total:     512\n\
                        HugePages_Free:        0\n\
                        HugePages_Rsvd:        0\n\
                        Hugepagesize:       2048 kB\n";

    #[test]
    fn parses_counters() {
        assert_eq!(
            parse_meminfo(BUSY),
            Some(HugePageCounts {
                total: 512,
                free: 0
            })
        );
        assert_eq!(parse_meminfo("MemTotal: 1 kB\n"), None);
        assert_eq!(parse_meminfo("HugePages_Total: x\nHugePages_Free: 0\n"), None);
    }

    fn meminfo(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("meminfo");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn free_pages_release_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = meminfo(dir.path(), "HugePages_Total: 512\nHugePages_Free: 12\n");
        HugePages::new(path)
            .verify(&Context::new(Duration::from_secs(5)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unconfigured_releases_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = meminfo(dir.path(), "HugePages_Total: 0\nHugePages_Free: 0\n");
        HugePages::new(path)
            .verify(&Context::new(Duration::from_secs(5)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_meminfo_counts_as_released() {
        let dir = tempfile::tempdir().unwrap();
        HugePages::new(dir.path().join("nope"))
            .verify(&Context::new(Duration::from_secs(5)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deadline_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = meminfo(dir.path(), BUSY);
        HugePages::new(path)
            .verify(&Context::new(Duration::from_millis(50)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancellation_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = meminfo(dir.path(), BUSY);
        let ctx = Context::new(Duration::from_secs(30));
        ctx.cancel();
        let err = HugePages::new(path).verify(&ctx).await.unwrap_err();
        assert!(matches!(err, VerifyError::Cancelled));
    }

    #[tokio::test]
    async fn pages_freed_while_polling() {
        let dir = tempfile::tempdir().unwrap();
        let path = meminfo(dir.path(), BUSY);

        let writer = tokio::spawn({
            let path = path.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                std::fs::write(&path, "HugePages_Total: 512\nHugePages_Free: 512\n").unwrap();
            }
        });

        let started = tokio::time::Instant::now();
        HugePages::new(path)
            .verify(&Context::new(Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        writer.await.unwrap();
    }
}
