use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use succession::{Backend, DEFAULT_LOCK_TIMEOUT, MAX_HISTORY};

use crate::error::{HandoffError, HandoffResult};

pub(crate) const DEFAULT_EXIT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Directory holding pid files, control sockets and the succession store.
    pub run_dir: PathBuf,
    pub backend: Backend,
    pub max_history: usize,
    pub lock_timeout_ms: u64,
    /// Deadline for each control socket call (connect, version, exit).
    pub call_timeout_ms: u64,
    /// Budget for the old instance to exit and release its resources.
    pub exit_timeout_ms: u64,
    pub meminfo_path: PathBuf,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from(ctl::DEFAULT_RUN_DIR),
            backend: Backend::default(),
            max_history: MAX_HISTORY,
            lock_timeout_ms: u64::try_from(DEFAULT_LOCK_TIMEOUT.as_millis()).unwrap_or(u64::MAX),
            call_timeout_ms: u64::try_from(ctl::DEFAULT_CALL_TIMEOUT.as_millis()).unwrap_or(u64::MAX),
            exit_timeout_ms: DEFAULT_EXIT_TIMEOUT_MS,
            meminfo_path: PathBuf::from(verifier::DEFAULT_MEMINFO),
        }
    }
}

/// Values given on the command line; each replaces the file's value.
#[derive(Debug, Default)]
pub struct Overrides {
    pub run_dir: Option<PathBuf>,
    pub backend: Option<Backend>,
    pub max_history: Option<usize>,
    pub lock_timeout_ms: Option<u64>,
    pub call_timeout_ms: Option<u64>,
    pub exit_timeout_ms: Option<u64>,
    pub meminfo_path: Option<PathBuf>,
}

impl HandoffConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_timeout_ms)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(run_dir) = overrides.run_dir {
            self.run_dir = run_dir;
        }
        if let Some(backend) = overrides.backend {
            self.backend = backend;
        }
        if let Some(max_history) = overrides.max_history {
            self.max_history = max_history;
        }
        if let Some(ms) = overrides.lock_timeout_ms {
            self.lock_timeout_ms = ms;
        }
        if let Some(ms) = overrides.call_timeout_ms {
            self.call_timeout_ms = ms;
        }
        if let Some(ms) = overrides.exit_timeout_ms {
            self.exit_timeout_ms = ms;
        }
        if let Some(path) = overrides.meminfo_path {
            self.meminfo_path = path;
        }
    }

    fn validate(&self) -> HandoffResult<()> {
        if self.max_history == 0 {
            return Err(HandoffError::Config("max_history must be at least 1".into()));
        }
        if self.run_dir.as_os_str().is_empty() {
            return Err(HandoffError::Config("run_dir must not be empty".into()));
        }
        Ok(())
    }
}

/// Load a handoff config from a YAML file. Missing keys take defaults.
pub async fn load(path: &Path) -> HandoffResult<HandoffConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| HandoffError::Config(format!("read {}: {e}", path.display())))?;
    parse(&content).map_err(|e| match e {
        HandoffError::Config(msg) => HandoffError::Config(format!("{}: {msg}", path.display())),
        other => other,
    })
}

fn parse(content: &str) -> HandoffResult<HandoffConfig> {
    // An empty document is a null, not a mapping.
    if content.trim().is_empty() {
        return Ok(HandoffConfig::default());
    }
    let config: HandoffConfig =
        serde_yaml_ng::from_str(content).map_err(|e| HandoffError::Config(format!("parse: {e}")))?;
    config.validate()?;
    Ok(config)
}

/// Resolve the final config: file (if any), then command-line overrides.
pub async fn resolve(path: Option<&Path>, overrides: Overrides) -> HandoffResult<HandoffConfig> {
    let mut config = match path {
        Some(path) => load(path).await?,
        None => HandoffConfig::default(),
    };
    config.apply(overrides);
    config.validate()?;
    Ok(config)
}
