use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// No running peer: the pid marker is absent.
    #[error("pid file does not exist: {}", .0.display())]
    NoPidFile(PathBuf),

    #[error("failed to parse pid from {}: {contents:?}", path.display())]
    InvalidPid { path: PathBuf, contents: String },

    #[error("{op} timed out after {}ms", timeout.as_millis())]
    Timeout { op: &'static str, timeout: Duration },

    #[error("{0} cancelled")]
    Cancelled(&'static str),

    #[error("connection closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(#[from] ctl_proto::ProtocolError),

    #[error("unexpected response to {request}: {response}")]
    UnexpectedResponse {
        request: &'static str,
        response: &'static str,
    },

    #[error("remote error: {0}")]
    Remote(String),

    #[error("invalid socket pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    /// `true` when there is no running peer to talk to.
    pub fn is_no_pid_file(&self) -> bool {
        matches!(self, Self::NoPidFile(_))
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
