use std::path::PathBuf;

use crate::context::Interrupt;

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("deadline exceeded")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("watch {}: {source}", dir.display())]
    Watch {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{verifier}: {source}")]
    Failed {
        verifier: String,
        #[source]
        source: Box<VerifyError>,
    },

    #[error("verifier task failed: {0}")]
    Task(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl VerifyError {
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Failed { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Failed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

impl From<Interrupt> for VerifyError {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::DeadlineExceeded => Self::Timeout,
            Interrupt::Cancelled => Self::Cancelled,
        }
    }
}

pub type Result<T> = std::result::Result<T, VerifyError>;
