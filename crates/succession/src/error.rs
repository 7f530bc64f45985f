use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SuccessionError {
    #[error("identity must not be empty")]
    EmptyIdentity,

    #[error("timeout acquiring {what} after {}ms", timeout.as_millis())]
    Timeout {
        what: &'static str,
        timeout: Duration,
    },

    #[error("{0} cancelled")]
    Cancelled(&'static str),

    #[error("store is closed")]
    Closed,

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("encode history: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SuccessionError {
    /// Lock or transaction deadline exceeded.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, SuccessionError>;
