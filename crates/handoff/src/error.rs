use std::ffi::NulError;

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("usage: {0}")]
    Usage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("succession error: {0}")]
    Succession(#[from] succession::SuccessionError),

    #[error("control error: {0}")]
    Control(#[from] ctl::ControlError),

    #[error("verification failed: {0}")]
    Verify(#[from] verifier::VerifyError),

    #[error("invalid argument: {0}")]
    Argument(#[from] NulError),

    #[error("exec {binary}: {source}")]
    Exec {
        binary: String,
        #[source]
        source: nix::errno::Errno,
    },
}

pub type HandoffResult<T> = Result<T, HandoffError>;
