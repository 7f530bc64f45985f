//! Deadline-bound checks that a replaced daemon has let go of its
//! resources, run concurrently with fail-fast cancellation.

mod context;
mod error;
mod file_removal;
mod hugepages;
mod runner;

use async_trait::async_trait;

pub use context::{Context, Interrupt};
pub use error::{Result, VerifyError};
pub use file_removal::FileRemoval;
pub use hugepages::{DEFAULT_MEMINFO, HugePages, POLL_INTERVAL};
pub use runner::run;

/// A condition to wait for.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Short description used in logs and failure messages.
    fn describe(&self) -> String;

    /// Block until the condition holds or `ctx` ends.
    async fn verify(&self, ctx: &Context) -> Result<()>;
}
