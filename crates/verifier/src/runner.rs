use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::context::Context;
use crate::error::{Result, VerifyError};
use crate::Verifier;

/// Run every verifier concurrently under a child of `ctx`.
///
/// The first failure cancels the rest. All tasks are awaited before
/// returning; the error is the first failure, tagged with the failing
/// verifier's description.
pub async fn run(ctx: &Context, verifiers: Vec<Box<dyn Verifier>>) -> Result<()> {
    let shared = ctx.child();
    let mut tasks = JoinSet::new();
    for verifier in verifiers {
        let ctx = shared.clone();
        tasks.spawn(async move {
            let name = verifier.describe();
            debug!(verifier = %name, "verifying");
            let result = verifier.verify(&ctx).await;
            (name, result)
        });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let failure = match joined {
            Ok((name, Ok(()))) => {
                info!(verifier = %name, "verified");
                continue;
            }
            Ok((name, Err(e))) => VerifyError::Failed {
                verifier: name,
                source: Box::new(e),
            },
            Err(e) => VerifyError::Task(e.to_string()),
        };
        if first_error.is_none() {
            shared.cancel();
            first_error = Some(failure);
        } else {
            debug!(error = %failure, "verifier stopped after earlier failure");
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
