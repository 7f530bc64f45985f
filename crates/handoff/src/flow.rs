//! Succession check, peer shutdown and release barrier, in that order.
//!
//! The flow only decides whether and when the new daemon may start; the
//! caller performs the exec.

use std::time::{Duration, Instant};

use ctl::{ControlClient, ControlError, RunDir};
use succession::{Identity, Succession, SuccessionTracker, TrackerOptions};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use verifier::{Context, FileRemoval, HugePages, Verifier};

use crate::config::HandoffConfig;
use crate::error::HandoffResult;

/// What the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Another instance has taken over since we last ran; step aside.
    StepAside,
    /// Start the daemon. `restart` is set when an old instance was stopped
    /// and measures exit request to verified release.
    Start { restart: Option<Duration> },
}

pub async fn run(
    config: &HandoffConfig,
    binary: &str,
    identity: Identity,
    cancel: &CancellationToken,
) -> HandoffResult<Decision> {
    let run_dir = RunDir::new(&config.run_dir);
    let opts = TrackerOptions {
        backend: config.backend,
        max_history: config.max_history,
        lock_timeout: config.lock_timeout(),
    };
    let tracker =
        SuccessionTracker::open(&run_dir.succession_store(binary), identity, opts, cancel).await?;
    debug!(%tracker, backend = %config.backend, "succession tracker ready");

    let result = decide(config, &run_dir, binary, &tracker, cancel).await;
    if let Err(e) = tracker.close().await {
        error!(error = %e, "failed to close succession tracker");
    }
    result
}

async fn decide(
    config: &HandoffConfig,
    run_dir: &RunDir,
    binary: &str,
    tracker: &SuccessionTracker,
    cancel: &CancellationToken,
) -> HandoffResult<Decision> {
    let verdict = match tracker.check_succession(cancel).await {
        Ok(verdict) => verdict,
        Err(e) => {
            // A stuck store must never wedge the daemon.
            warn!(error = %e, "failed to check succession, proceeding");
            Succession::Challenger
        }
    };

    if verdict.is_replaced() {
        let current_owner = tracker.current_owner(cancel).await.ok().flatten();
        info!(
            our_pod = %tracker.identity(),
            current_owner = current_owner.as_deref().unwrap_or_default(),
            "replaced by a newer instance, exiting gracefully"
        );
        if let Ok(history) = tracker.history(cancel).await
            && let Some(latest) = history.first()
        {
            debug!(entries = history.len(), latest = %latest.owner, "succession history");
        }
        return Ok(Decision::StepAside);
    }

    let dialed = ControlClient::dial_binary(run_dir, binary, config.call_timeout(), cancel).await;
    let mut client = match dialed {
        Ok(client) => client,
        Err(ControlError::NoPidFile(_)) => {
            info!("no existing process found");
            claim(tracker, cancel).await;
            return Ok(Decision::Start { restart: None });
        }
        Err(e) => return Err(e.into()),
    };

    let restart = stop_peer(config, run_dir, binary, tracker, &mut client, cancel).await;
    if let Err(e) = client.close().await {
        debug!(error = %e, "failed to close control client");
    }
    Ok(Decision::Start {
        restart: Some(restart?),
    })
}

/// Stop the running instance and wait until it has let go of everything.
async fn stop_peer(
    config: &HandoffConfig,
    run_dir: &RunDir,
    binary: &str,
    tracker: &SuccessionTracker,
    client: &mut ControlClient,
    cancel: &CancellationToken,
) -> HandoffResult<Duration> {
    let version = client.query_version(cancel).await?;
    info!(version = version.trim_end_matches('\n'), "stopping existing process");

    if claim(tracker, cancel).await
        && let Ok(history) = tracker.history(cancel).await
        && let [newest, previous, ..] = history.as_slice()
    {
        debug!(
            new_owner = %newest.owner,
            previous_owner = %previous.owner,
            total_entries = history.len(),
            "succession history updated"
        );
    }

    let started = Instant::now();
    client.request_exit(cancel).await?;
    info!("existing process acknowledged exit");

    let verifiers: Vec<Box<dyn Verifier>> = vec![
        Box::new(FileRemoval::new(run_dir.pid_file(binary))?),
        Box::new(FileRemoval::new(run_dir.ctl_pattern(binary))?),
        Box::new(HugePages::new(&config.meminfo_path)),
    ];
    let ctx = Context::with_cancel(cancel.child_token(), config.exit_timeout());
    verifier::run(&ctx, verifiers).await?;
    info!("existing process released its resources");

    Ok(started.elapsed())
}

/// Record our claim. Failure is logged, not fatal.
async fn claim(tracker: &SuccessionTracker, cancel: &CancellationToken) -> bool {
    match tracker.claim(cancel).await {
        Ok(_) => {
            info!(pod = %tracker.identity(), "claimed succession");
            true
        }
        Err(e) => {
            warn!(error = %e, "failed to claim succession");
            false
        }
    }
}
