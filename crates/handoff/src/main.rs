mod config;
mod error;
mod flow;

use std::convert::Infallible;
use std::ffi::CString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use succession::{Backend, Identity};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use tracing_subscriber::fmt::time::FormatTime;

use crate::config::Overrides;
use crate::error::{HandoffError, HandoffResult};
use crate::flow::Decision;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

/// Take over from a running daemon instance, then exec the new one
#[derive(Parser)]
#[command(name = "handoff", version)]
struct Cli {
    /// Path to a handoff.yaml config file
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Runtime directory with pid files and control sockets (overrides config)
    #[arg(long)]
    run_dir: Option<PathBuf>,
    /// Succession store backend: file or sqlite (overrides config)
    #[arg(long)]
    backend: Option<Backend>,
    /// Ownership history entries to keep (overrides config)
    #[arg(long)]
    max_history: Option<usize>,
    /// Succession store lock timeout in milliseconds (overrides config)
    #[arg(long)]
    lock_timeout_ms: Option<u64>,
    /// Deadline for each control socket call in milliseconds
    #[arg(long)]
    call_timeout_ms: Option<u64>,
    /// Time allowed for the old instance to exit and release resources
    #[arg(long)]
    exit_timeout_ms: Option<u64>,
    /// meminfo file consulted for hugepage release (overrides config)
    #[arg(long)]
    meminfo_path: Option<PathBuf>,
    /// Identity of this instance, unique per replacement
    #[arg(long, env = "POD_NAME")]
    identity: Option<String>,
    /// Daemon binary followed by its arguments
    #[arg(last = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl Cli {
    fn overrides(&mut self) -> Overrides {
        Overrides {
            run_dir: self.run_dir.take(),
            backend: self.backend.take(),
            max_history: self.max_history.take(),
            lock_timeout_ms: self.lock_timeout_ms.take(),
            call_timeout_ms: self.call_timeout_ms.take(),
            exit_timeout_ms: self.exit_timeout_ms.take(),
            meminfo_path: self.meminfo_path.take(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "handoff failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(mut cli: Cli) -> HandoffResult<ExitCode> {
    let command = std::mem::take(&mut cli.command);
    let Some((binary_path, args)) = command.split_first() else {
        return Err(HandoffError::Usage("handoff [flags] -- <binary> <args...>".into()));
    };
    let binary = Path::new(binary_path)
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| HandoffError::Usage(format!("invalid binary path {binary_path:?}")))?
        .to_string();

    let identity = Identity::new(cli.identity.take().unwrap_or_default()).map_err(|_| {
        HandoffError::Usage("POD_NAME (or --identity) must be set for succession tracking".into())
    })?;

    let overrides = cli.overrides();
    let config = config::resolve(cli.config.as_deref(), overrides).await?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let span = info_span!("handoff", %binary);
    let decision = flow::run(&config, &binary, identity, &cancel)
        .instrument(span.clone())
        .await?;

    let _enter = span.enter();
    match decision {
        Decision::StepAside => Ok(ExitCode::SUCCESS),
        Decision::Start { restart } => {
            match restart {
                Some(d) => info!(
                    restart_duration_ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX),
                    "restarting process"
                ),
                None => info!("starting process"),
            }
            match exec(binary_path, args)? {}
        }
    }
}

/// Cancel in-flight work on SIGINT or SIGTERM.
async fn cancel_on_signal(cancel: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    warn!("signal received, aborting handoff");
    cancel.cancel();
}

/// Replace this process with `binary_path`, passing `args` and the current
/// environment.
fn exec(binary_path: &str, args: &[String]) -> HandoffResult<Infallible> {
    let path = CString::new(binary_path)?;
    let argv = std::iter::once(binary_path)
        .chain(args.iter().map(String::as_str))
        .map(CString::new)
        .collect::<Result<Vec<_>, _>>()?;
    nix::unistd::execv(&path, &argv).map_err(|source| HandoffError::Exec {
        binary: binary_path.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_takes_command_after_separator() {
        let cli = Cli::try_parse_from([
            "handoff",
            "--run-dir",
            "/tmp/run",
            "--backend",
            "sqlite",
            "--identity",
            "pod-a",
            "--",
            "/usr/sbin/ovs-vswitchd",
            "--pidfile",
            "-vconsole:info",
        ])
        .unwrap();
        assert_eq!(cli.run_dir.as_deref(), Some(Path::new("/tmp/run")));
        assert_eq!(cli.backend, Some(Backend::Sqlite));
        assert_eq!(cli.identity.as_deref(), Some("pod-a"));
        assert_eq!(
            cli.command,
            ["/usr/sbin/ovs-vswitchd", "--pidfile", "-vconsole:info"]
        );
    }

    #[test]
    fn cli_requires_command() {
        assert!(Cli::try_parse_from(["handoff", "--identity", "pod-a"]).is_err());
    }

    #[test]
    fn cli_rejects_unknown_backend() {
        assert!(Cli::try_parse_from(["handoff", "--backend", "bolt", "--", "/bin/true"]).is_err());
    }

    #[tokio::test]
    async fn blank_identity_is_rejected() {
        let cli = Cli::try_parse_from(["handoff", "--identity", " ", "--", "/bin/true"]).unwrap();
        let err = run(cli).await.unwrap_err();
        assert!(matches!(err, HandoffError::Usage(_)));
    }

    #[test]
    fn exec_rejects_interior_nul() {
        let err = exec("/bin/tr\0ue", &[]).unwrap_err();
        assert!(matches!(err, HandoffError::Argument(_)));
    }
}
