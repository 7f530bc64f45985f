//! Verifiers against real files in a temporary run directory.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use verifier::{Context, FileRemoval, HugePages, Verifier, VerifyError};

fn touch(path: &Path) {
    std::fs::write(path, b"").unwrap();
}

fn remove_after(path: &Path, delay: Duration) -> tokio::task::JoinHandle<()> {
    let path = path.to_path_buf();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        std::fs::remove_file(&path).unwrap();
    })
}

#[tokio::test]
async fn waits_for_exact_file_removal() {
    let dir = tempfile::tempdir().unwrap();
    let pid = dir.path().join("ovs-vswitchd.pid");
    touch(&pid);

    let remover = remove_after(&pid, Duration::from_millis(50));
    let started = Instant::now();
    FileRemoval::new(&pid)
        .unwrap()
        .verify(&Context::new(Duration::from_secs(10)))
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert!(!pid.exists());
    remover.await.unwrap();
}

#[tokio::test]
async fn waits_for_glob_match_removal() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = dir.path().join("ovs-vswitchd.4242.ctl");
    touch(&ctl);
    touch(&dir.path().join("ovsdb-server.7.ctl"));

    let remover = remove_after(&ctl, Duration::from_millis(50));
    FileRemoval::new(dir.path().join("ovs-vswitchd.*.ctl"))
        .unwrap()
        .verify(&Context::new(Duration::from_secs(10)))
        .await
        .unwrap();
    remover.await.unwrap();
}

#[tokio::test]
async fn rename_away_counts_as_removal() {
    let dir = tempfile::tempdir().unwrap();
    let pid = dir.path().join("ovs-vswitchd.pid");
    touch(&pid);

    let mover = tokio::spawn({
        let pid = pid.clone();
        let to = dir.path().join("old.pid.bak");
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::rename(&pid, &to).unwrap();
        }
    });
    FileRemoval::new(&pid)
        .unwrap()
        .verify(&Context::new(Duration::from_secs(10)))
        .await
        .unwrap();
    mover.await.unwrap();
}

#[tokio::test]
async fn unrelated_removal_keeps_waiting() {
    let dir = tempfile::tempdir().unwrap();
    let pid = dir.path().join("ovs-vswitchd.pid");
    let other = dir.path().join("ovsdb-server.pid");
    touch(&pid);
    touch(&other);

    let remover = remove_after(&other, Duration::from_millis(10));
    let err = FileRemoval::new(&pid)
        .unwrap()
        .verify(&Context::new(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    remover.await.unwrap();
}

#[tokio::test]
async fn deadline_is_a_failure_for_file_removal() {
    let dir = tempfile::tempdir().unwrap();
    let pid = dir.path().join("ovs-vswitchd.pid");
    touch(&pid);

    let err = FileRemoval::new(&pid)
        .unwrap()
        .verify(&Context::new(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::Timeout));
}

#[tokio::test]
async fn cancellation_stops_file_removal() {
    let dir = tempfile::tempdir().unwrap();
    let pid = dir.path().join("ovs-vswitchd.pid");
    touch(&pid);

    let ctx = Context::new(Duration::from_secs(30));
    let cancel = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });
    let err = FileRemoval::new(&pid).unwrap().verify(&ctx).await.unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removal_racing_the_initial_check_is_seen() {
    for round in 0..50 {
        let dir = tempfile::tempdir().unwrap();
        let pid = dir.path().join("ovs-vswitchd.pid");
        touch(&pid);

        let v = FileRemoval::new(&pid).unwrap();
        let ctx = Context::new(Duration::from_secs(5));
        let task = tokio::spawn(async move { v.verify(&ctx).await });
        // Spread deletions around the watch setup and existence check.
        if round % 2 == 0 {
            tokio::task::yield_now().await;
        }
        std::fs::remove_file(&pid).unwrap();

        let started = Instant::now();
        task.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(4), "round {round}");
    }
}

struct FailsAt(Duration);

#[async_trait]
impl Verifier for FailsAt {
    fn describe(&self) -> String {
        "always fails".to_string()
    }

    async fn verify(&self, _ctx: &Context) -> verifier::Result<()> {
        tokio::time::sleep(self.0).await;
        Err(VerifyError::Io(std::io::Error::other("boom")))
    }
}

#[tokio::test]
async fn no_verifiers_succeeds() {
    verifier::run(&Context::new(Duration::from_millis(10)), Vec::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn all_verifiers_pass() {
    let dir = tempfile::tempdir().unwrap();
    let meminfo = dir.path().join("meminfo");
    std::fs::write(&meminfo, "HugePages_Total: 0\nHugePages_Free: 0\n").unwrap();

    let verifiers: Vec<Box<dyn Verifier>> = vec![
        Box::new(FileRemoval::new(dir.path().join("ovs-vswitchd.pid")).unwrap()),
        Box::new(FileRemoval::new(dir.path().join("ovs-vswitchd.*.ctl")).unwrap()),
        Box::new(HugePages::new(meminfo)),
    ];
    verifier::run(&Context::new(Duration::from_secs(5)), verifiers)
        .await
        .unwrap();
}

#[tokio::test]
async fn first_failure_cancels_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let pid = dir.path().join("ovs-vswitchd.pid");
    let ctl = dir.path().join("ovs-vswitchd.1.ctl");
    touch(&pid);
    touch(&ctl);

    let verifiers: Vec<Box<dyn Verifier>> = vec![
        Box::new(FileRemoval::new(&pid).unwrap()),
        Box::new(FailsAt(Duration::from_millis(10))),
        Box::new(FileRemoval::new(dir.path().join("*.ctl")).unwrap()),
    ];
    let ctx = Context::new(Duration::from_secs(30));
    let started = Instant::now();
    let err = verifier::run(&ctx, verifiers).await.unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    match &err {
        VerifyError::Failed { verifier, source } => {
            assert_eq!(verifier, "always fails");
            assert!(matches!(**source, VerifyError::Io(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.to_string(), "always fails: io error: boom");
    // The caller's context is untouched.
    assert!(ctx.interrupted().is_none());
}

#[tokio::test]
async fn timeout_is_attributed_to_the_verifier() {
    let dir = tempfile::tempdir().unwrap();
    let pid = dir.path().join("ovs-vswitchd.pid");
    touch(&pid);

    let verifiers: Vec<Box<dyn Verifier>> = vec![Box::new(FileRemoval::new(&pid).unwrap())];
    let err = verifier::run(&Context::new(Duration::from_millis(50)), verifiers)
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(err.to_string().starts_with(&format!("file removal {}", pid.display())));
}
