//! Daemon side of the control endpoint.
//!
//! A managed daemon binds one `ControlServer` at startup. It publishes
//! `<binary>.pid` and listens on `<binary>.<pid>.ctl`; on `exit` it
//! acknowledges, triggers the shutdown token, and removes both files once
//! the accept loop has stopped.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ctl_proto::{Frame, FrameReader, Message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::paths::RunDir;

const READ_BUFFER_SIZE: usize = 4 * 1024;

pub struct ControlServer {
    listener: UnixListener,
    socket_path: PathBuf,
    pid_file: PathBuf,
    version: Arc<str>,
}

impl ControlServer {
    /// Bind the control socket for the current process and publish its pid.
    pub async fn bind(run_dir: &RunDir, binary: &str, version: &str) -> Result<Self> {
        let pid = std::process::id();
        let socket_path = run_dir.ctl_socket(binary, pid);

        // A socket left by an earlier run of this pid.
        match tokio::fs::remove_file(&socket_path).await {
            Ok(()) => debug!(socket = %socket_path.display(), "removed stale control socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&socket_path)?;

        let pid_file = run_dir.pid_file(binary);
        tokio::fs::write(&pid_file, format!("{pid}\n")).await?;

        info!(socket = %socket_path.display(), pid, "control endpoint listening");
        Ok(Self {
            listener,
            socket_path,
            pid_file,
            version: Arc::from(version),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serve control connections until `shutdown` fires, either from the
    /// outside or because a client sent `exit`. Removes the socket and the
    /// pid file before returning.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, _) = accepted?;
                    let version = Arc::clone(&self.version);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, version, shutdown).await {
                            debug!(error = %e, "control connection ended with error");
                        }
                    });
                }
            }
        }

        drop(self.listener);
        for path in [&self.socket_path, &self.pid_file] {
            if let Err(e) = tokio::fs::remove_file(path).await
                && e.kind() != io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %e, "failed to remove control file");
            }
        }
        info!("control endpoint closed");
        Ok(())
    }
}

/// Answer requests on one connection until the client hangs up or the
/// server shuts down.
async fn handle_connection(
    mut stream: UnixStream,
    version: Arc<str>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let mut reader = FrameReader::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            n = stream.read(&mut buf) => n?,
        };
        if n == 0 {
            return Ok(());
        }
        reader.feed(buf.get(..n).unwrap_or_default());

        while let Some(request) = reader.next_frame().map_err(invalid_data)? {
            let reply = Frame::new(request.seq, respond(&request.message, &version));
            stream.write_all(&reply.to_bytes().map_err(invalid_data)?).await?;
            if request.message == Message::Exit {
                info!("exit requested over control socket");
                shutdown.cancel();
                return Ok(());
            }
        }
    }
}

fn respond(request: &Message, version: &str) -> Message {
    match request {
        Message::Version => Message::VersionResult(version.to_string()),
        Message::Exit => Message::ExitAck,
        other => Message::Error(format!(
            "unsupported request: {} (0x{:02X})",
            other.name(),
            other.kind()
        )),
    }
}

fn invalid_data(e: ctl_proto::ProtocolError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ControlError;

    #[test]
    fn responses() {
        assert_eq!(
            respond(&Message::Version, "3.3.0"),
            Message::VersionResult("3.3.0".into())
        );
        assert_eq!(respond(&Message::Exit, "3.3.0"), Message::ExitAck);
        assert_eq!(
            respond(&Message::Unknown(0x42), "3.3.0"),
            Message::Error("unsupported request: unknown (0x42)".into())
        );
        assert_eq!(
            respond(&Message::ExitAck, "3.3.0"),
            Message::Error("unsupported request: exit_ack (0x04)".into())
        );
    }

    #[tokio::test]
    async fn bind_publishes_pid_and_socket() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunDir::new(dir.path());

        let server = ControlServer::bind(&run, "ovsdb-server", "3.3.0").await.unwrap();
        let pid = std::process::id();
        assert_eq!(server.socket_path(), run.ctl_socket("ovsdb-server", pid));
        assert!(server.socket_path().exists());
        assert_eq!(run.read_pid("ovsdb-server").await.unwrap(), pid);
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunDir::new(dir.path());
        let stale = run.ctl_socket("ovsdb-server", std::process::id());
        std::fs::write(&stale, "").unwrap();

        let server = ControlServer::bind(&run, "ovsdb-server", "3.3.0").await.unwrap();
        assert!(server.socket_path().exists());
    }

    #[tokio::test]
    async fn bind_fails_when_socket_path_is_unremovable() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunDir::new(dir.path());
        let blocked = run.ctl_socket("ovsdb-server", std::process::id());
        std::fs::create_dir(&blocked).unwrap();

        let err = ControlServer::bind(&run, "ovsdb-server", "3.3.0").await.err().unwrap();
        match err {
            ControlError::Io(e) => assert_ne!(e.kind(), io::ErrorKind::NotFound),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!run.pid_file("ovsdb-server").exists());
    }

    #[tokio::test]
    async fn external_shutdown_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunDir::new(dir.path());
        let server = ControlServer::bind(&run, "ovsdb-server", "3.3.0").await.unwrap();
        let socket = server.socket_path().to_path_buf();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        server.serve(shutdown).await.unwrap();

        assert!(!socket.exists());
        assert!(!run.pid_file("ovsdb-server").exists());
    }
}
