//! Client side of a daemon's control endpoint.
//!
//! ## Connection Flow
//!
//! 1. Read `<binary>.pid` from the run directory (absent: no running peer)
//! 2. Connect to `<binary>.<pid>.ctl`
//! 3. Issue `version` / `exit` calls, each a single request/response pair
//!    matched by sequence number

use std::path::Path;
use std::time::Duration;

use ctl_proto::{Frame, FrameReader, Message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ControlError, Result};
use crate::paths::RunDir;

const READ_CHUNK: usize = 4 * 1024;

/// Default per-call deadline (connect, version, exit).
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Request/response channel to a running daemon.
///
/// A call abandoned by timeout or cancellation leaves the stream at an
/// unknown frame boundary, so the connection is dropped and later calls
/// fail with [`ControlError::Closed`].
pub struct ControlClient {
    stream: Option<UnixStream>,
    reader: FrameReader,
    next_seq: u32,
    timeout: Duration,
}

impl ControlClient {
    /// Connect to a control socket. `timeout` bounds the connect and
    /// becomes the per-call deadline of the returned client.
    pub async fn dial(path: &Path, timeout: Duration, cancel: &CancellationToken) -> Result<Self> {
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ControlError::Cancelled("connect")),
            r = tokio::time::timeout(timeout, UnixStream::connect(path)) => {
                r.map_err(|_| ControlError::Timeout { op: "connect", timeout })??
            }
        };
        debug!(path = %path.display(), "connected to control socket");
        Ok(Self::from_stream(stream).with_timeout(timeout))
    }

    /// Locate the running instance of `binary` through its pid file and
    /// connect to its per-pid control socket.
    ///
    /// Returns [`ControlError::NoPidFile`] when nothing is running.
    pub async fn dial_binary(
        run_dir: &RunDir,
        binary: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let pid = run_dir.read_pid(binary).await?;
        Self::dial(&run_dir.ctl_socket(binary, pid), timeout, cancel).await
    }

    pub(crate) fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream: Some(stream),
            reader: FrameReader::new(),
            next_seq: 1,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Override the per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Ask the daemon for its version string.
    pub async fn query_version(&mut self, cancel: &CancellationToken) -> Result<String> {
        match self.call(Message::Version, "version", cancel).await? {
            Message::VersionResult(version) => Ok(version),
            other => Err(unexpected("version", other)),
        }
    }

    /// Ask the daemon to exit gracefully.
    ///
    /// Success means the request was acknowledged, not that the daemon is
    /// gone; release of its resources is confirmed separately.
    pub async fn request_exit(&mut self, cancel: &CancellationToken) -> Result<()> {
        match self.call(Message::Exit, "exit", cancel).await? {
            Message::ExitAck => Ok(()),
            other => Err(unexpected("exit", other)),
        }
    }

    /// Release the connection. Calling it again is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            match stream.shutdown().await {
                Ok(()) => {}
                // Peer already went away (typical right after `exit`).
                Err(e) if e.kind() == std::io::ErrorKind::NotConnected => {}
                Err(e) => return Err(ControlError::Io(e)),
            }
        }
        Ok(())
    }

    /// Sequence numbers start at 1 and skip 0 on wrap-around.
    fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.checked_add(1).unwrap_or(1);
        seq
    }

    /// One request/response exchange bounded by the call timeout and
    /// `cancel`.
    async fn call(
        &mut self,
        request: Message,
        op: &'static str,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        let timeout = self.timeout;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ControlError::Cancelled(op)),
            r = tokio::time::timeout(timeout, self.round_trip(request)) => {
                r.unwrap_or(Err(ControlError::Timeout { op, timeout }))
            }
        };
        if let Err(ControlError::Cancelled(_) | ControlError::Timeout { .. }) = &result {
            self.stream = None;
        }
        result
    }

    async fn round_trip(&mut self, request: Message) -> Result<Message> {
        let seq = self.next_seq();
        let bytes = Frame::new(seq, request).to_bytes()?;

        let Self { stream, reader, .. } = self;
        let stream = stream.as_mut().ok_or(ControlError::Closed)?;
        stream.write_all(&bytes).await?;

        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            while let Some(frame) = reader.next_frame()? {
                if frame.seq == seq {
                    return match frame.message {
                        Message::Error(reason) => Err(ControlError::Remote(reason)),
                        message => Ok(message),
                    };
                }
                debug!(seq = frame.seq, message = frame.message.name(), "skipping stale reply");
            }
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ControlError::Closed);
            }
            reader.feed(chunk.get(..n).unwrap_or_default());
        }
    }
}

fn unexpected(request: &'static str, response: Message) -> ControlError {
    ControlError::UnexpectedResponse {
        request,
        response: response.name(),
    }
}
