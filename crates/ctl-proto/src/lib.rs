//! Framing for a daemon's control socket.
//!
//! Every request and reply is one frame:
//!
//! ```text
//! [u32 body length][u8 kind][u32 seq][payload]
//! ```
//!
//! Integers are big-endian. The body length counts kind, seq and payload.
//! A reply echoes the seq of the request it answers; requests never use 0.
//!
//! | Kind | Sent by | Message          | Payload               |
//! |------|---------|------------------|-----------------------|
//! | 0x01 | client  | `version`        | none                  |
//! | 0x02 | daemon  | `version_result` | `[u16 len][utf-8]`    |
//! | 0x03 | client  | `exit`           | none                  |
//! | 0x04 | daemon  | `exit_ack`       | none                  |
//! | 0xFF | daemon  | `error`          | `[u16 len][utf-8]`    |

use std::fmt;

/// Size of the length prefix.
pub const LEN_PREFIX: usize = 4;

/// Largest accepted body. Control traffic is a few bytes per call.
pub const MAX_BODY: usize = 1024 * 1024;

/// Kind byte plus seq.
const BODY_OVERHEAD: usize = 5;

const KIND_VERSION: u8 = 0x01;
const KIND_VERSION_RESULT: u8 = 0x02;
const KIND_EXIT: u8 = 0x03;
const KIND_EXIT_ACK: u8 = 0x04;
const KIND_ERROR: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    FrameTooLarge(usize),
    FrameTooShort(usize),
    BadText(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameTooLarge(len) => write!(f, "frame body of {len} bytes exceeds {MAX_BODY}"),
            Self::FrameTooShort(len) => write!(f, "frame body of {len} bytes is too short"),
            Self::BadText(why) => write!(f, "bad text payload: {why}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// One control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version,
    VersionResult(String),
    Exit,
    ExitAck,
    Error(String),
    /// A kind this side does not understand; kept so it can be answered.
    Unknown(u8),
}

impl Message {
    pub fn kind(&self) -> u8 {
        match self {
            Self::Version => KIND_VERSION,
            Self::VersionResult(_) => KIND_VERSION_RESULT,
            Self::Exit => KIND_EXIT,
            Self::ExitAck => KIND_EXIT_ACK,
            Self::Error(_) => KIND_ERROR,
            Self::Unknown(kind) => *kind,
        }
    }

    /// Name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::VersionResult(_) => "version_result",
            Self::Exit => "exit",
            Self::ExitAck => "exit_ack",
            Self::Error(_) => "error",
            Self::Unknown(_) => "unknown",
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::VersionResult(text) | Self::Error(text) => text_payload(text),
            Self::Version | Self::Exit | Self::ExitAck | Self::Unknown(_) => Vec::new(),
        }
    }

    fn parse(kind: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(match kind {
            KIND_VERSION => Self::Version,
            KIND_VERSION_RESULT => Self::VersionResult(parse_text(payload)?),
            KIND_EXIT => Self::Exit,
            KIND_EXIT_ACK => Self::ExitAck,
            KIND_ERROR => Self::Error(parse_text(payload)?),
            other => Self::Unknown(other),
        })
    }
}

/// A message tagged with its call's sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u32,
    pub message: Message,
}

impl Frame {
    pub fn new(seq: u32, message: Message) -> Self {
        Self { seq, message }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = self.message.payload();
        let body_len = BODY_OVERHEAD + payload.len();
        if body_len > MAX_BODY {
            return Err(ProtocolError::FrameTooLarge(body_len));
        }
        let mut out = Vec::with_capacity(LEN_PREFIX + body_len);
        out.extend_from_slice(&(body_len as u32).to_be_bytes());
        out.push(self.message.kind());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }
}

/// `[u16 len][utf-8]`, cut at a char boundary if longer than `u16::MAX`.
fn text_payload(text: &str) -> Vec<u8> {
    let mut end = text.len().min(usize::from(u16::MAX));
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let kept = text.as_bytes().get(..end).unwrap_or_default();
    let mut out = Vec::with_capacity(2 + kept.len());
    out.extend_from_slice(&(kept.len() as u16).to_be_bytes());
    out.extend_from_slice(kept);
    out
}

fn parse_text(payload: &[u8]) -> Result<String, ProtocolError> {
    let (len, rest) = payload
        .split_first_chunk::<2>()
        .ok_or(ProtocolError::BadText("missing length"))?;
    let text = rest
        .get(..usize::from(u16::from_be_bytes(*len)))
        .ok_or(ProtocolError::BadText("truncated"))?;
    String::from_utf8(text.to_vec()).map_err(|_| ProtocolError::BadText("not utf-8"))
}

/// Reassembles frames from a byte stream delivered in arbitrary chunks.
#[derive(Debug, Default)]
pub struct FrameReader {
    pending: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket.
    pub fn feed(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Pop the next complete frame, or `None` until more bytes arrive.
    ///
    /// A length outside the accepted range poisons the stream: buffered
    /// bytes are discarded and an error is returned.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let Some(prefix) = self.pending.first_chunk::<LEN_PREFIX>() else {
            return Ok(None);
        };
        let body_len = u32::from_be_bytes(*prefix) as usize;
        if body_len > MAX_BODY {
            self.pending.clear();
            return Err(ProtocolError::FrameTooLarge(body_len));
        }
        if body_len < BODY_OVERHEAD {
            self.pending.clear();
            return Err(ProtocolError::FrameTooShort(body_len));
        }

        let frame_len = LEN_PREFIX + body_len;
        let Some(body) = self.pending.get(LEN_PREFIX..frame_len) else {
            return Ok(None);
        };
        let parsed = match body.split_first() {
            Some((&kind, rest)) => match rest.split_first_chunk::<4>() {
                Some((seq, payload)) => Message::parse(kind, payload)
                    .map(|message| Frame::new(u32::from_be_bytes(*seq), message)),
                None => Err(ProtocolError::FrameTooShort(body_len)),
            },
            None => Err(ProtocolError::FrameTooShort(body_len)),
        };
        self.pending.drain(..frame_len);
        parsed.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(reader: &mut FrameReader) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = reader.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn exit_ack_wire_bytes() {
        let bytes = Frame::new(7, Message::ExitAck).to_bytes().unwrap();
        assert_eq!(bytes, [0, 0, 0, 5, 0x04, 0, 0, 0, 7]);
    }

    #[test]
    fn version_result_wire_bytes() {
        let bytes = Frame::new(1, Message::VersionResult("3.3".into()))
            .to_bytes()
            .unwrap();
        assert_eq!(bytes, [0, 0, 0, 10, 0x02, 0, 0, 0, 1, 0, 3, b'3', b'.', b'3']);
    }

    #[test]
    fn frame_split_across_reads() {
        let bytes = Frame::new(9, Message::Exit).to_bytes().unwrap();
        let mut reader = FrameReader::new();

        reader.feed(&bytes[..3]);
        assert_eq!(reader.next_frame().unwrap(), None);
        reader.feed(&bytes[3..6]);
        assert_eq!(reader.next_frame().unwrap(), None);
        reader.feed(&bytes[6..]);
        assert_eq!(
            reader.next_frame().unwrap(),
            Some(Frame::new(9, Message::Exit))
        );
        assert_eq!(reader.next_frame().unwrap(), None);
    }

    #[test]
    fn several_frames_in_one_read() {
        let mut bytes = Frame::new(1, Message::Version).to_bytes().unwrap();
        bytes.extend(
            Frame::new(1, Message::VersionResult("2.17.9\n".into()))
                .to_bytes()
                .unwrap(),
        );
        bytes.extend(Frame::new(2, Message::Error("nope".into())).to_bytes().unwrap());

        let mut reader = FrameReader::new();
        reader.feed(&bytes);
        assert_eq!(
            drain(&mut reader),
            [
                Frame::new(1, Message::Version),
                Frame::new(1, Message::VersionResult("2.17.9\n".into())),
                Frame::new(2, Message::Error("nope".into())),
            ]
        );
    }

    #[test]
    fn unknown_kind_is_preserved() {
        let mut reader = FrameReader::new();
        reader.feed(&[0, 0, 0, 5, 0x42, 0, 0, 0, 3]);
        assert_eq!(
            reader.next_frame().unwrap(),
            Some(Frame::new(3, Message::Unknown(0x42)))
        );
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut reader = FrameReader::new();
        reader.feed(&(2 * 1024 * 1024_u32).to_be_bytes());
        assert!(matches!(
            reader.next_frame(),
            Err(ProtocolError::FrameTooLarge(_))
        ));
        // The poisoned bytes are gone.
        assert_eq!(reader.next_frame().unwrap(), None);
    }

    #[test]
    fn undersized_length_is_rejected() {
        let mut reader = FrameReader::new();
        reader.feed(&2_u32.to_be_bytes());
        assert_eq!(reader.next_frame(), Err(ProtocolError::FrameTooShort(2)));
    }

    #[test]
    fn bad_text_consumes_the_frame() {
        let mut reader = FrameReader::new();
        // version_result claiming 200 bytes of text but carrying none
        reader.feed(&[0, 0, 0, 7, 0x02, 0, 0, 0, 1, 0, 200]);
        reader.feed(&Frame::new(2, Message::ExitAck).to_bytes().unwrap());
        assert_eq!(
            reader.next_frame(),
            Err(ProtocolError::BadText("truncated"))
        );
        assert_eq!(
            reader.next_frame().unwrap(),
            Some(Frame::new(2, Message::ExitAck))
        );
    }

    #[test]
    fn long_text_is_cut_on_char_boundary() {
        // 'é' is two bytes; 40_000 of them straddle the u16 limit.
        let long = "é".repeat(40_000);
        let bytes = Frame::new(1, Message::Error(long)).to_bytes().unwrap();
        let mut reader = FrameReader::new();
        reader.feed(&bytes);
        let Some(Frame {
            message: Message::Error(text),
            ..
        }) = reader.next_frame().unwrap()
        else {
            panic!("expected an error frame");
        };
        assert_eq!(text.len(), 65_534);
        assert!(text.chars().all(|c| c == 'é'));
    }

    #[test]
    fn names() {
        assert_eq!(Message::Version.name(), "version");
        assert_eq!(Message::ExitAck.name(), "exit_ack");
        assert_eq!(Message::Unknown(0x42).name(), "unknown");
        assert_eq!(Message::Unknown(0x42).kind(), 0x42);
    }
}
