//! Wire protocol spoken between cellblockd and its clients.
//!
//! Every frame is an 8-byte header (big-endian command tag, big-endian body
//! length) followed by the body. Structured bodies are JSON; console and
//! command output frames carry raw bytes.

use std::io::{self, Read, Write};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::manifest::{BuildStage, BuildStep};

pub const FRAME_HEADER_LEN: usize = 8;
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;
/// Upper bound on the message carried by a [`Response`].
pub const MAX_ERR_BUF: usize = 512;
pub const MAX_BUILD_STAGES: usize = 64;
pub const MAX_BUILD_STEPS: usize = 1024;

/// Command tags. Gaps in the numbering are retired commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Tag {
    LaunchInstance = 1,
    ConsoleConnect = 2,
    ConsoleData = 3,
    ConsoleResize = 4,
    SendBuildCtx = 5,
    ConsoleToClient = 7,
    ConsoleSessionDone = 8,
    GetInstances = 9,
    GenericCommand = 10,
    SignalInstance = 12,
    Response = 13,
    InstanceList = 14,
    CommandOutput = 15,
    CommandDone = 16,
}

impl Tag {
    pub fn from_u32(raw: u32) -> Option<Self> {
        let tag = match raw {
            1 => Tag::LaunchInstance,
            2 => Tag::ConsoleConnect,
            3 => Tag::ConsoleData,
            4 => Tag::ConsoleResize,
            5 => Tag::SendBuildCtx,
            7 => Tag::ConsoleToClient,
            8 => Tag::ConsoleSessionDone,
            9 => Tag::GetInstances,
            10 => Tag::GenericCommand,
            12 => Tag::SignalInstance,
            13 => Tag::Response,
            14 => Tag::InstanceList,
            15 => Tag::CommandOutput,
            16 => Tag::CommandDone,
            _ => return None,
        };
        Some(tag)
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("frame body of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),
    #[error("unknown command tag {0}")]
    UnknownTag(u32),
    #[error("expected {expected:?} frame, got {got:?}")]
    UnexpectedTag { expected: Tag, got: Tag },
    #[error("malformed {what} body: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode frame body: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: Tag,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(tag: Tag, body: Vec<u8>) -> Self {
        Self { tag, body }
    }

    pub fn empty(tag: Tag) -> Self {
        Self::new(tag, Vec::new())
    }

    pub fn json<T: Serialize>(tag: Tag, value: &T) -> Result<Self, ProtocolError> {
        let body = serde_json::to_vec(value).map_err(ProtocolError::Encode)?;
        Ok(Self::new(tag, body))
    }

    /// Decode the JSON body of a frame, checking it carries the expected tag.
    pub fn decode<T: DeserializeOwned>(&self, expected: Tag) -> Result<T, ProtocolError> {
        if self.tag != expected {
            return Err(ProtocolError::UnexpectedTag {
                expected,
                got: self.tag,
            });
        }
        serde_json::from_slice(&self.body).map_err(|source| ProtocolError::Decode {
            what: std::any::type_name::<T>(),
            source,
        })
    }

    /// Header followed by body, ready for a single `write_all`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let header = encode_header(self.tag, self.body.len())?;
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.body.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.body);
        Ok(out)
    }
}

pub fn encode_header(tag: Tag, len: usize) -> Result<[u8; FRAME_HEADER_LEN], ProtocolError> {
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[..4].copy_from_slice(&tag.as_u32().to_be_bytes());
    header[4..].copy_from_slice(&(len as u32).to_be_bytes());
    Ok(header)
}

pub fn decode_header(header: &[u8; FRAME_HEADER_LEN]) -> Result<(Tag, usize), ProtocolError> {
    let raw_tag = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let tag = Tag::from_u32(raw_tag).ok_or(ProtocolError::UnknownTag(raw_tag))?;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok((tag, len))
}

/// Read one frame. `Ok(None)` means the peer closed the stream cleanly
/// between frames.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>, ProtocolError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(ProtocolError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed inside frame header",
                )))
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }

    let (tag, len) = decode_header(&header)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(Frame { tag, body }))
}

pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError> {
    writer.write_all(&frame.to_bytes()?)?;
    writer.flush()?;
    Ok(())
}

/// Status reply sent for most requests. `code == 0` is success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub code: i32,
    pub message: String,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(0, message)
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self::new(code, message)
    }

    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: truncate_message(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// Clip a message to [`MAX_ERR_BUF`] bytes without splitting a character.
pub fn truncate_message(mut message: String) -> String {
    if message.len() > MAX_ERR_BUF {
        let mut end = MAX_ERR_BUF;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub image: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub term: String,
    #[serde(default)]
    pub volumes: Option<String>,
    #[serde(default)]
    pub ports: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub entry_args: Vec<String>,
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    #[serde(default)]
    pub xpixel: u16,
    #[serde(default)]
    pub ypixel: u16,
}

/// Raw termios flag words captured from the client's terminal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalModes {
    pub input_flags: u64,
    pub output_flags: u64,
    pub control_flags: u64,
    pub local_flags: u64,
    #[serde(default)]
    pub control_chars: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleConnect {
    pub instance: String,
    #[serde(default)]
    pub term: String,
    #[serde(default)]
    pub window: Option<WindowSize>,
    #[serde(default)]
    pub modes: Option<TerminalModes>,
}

/// Final frame of a console session. Build sessions carry the exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDone {
    pub status: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRequest {
    pub instance: String,
    pub signal: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    Regular,
    Build,
}

impl InstanceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceKind::Regular => "regular",
            InstanceKind::Build => "build",
        }
    }
}

/// One row of a GET_INSTANCES listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceEntry {
    pub id: String,
    pub image: String,
    pub tty: String,
    pub pid: u32,
    pub kind: InstanceKind,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericCommand {
    pub name: String,
    /// Length of the NUL-marshalled argument block that follows the header.
    /// At most [`crate::argv::MAX_ARGS_LEN`].
    pub args_len: u32,
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDone {
    pub status: i32,
}

/// First frame of SEND_BUILD_CTX. The stage list, step list and the raw
/// context archive follow it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildContextHeader {
    pub image: String,
    #[serde(default)]
    pub tag: String,
    pub n_stages: usize,
    pub n_steps: usize,
    pub context_size: u64,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub entry_args: Option<String>,
    #[serde(default)]
    pub os_release: Option<String>,
    #[serde(default)]
    pub term: String,
    /// Have the commit script record a file integrity baseline.
    #[serde(default)]
    pub fim_spec: bool,
}

pub type StageList = Vec<BuildStage>;
pub type StepList = Vec<BuildStep>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_are_read_back_in_order() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &Frame::new(Tag::ConsoleData, b"ls\n".to_vec())).unwrap();
        write_frame(&mut wire, &Frame::empty(Tag::GetInstances)).unwrap();

        assert_eq!(&wire[..4], &3u32.to_be_bytes());
        assert_eq!(&wire[4..8], &3u32.to_be_bytes());

        let mut cursor = Cursor::new(wire);
        let first = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(first.tag, Tag::ConsoleData);
        assert_eq!(first.body, b"ls\n");
        let second = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(second.tag, Tag::GetInstances);
        assert!(second.body.is_empty());
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[..4].copy_from_slice(&6u32.to_be_bytes());
        let err = read_frame(&mut Cursor::new(header.to_vec())).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTag(6)));
    }

    #[test]
    fn oversized_frames_are_rejected_before_allocation() {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[..4].copy_from_slice(&Tag::ConsoleData.as_u32().to_be_bytes());
        header[4..].copy_from_slice(&u32::MAX.to_be_bytes());
        let err = read_frame(&mut Cursor::new(header.to_vec())).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(_)));
    }

    #[test]
    fn truncated_header_is_an_error() {
        let err = read_frame(&mut Cursor::new(vec![0u8, 0, 0])).unwrap_err();
        match err {
            ProtocolError::Io(io) => assert_eq!(io.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn decode_checks_tag() {
        let frame = Frame::json(Tag::Response, &Response::ok("abc")).unwrap();
        let err = frame.decode::<Response>(Tag::CommandDone).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedTag { .. }));
        let resp: Response = frame.decode(Tag::Response).unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.message, "abc");
    }

    #[test]
    fn response_messages_are_clipped_on_char_boundary() {
        let long = "é".repeat(MAX_ERR_BUF);
        let resp = Response::error(1, long);
        assert!(resp.message.len() <= MAX_ERR_BUF);
        assert!(resp.message.chars().all(|c| c == 'é'));
    }
}
