//! Cellblock Client Library
//!
//! Async client for the cellblockd control socket: launching and signalling
//! instances, listing them, attaching consoles, uploading builds and running
//! generic commands.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::debug;

use cellblock_common::argv::{self, ArgvError};
use cellblock_common::manifest::{BuildStage, BuildStep};
use cellblock_common::protocol::{
    decode_header, BuildContextHeader, CommandDone, ConsoleConnect, Frame, GenericCommand,
    InstanceEntry, LaunchRequest, ProtocolError, Response, SessionDone, SignalRequest, Tag,
    WindowSize, FRAME_HEADER_LEN,
};

pub const DEFAULT_SOCK: &str = "/var/run/cellblock.sock";

/// Ctrl-Q. Typing it in a console session detaches instead of being sent.
pub const DETACH_KEY: u8 = 0x11;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("disconnected")]
    Disconnected,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("{message} (code {code})")]
    Daemon { code: i32, message: String },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Arguments(#[from] ArgvError),
    #[error("daemon not available: {0}")]
    DaemonUnavailable(#[source] io::Error),
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Read one frame; `None` on a clean close between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>, ProtocolError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed inside frame header",
            )));
        }
        filled += n;
    }
    let (tag, len) = decode_header(&header)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(Frame::new(tag, body)))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError> {
    writer.write_all(&frame.to_bytes()?).await?;
    writer.flush().await?;
    Ok(())
}

async fn expect_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    read_frame(reader).await?.ok_or(ClientError::Disconnected)
}

fn check(response: Response) -> Result<String> {
    if response.is_ok() {
        Ok(response.message)
    } else {
        Err(ClientError::Daemon {
            code: response.code,
            message: response.message,
        })
    }
}

async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let frame = expect_frame(reader).await?;
    check(frame.decode(Tag::Response)?)
}

/// Output and exit status of a generic command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    pub status: i32,
    pub output: Vec<u8>,
}

/// Client for one cellblockd socket. Every request opens its own connection.
#[derive(Debug, Clone)]
pub struct CellblockClient {
    sock_path: PathBuf,
}

impl CellblockClient {
    pub fn new<P: AsRef<Path>>(sock: P) -> Self {
        Self {
            sock_path: sock.as_ref().to_path_buf(),
        }
    }

    pub fn sock_path(&self) -> &Path {
        &self.sock_path
    }

    async fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.sock_path)
            .await
            .map_err(ClientError::DaemonUnavailable)
    }

    /// Launch an instance of `request.image`. Returns the new instance id.
    pub async fn launch(&self, request: &LaunchRequest) -> Result<String> {
        let mut stream = self.connect().await?;
        write_frame(&mut stream, &Frame::json(Tag::LaunchInstance, request)?).await?;
        let id = read_response(&mut stream).await?;
        debug!(instance = %id, image = %request.image, "launched instance");
        Ok(id)
    }

    pub async fn list_instances(&self) -> Result<Vec<InstanceEntry>> {
        let mut stream = self.connect().await?;
        write_frame(&mut stream, &Frame::empty(Tag::GetInstances)).await?;
        let frame = expect_frame(&mut stream).await?;
        match frame.tag {
            Tag::InstanceList => Ok(frame.decode(Tag::InstanceList)?),
            Tag::Response => {
                check(frame.decode(Tag::Response)?)?;
                Err(ClientError::InvalidResponse(
                    "status response instead of a listing".into(),
                ))
            }
            other => Err(ClientError::InvalidResponse(format!("{:?} frame", other))),
        }
    }

    /// Deliver `signal` (TERM, KILL or HUP) to an instance.
    pub async fn signal(&self, instance: &str, signal: i32) -> Result<String> {
        let mut stream = self.connect().await?;
        let request = SignalRequest {
            instance: instance.to_string(),
            signal,
        };
        write_frame(&mut stream, &Frame::json(Tag::SignalInstance, &request)?).await?;
        read_response(&mut stream).await
    }

    /// Attach a console. Fails if the instance is unknown or already has
    /// a console attached.
    pub async fn console(&self, request: &ConsoleConnect) -> Result<ConsoleSession> {
        let stream = self.connect().await?;
        let (mut reader, mut writer) = stream.into_split();
        write_frame(&mut writer, &Frame::json(Tag::ConsoleConnect, request)?).await?;
        let id = read_response(&mut reader).await?;
        Ok(ConsoleSession {
            instance: id,
            output: ConsoleOutput { reader },
            input: ConsoleInput {
                writer,
                detached: false,
            },
        })
    }

    /// Upload a build: header, stage list, step list, then the raw context
    /// archive. Returns the build instance id.
    pub async fn send_build(
        &self,
        mut header: BuildContextHeader,
        stages: &[BuildStage],
        steps: &[BuildStep],
        context: &[u8],
    ) -> Result<String> {
        header.n_stages = stages.len();
        header.n_steps = steps.len();
        header.context_size = context.len() as u64;

        let mut stream = self.connect().await?;
        write_frame(&mut stream, &Frame::json(Tag::SendBuildCtx, &header)?).await?;
        write_frame(&mut stream, &Frame::json(Tag::SendBuildCtx, &stages)?).await?;
        write_frame(&mut stream, &Frame::json(Tag::SendBuildCtx, &steps)?).await?;
        stream
            .write_all(context)
            .await
            .map_err(ProtocolError::from)?;
        read_response(&mut stream).await
    }

    /// Run a whitelisted generic command and collect its output.
    pub async fn generic_command<S: AsRef<str>>(
        &self,
        name: &str,
        args: &[S],
        verbose: bool,
    ) -> Result<CommandOutcome> {
        let block = argv::marshal(args)?;
        let request = GenericCommand {
            name: name.to_string(),
            // marshal caps the block at MAX_ARGS_LEN
            args_len: block.len() as u32,
            verbose,
        };

        let mut stream = self.connect().await?;
        write_frame(&mut stream, &Frame::json(Tag::GenericCommand, &request)?).await?;
        stream.write_all(&block).await.map_err(ProtocolError::from)?;

        let mut outcome = CommandOutcome::default();
        loop {
            let frame = expect_frame(&mut stream).await?;
            match frame.tag {
                Tag::CommandOutput => outcome.output.extend_from_slice(&frame.body),
                Tag::CommandDone => {
                    let done: CommandDone = frame.decode(Tag::CommandDone)?;
                    outcome.status = done.status;
                    return Ok(outcome);
                }
                Tag::Response => {
                    check(frame.decode(Tag::Response)?)?;
                    return Err(ClientError::InvalidResponse(
                        "success response instead of command output".into(),
                    ));
                }
                other => {
                    return Err(ClientError::InvalidResponse(format!("{:?} frame", other)));
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    Output(Vec<u8>),
    /// The instance exited. Build sessions carry the build status.
    Done(Option<i32>),
}

/// An attached console. Split it to read and write from separate tasks.
#[derive(Debug)]
pub struct ConsoleSession {
    instance: String,
    output: ConsoleOutput,
    input: ConsoleInput,
}

impl ConsoleSession {
    /// Full id of the attached instance.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub async fn next_event(&mut self) -> Result<Option<ConsoleEvent>> {
        self.output.next_event().await
    }

    pub async fn send_input(&mut self, bytes: &[u8]) -> Result<bool> {
        self.input.send_input(bytes).await
    }

    pub async fn resize(&mut self, window: WindowSize) -> Result<()> {
        self.input.resize(window).await
    }

    pub async fn detach(self) -> Result<()> {
        self.input.detach().await
    }

    pub fn split(self) -> (ConsoleOutput, ConsoleInput) {
        (self.output, self.input)
    }
}

#[derive(Debug)]
pub struct ConsoleOutput {
    reader: OwnedReadHalf,
}

impl ConsoleOutput {
    /// Next backlog or live output chunk, or the end of the session.
    /// `None` once the daemon has closed the connection.
    pub async fn next_event(&mut self) -> Result<Option<ConsoleEvent>> {
        let Some(frame) = read_frame(&mut self.reader).await? else {
            return Ok(None);
        };
        match frame.tag {
            Tag::ConsoleToClient => Ok(Some(ConsoleEvent::Output(frame.body))),
            Tag::ConsoleSessionDone => {
                let done: SessionDone = frame.decode(Tag::ConsoleSessionDone)?;
                Ok(Some(ConsoleEvent::Done(done.status)))
            }
            other => Err(ClientError::InvalidResponse(format!("{:?} frame", other))),
        }
    }
}

#[derive(Debug)]
pub struct ConsoleInput {
    writer: OwnedWriteHalf,
    detached: bool,
}

impl ConsoleInput {
    /// Forward keystrokes. Bytes before a [`DETACH_KEY`] are sent, then the
    /// connection is closed. Returns `false` once detached.
    pub async fn send_input(&mut self, bytes: &[u8]) -> Result<bool> {
        if self.detached {
            return Ok(false);
        }
        let (keep, detach) = match bytes.iter().position(|b| *b == DETACH_KEY) {
            Some(pos) => (&bytes[..pos], true),
            None => (bytes, false),
        };
        if !keep.is_empty() {
            write_frame(&mut self.writer, &Frame::new(Tag::ConsoleData, keep.to_vec())).await?;
        }
        if detach {
            self.close().await?;
            return Ok(false);
        }
        Ok(true)
    }

    pub async fn resize(&mut self, window: WindowSize) -> Result<()> {
        if self.detached {
            return Err(ClientError::Disconnected);
        }
        write_frame(&mut self.writer, &Frame::json(Tag::ConsoleResize, &window)?).await?;
        Ok(())
    }

    pub async fn detach(mut self) -> Result<()> {
        self.close().await
    }

    async fn close(&mut self) -> Result<()> {
        self.detached = true;
        self.writer.shutdown().await.map_err(ProtocolError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    fn socket() -> (tempfile::TempDir, PathBuf, UnixListener) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cb.sock");
        let listener = UnixListener::bind(&path).unwrap();
        (dir, path, listener)
    }

    #[tokio::test]
    async fn launch_returns_the_instance_id() {
        let (_dir, path, listener) = socket();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut stream).await.unwrap().unwrap();
            let request: LaunchRequest = frame.decode(Tag::LaunchInstance).unwrap();
            assert_eq!(request.image, "alpine");
            let reply = Frame::json(Tag::Response, &Response::ok("f".repeat(64))).unwrap();
            write_frame(&mut stream, &reply).await.unwrap();
        });

        let client = CellblockClient::new(&path);
        let request = LaunchRequest {
            image: "alpine".into(),
            ..Default::default()
        };
        assert_eq!(client.launch(&request).await.unwrap(), "f".repeat(64));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn daemon_errors_carry_code_and_message() {
        let (_dir, path, listener) = socket();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_frame(&mut stream).await.unwrap().unwrap();
            let reply = Frame::json(
                Tag::Response,
                &Response::error(2, "0123456789 invalid container"),
            )
            .unwrap();
            write_frame(&mut stream, &reply).await.unwrap();
        });

        let err = CellblockClient::new(&path)
            .signal("0123456789", 15)
            .await
            .unwrap_err();
        match err {
            ClientError::Daemon { code, message } => {
                assert_eq!(code, 2);
                assert_eq!(message, "0123456789 invalid container");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn detach_key_closes_instead_of_sending() {
        let (_dir, path, listener) = socket();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_frame(&mut stream).await.unwrap().unwrap();
            let reply = Frame::json(Tag::Response, &Response::ok("a".repeat(64))).unwrap();
            write_frame(&mut stream, &reply).await.unwrap();

            let data = read_frame(&mut stream).await.unwrap().unwrap();
            assert_eq!(data.tag, Tag::ConsoleData);
            assert_eq!(data.body, b"ls");
            assert!(read_frame(&mut stream).await.unwrap().is_none());
        });

        let client = CellblockClient::new(&path);
        let mut session = client
            .console(&ConsoleConnect {
                instance: "aaaaaaaaaa".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(session.instance(), "a".repeat(64));
        assert!(!session.send_input(&[b'l', b's', DETACH_KEY, b'x']).await.unwrap());
        assert!(!session.send_input(b"more").await.unwrap());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn generic_output_is_collected() {
        let (_dir, path, listener) = socket();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut stream).await.unwrap().unwrap();
            let request: GenericCommand = frame.decode(Tag::GenericCommand).unwrap();
            let mut block = vec![0u8; request.args_len as usize];
            stream.read_exact(&mut block).await.unwrap();
            assert_eq!(argv::unmarshal(&block).unwrap(), vec!["-l".to_string()]);

            for chunk in [&b"alpine\n"[..], &b"freebsd\n"[..]] {
                write_frame(&mut stream, &Frame::new(Tag::CommandOutput, chunk.to_vec()))
                    .await
                    .unwrap();
            }
            let done = Frame::json(Tag::CommandDone, &CommandDone { status: 0 }).unwrap();
            write_frame(&mut stream, &done).await.unwrap();
        });

        let outcome = CellblockClient::new(&path)
            .generic_command("image_list", &["-l"], false)
            .await
            .unwrap();
        assert_eq!(outcome.status, 0);
        assert_eq!(outcome.output, b"alpine\nfreebsd\n");
    }

    #[tokio::test]
    async fn missing_daemon_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = CellblockClient::new(dir.path().join("absent.sock"))
            .list_instances()
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::DaemonUnavailable(_)));
    }
}
