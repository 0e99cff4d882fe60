//! Per-connection command loop and the request handlers that do not need a
//! module of their own.

use std::io::Read;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use cellblock_common::argv::{self, ArgvError};
use cellblock_common::protocol::{
    read_frame, write_frame, CommandDone, Frame, GenericCommand, InstanceKind, LaunchRequest,
    ProtocolError, Response, SignalRequest, Tag,
};

use crate::backend::{exit_code, generic_script};
use crate::build;
use crate::console;
use crate::daemon::Daemon;
use crate::error::InstanceError;
use crate::instance::generate_id;

/// Most instances a GET_INSTANCES reply carries.
pub const MAX_LISTED_INSTANCES: usize = 1024;
const OUTPUT_CHUNK: usize = 8192;

/// What the connection loop does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

pub fn send_response(stream: &mut UnixStream, response: &Response) -> Result<()> {
    write_frame(stream, &Frame::json(Tag::Response, response)?)?;
    Ok(())
}

/// Serve one client until it hangs up or a handler ends the connection.
pub fn serve_connection(daemon: Arc<Daemon>, mut stream: UnixStream) {
    debug!("accepted connection");
    loop {
        let frame = match read_frame(&mut stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("peer closed connection");
                break;
            }
            Err(ProtocolError::UnknownTag(tag)) => {
                warn!(tag, "unknown command; closing connection");
                break;
            }
            Err(err) => {
                debug!(error = %err, "failed to read command");
                break;
            }
        };

        let tag = frame.tag;
        match route(&daemon, &mut stream, frame) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close) => break,
            Err(err) => {
                let message = format!("{:#}", err);
                warn!(command = ?tag, error = %message, "request failed");
                break;
            }
        }
    }
}

fn route(daemon: &Daemon, stream: &mut UnixStream, frame: Frame) -> Result<Flow> {
    match frame.tag {
        Tag::LaunchInstance => handle_launch(daemon, stream, frame),
        Tag::SendBuildCtx => build::handle_build(daemon, stream, frame),
        Tag::ConsoleConnect => console::handle_connect(daemon, stream, frame),
        Tag::SignalInstance => handle_signal(daemon, stream, frame),
        Tag::GetInstances => handle_list(daemon, stream),
        Tag::GenericCommand => handle_generic(daemon, stream, frame),
        other => {
            warn!(command = ?other, "command not accepted from clients; closing connection");
            Ok(Flow::Close)
        }
    }
}

fn handle_launch(daemon: &Daemon, stream: &mut UnixStream, frame: Frame) -> Result<Flow> {
    let request: LaunchRequest = frame.decode(Tag::LaunchInstance)?;
    let id = generate_id();
    let command = daemon.backend.launch_command(&id, &request);
    let response = match daemon.spawn_instance(
        id,
        request.image.clone(),
        InstanceKind::Regular,
        command,
    ) {
        Ok(id) => Response::ok(id),
        Err(err) => {
            let message = format!("{:#}", err);
            warn!(image = %request.image, error = %message, "launch failed");
            Response::error(libc::EIO, message)
        }
    };
    send_response(stream, &response)?;
    Ok(Flow::Close)
}

/// Only TERM, KILL and HUP may be delivered to an instance.
fn allowed_signal(raw: i32) -> Option<Signal> {
    match Signal::try_from(raw).ok()? {
        sig @ (Signal::SIGTERM | Signal::SIGKILL | Signal::SIGHUP) => Some(sig),
        _ => None,
    }
}

fn handle_signal(daemon: &Daemon, stream: &mut UnixStream, frame: Frame) -> Result<Flow> {
    let request: SignalRequest = frame.decode(Tag::SignalInstance)?;
    let outcome = {
        let instances = daemon.registry.lock();
        // A dead instance stays registered until its console finishes, but
        // its pid has already been collected and may belong to someone else.
        match instances.find(&request.instance).filter(|inst| !inst.is_dead()) {
            None => Err(InstanceError::NotFound(request.instance.clone())),
            Some(inst) => match allowed_signal(request.signal) {
                None => Err(InstanceError::IllegalSignal(request.signal)),
                Some(sig) => {
                    // The reaper takes this lock before marking the instance
                    // dead, so a live pid cannot be recycled under us.
                    if let Err(err) = kill(Pid::from_raw(inst.pid as i32), sig) {
                        debug!(instance = inst.short_id(), error = %err, "kill failed");
                    }
                    info!(instance = inst.short_id(), signal = sig.as_str(), "signalled instance");
                    Ok(())
                }
            },
        }
    };

    let response = match outcome {
        Ok(()) => Response::ok(format!("OK {}", request.signal)),
        Err(err) => err.to_response(),
    };
    send_response(stream, &response)?;
    Ok(Flow::Close)
}

fn handle_list(daemon: &Daemon, stream: &mut UnixStream) -> Result<Flow> {
    let entries = daemon.registry.snapshot(MAX_LISTED_INSTANCES);
    write_frame(stream, &Frame::json(Tag::InstanceList, &entries)?)?;
    Ok(Flow::Continue)
}

fn handle_generic(daemon: &Daemon, stream: &mut UnixStream, frame: Frame) -> Result<Flow> {
    let request: GenericCommand = frame.decode(Tag::GenericCommand)?;
    let args_len = request.args_len as usize;
    if args_len > argv::MAX_ARGS_LEN {
        warn!(command = %request.name, args_len, "argument block too large; closing connection");
        send_response(
            stream,
            &InstanceError::from(ArgvError::TooLong(args_len)).to_response(),
        )?;
        // The unread block would be taken for the next command.
        return Ok(Flow::Close);
    }
    let mut block = vec![0u8; args_len];
    stream
        .read_exact(&mut block)
        .context("failed to read command arguments")?;

    let args = match argv::unmarshal(&block) {
        Ok(args) => args,
        Err(err) => {
            send_response(stream, &InstanceError::from(err).to_response())?;
            return Ok(Flow::Continue);
        }
    };
    let Some(script) = generic_script(&request.name) else {
        warn!(command = %request.name, "rejecting unknown generic command");
        send_response(
            stream,
            &InstanceError::UnknownCommand(request.name.clone()).to_response(),
        )?;
        return Ok(Flow::Continue);
    };

    info!(command = %request.name, args = args.len(), "running generic command");
    let status = run_generic(daemon, stream, script, &args, request.verbose)?;
    debug!(command = %request.name, status, "generic command finished");
    write_frame(stream, &Frame::json(Tag::CommandDone, &CommandDone { status })?)?;
    Ok(Flow::Continue)
}

/// Run a generic command script with stdout and stderr relayed to the peer
/// as COMMAND_OUTPUT frames. Returns the script's exit code.
fn run_generic(
    daemon: &Daemon,
    stream: &mut UnixStream,
    script: &str,
    args: &[String],
    verbose: bool,
) -> Result<i32> {
    let (mut output, writer) = UnixStream::pair().context("failed to create output channel")?;
    let stderr = writer.try_clone()?;
    let mut command = daemon.backend.generic_command(script, args, verbose);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::from(OwnedFd::from(writer)))
        .stderr(Stdio::from(OwnedFd::from(stderr)));
    let mut child = command
        .spawn()
        .with_context(|| format!("failed to run {}", script))?;
    // Release our copies of the write end so EOF arrives when the child exits.
    drop(command);

    let mut buf = [0u8; OUTPUT_CHUNK];
    let relayed: Result<()> = loop {
        match output.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => {
                let frame = Frame::new(Tag::CommandOutput, buf[..n].to_vec());
                if let Err(err) = write_frame(stream, &frame) {
                    break Err(err.into());
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => break Err(err.into()),
        }
    };
    if relayed.is_err() {
        let _ = child.kill();
    }
    let status = exit_code(child.wait()?);
    relayed.map(|()| status)
}
