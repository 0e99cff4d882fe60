//! Console sessions: attaching a client socket to an instance's pty.
//!
//! The connect path locks the new peer's writer before publishing it in the
//! registry critical section that flips CONNECTED, and sends the backlog
//! before releasing it. Live output from the poll thread waits on that same
//! lock, so the backlog always reaches the client first. No thread waits on
//! a peer lock while holding the registry lock.

use std::fs::File;
use std::io::{self, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use cellblock_common::protocol::{
    read_frame, write_frame, ConsoleConnect, Frame, InstanceKind, Response, SessionDone, Tag,
    WindowSize,
};

use crate::daemon::Daemon;
use crate::dispatch::Flow;
use crate::error::InstanceError;
use crate::instance::{short_id, Peer};
use crate::pty;
use crate::reaper;

/// A client that stops reading is dropped after this long.
const PEER_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const PTY_WRITE_RETRY: Duration = Duration::from_millis(10);

fn lock_peer(peer: &Peer) -> MutexGuard<'_, UnixStream> {
    peer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Push live pty output to an attached client. A failed write ends the
/// session by shutting the socket down.
pub fn forward_output(peer: &Peer, bytes: &[u8]) {
    let frame = Frame::new(Tag::ConsoleToClient, bytes.to_vec());
    let mut stream = lock_peer(peer);
    if let Err(err) = write_frame(&mut *stream, &frame) {
        debug!(error = %err, "console peer write failed; closing session");
        let _ = stream.shutdown(Shutdown::Both);
    }
}

/// Unblock the session thread reading from `peer`.
pub fn wake(peer: &Peer) {
    let _ = lock_peer(peer).shutdown(Shutdown::Read);
}

struct Attached {
    id: String,
    pty: Option<Arc<File>>,
    backlog: Vec<u8>,
}

pub fn handle_connect(daemon: &Daemon, stream: &mut UnixStream, frame: Frame) -> Result<Flow> {
    let request: ConsoleConnect = frame.decode(Tag::ConsoleConnect)?;
    stream.set_write_timeout(Some(PEER_WRITE_TIMEOUT))?;
    let peer: Peer = Arc::new(Mutex::new(stream.try_clone()?));
    let mut writer = lock_peer(&peer);

    let attached = {
        let mut instances = daemon.registry.lock();
        match instances.find_mut(&request.instance) {
            None => Err(InstanceError::NotFound(request.instance.clone())),
            Some(inst) => {
                if inst.attach(peer.clone()) {
                    Ok(Attached {
                        id: inst.id.clone(),
                        pty: inst.pty.clone(),
                        backlog: inst.termbuf.to_contiguous(),
                    })
                } else {
                    Err(InstanceError::AlreadyAttached(request.instance.clone()))
                }
            }
        }
    };

    let attached = match attached {
        Ok(attached) => attached,
        Err(err) => {
            debug!(instance = %request.instance, error = %err, "console connect rejected");
            write_frame(&mut *writer, &Frame::json(Tag::Response, &err.to_response())?)?;
            return Ok(Flow::Close);
        }
    };

    if let Some(pty) = &attached.pty {
        if let Some(modes) = &request.modes {
            if let Err(err) = pty::apply_modes(pty, modes) {
                warn!(instance = short_id(&attached.id), error = %err, "failed to apply terminal modes");
            }
        }
        if let Some(window) = &request.window {
            if let Err(err) = pty::set_window_size(pty, window) {
                warn!(instance = short_id(&attached.id), error = %err, "failed to set window size");
            }
        }
    }

    let greeting = send_greeting(&mut writer, &attached);
    drop(writer);
    info!(instance = short_id(&attached.id), "console attached");

    match greeting {
        Ok(()) => relay(stream, attached.pty.as_deref(), &attached.id),
        Err(err) => debug!(error = %err, "failed to send console backlog"),
    }

    finish_session(daemon, &attached.id);
    Ok(Flow::Close)
}

fn send_greeting(writer: &mut UnixStream, attached: &Attached) -> Result<()> {
    write_frame(writer, &Frame::json(Tag::Response, &Response::ok(attached.id.clone()))?)?;
    if !attached.backlog.is_empty() {
        write_frame(
            writer,
            &Frame::new(Tag::ConsoleToClient, attached.backlog.clone()),
        )?;
    }
    Ok(())
}

/// Copy client keystrokes and resizes to the pty until the client goes
/// away or the session is woken by the reaper.
fn relay(stream: &mut UnixStream, pty: Option<&File>, id: &str) {
    loop {
        let frame = match read_frame(stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                debug!(instance = short_id(id), error = %err, "console read ended");
                break;
            }
        };
        let Some(pty) = pty else {
            continue;
        };
        match frame.tag {
            Tag::ConsoleData => {
                if let Err(err) = write_pty(pty, &frame.body) {
                    debug!(instance = short_id(id), error = %err, "pty write failed");
                    break;
                }
            }
            Tag::ConsoleResize => match frame.decode::<WindowSize>(Tag::ConsoleResize) {
                Ok(window) => {
                    if let Err(err) = pty::set_window_size(pty, &window) {
                        debug!(instance = short_id(id), error = %err, "resize failed");
                    }
                }
                Err(err) => warn!(instance = short_id(id), error = %err, "bad resize frame"),
            },
            other => {
                warn!(instance = short_id(id), tag = ?other, "unexpected frame in console session");
                break;
            }
        }
    }
}

/// The master is non-blocking; wait out a full input queue.
fn write_pty(pty: &File, mut bytes: &[u8]) -> io::Result<()> {
    let mut writer = pty;
    while !bytes.is_empty() {
        match writer.write(bytes) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => bytes = &bytes[n..],
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(PTY_WRITE_RETRY),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Detach the peer. If the instance died while attached, remove it, tell
/// the client the session is over and tear the instance down.
fn finish_session(daemon: &Daemon, id: &str) {
    let (peer, removed) = {
        let mut instances = daemon.registry.lock();
        let Some(inst) = instances.get_mut(id) else {
            return;
        };
        let peer = inst.detach();
        let removed = if inst.is_dead() {
            instances.remove(id)
        } else {
            None
        };
        (peer, removed)
    };

    let Some(instance) = removed else {
        info!(instance = short_id(id), "console detached");
        return;
    };

    if let Some(peer) = peer {
        let done = SessionDone {
            status: match instance.kind {
                InstanceKind::Build => Some(instance.exit_status.unwrap_or(-1)),
                InstanceKind::Regular => None,
            },
        };
        if let Err(err) = send_session_done(&peer, &done) {
            debug!(instance = short_id(id), error = %err, "failed to send session done");
        }
    }
    info!(instance = short_id(id), "console session finished; instance removed");
    reaper::teardown(daemon.backend.as_ref(), instance);
}

fn send_session_done(peer: &Peer, done: &SessionDone) -> Result<()> {
    let frame = Frame::json(Tag::ConsoleSessionDone, done)?;
    write_frame(&mut *lock_peer(peer), &frame)?;
    Ok(())
}
