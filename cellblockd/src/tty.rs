//! The TTY poll loop: one thread reading every live pty into its ring buffer
//! and forwarding the bytes to an attached console.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, warn};

use crate::console;
use crate::daemon::Daemon;
use crate::reaper;

pub const POLL_TIMEOUT_MS: u16 = 500;
const READ_CHUNK: usize = 8192;
/// Reads per drain call, so one chatty instance cannot starve the rest.
const MAX_READS_PER_DRAIN: usize = 64;

/// Read what is currently buffered on a non-blocking pty and hand each read
/// to `sink`. Returns `true` once the slave side has hung up.
pub fn drain_pty(pty: &File, mut sink: impl FnMut(&[u8])) -> bool {
    let mut reader = pty;
    let mut buf = [0u8; READ_CHUNK];
    for _ in 0..MAX_READS_PER_DRAIN {
        match reader.read(&mut buf) {
            Ok(0) => return true,
            Ok(n) => sink(&buf[..n]),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return false,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            // Linux reports a closed slave as EIO.
            Err(err) => {
                debug!(error = %err, "pty read failed");
                return true;
            }
        }
    }
    false
}

pub struct TtyPoller {
    daemon: Arc<Daemon>,
}

impl TtyPoller {
    pub fn new(daemon: Arc<Daemon>) -> Self {
        Self { daemon }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("tty-poll".into())
            .spawn(move || loop {
                self.run_once();
            })
    }

    /// One iteration: reap if SIGCHLD fired, then wait up to
    /// [`POLL_TIMEOUT_MS`] for pty output.
    pub fn run_once(&self) {
        if self.daemon.sigchld.swap(false, Ordering::AcqRel) {
            reaper::reap(&self.daemon.registry, self.daemon.backend.as_ref());
        }

        let targets = self.poll_targets();
        if targets.is_empty() {
            thread::sleep(Duration::from_millis(POLL_TIMEOUT_MS as u64));
            return;
        }

        let mut fds: Vec<PollFd<'_>> = targets
            .iter()
            .map(|(_, pty)| PollFd::new(pty.as_fd(), PollFlags::POLLIN))
            .collect();
        match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
            Ok(_) => {}
            Err(Errno::EINTR) => return,
            Err(err) => {
                warn!(error = %err, "poll on instance ptys failed");
                thread::sleep(Duration::from_millis(POLL_TIMEOUT_MS as u64));
                return;
            }
        }

        let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        for ((id, pty), pfd) in targets.iter().zip(&fds) {
            if !pfd.revents().is_some_and(|events| events.intersects(ready)) {
                continue;
            }
            if drain_pty(pty, |bytes| self.deliver(id, bytes)) {
                self.mark_hung_up(id);
            }
        }
    }

    /// Ptys worth polling. Clones are taken under the lock; the poll itself
    /// runs without it.
    fn poll_targets(&self) -> Vec<(String, Arc<File>)> {
        self.daemon
            .registry
            .lock()
            .iter()
            .filter(|inst| !inst.hung_up && !inst.is_dead())
            .filter_map(|inst| inst.pty.clone().map(|pty| (inst.id.clone(), pty)))
            .collect()
    }

    fn deliver(&self, id: &str, bytes: &[u8]) {
        let peer = {
            let mut instances = self.daemon.registry.lock();
            let Some(inst) = instances.get_mut(id) else {
                return;
            };
            inst.termbuf.append(bytes);
            inst.live_peer()
        };
        if let Some(peer) = peer {
            console::forward_output(&peer, bytes);
        }
    }

    /// Stop polling a pty whose slave is gone and get the reaper to look at
    /// the process.
    fn mark_hung_up(&self, id: &str) {
        if let Some(inst) = self.daemon.registry.lock().get_mut(id) {
            debug!(instance = inst.short_id(), "pty hung up");
            inst.hung_up = true;
        }
        self.daemon.sigchld.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::FakeBackend;
    use crate::config::{Config, UnderlyingFs};
    use cellblock_common::protocol::InstanceKind;
    use std::process::Command;
    use std::time::Instant;

    #[test]
    fn output_lands_in_ring_buffer_and_instance_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_data_dir(dir.path(), UnderlyingFs::Ufs);
        config.prepare_data_dir().unwrap();
        let backend = Arc::new(FakeBackend::default());
        let daemon = Arc::new(Daemon::new(config, backend.clone()));

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("echo hello-from-jail; sleep 0.3");
        let id = daemon
            .spawn_instance("c".repeat(64), "alpine".into(), InstanceKind::Regular, cmd)
            .unwrap();

        let poller = TtyPoller::new(daemon.clone());
        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            // No SIGCHLD handler in unit tests; ask for a reap every round.
            daemon.sigchld.store(true, Ordering::Release);
            poller.run_once();
            match daemon.registry.lock().find(&id) {
                Some(inst) => seen = inst.termbuf.to_contiguous(),
                None => break,
            }
        }

        assert!(String::from_utf8_lossy(&seen).contains("hello-from-jail"));
        assert_eq!(daemon.registry.count(), 0);
        assert!(backend
            .calls()
            .contains(&format!("teardown {} regular", id)));
        assert!(!dir.path().join("locks").join(format!("{}.pid", id)).exists());
    }
}
