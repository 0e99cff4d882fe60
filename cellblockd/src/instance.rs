//! Instance records and the registry that owns them.
//!
//! Every registry access goes through one mutex. Instances are found by
//! full id or by its ten character short form.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use cellblock_common::protocol::{InstanceEntry, InstanceKind};

use crate::termbuf::TermBuf;

/// Length of the abbreviated instance id accepted by lookups.
pub const SHORT_ID_LEN: usize = 10;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InstanceState: u32 {
        /// Process reaped and pty closed.
        const DEAD = 0b01;
        /// A console session owns the peer handle.
        const CONNECTED = 0b10;
    }
}

/// Write side of an attached console client. Writers hold the lock for the
/// whole frame so output from different threads never interleaves.
pub type Peer = Arc<Mutex<UnixStream>>;

/// Generate a fresh instance id: the hex SHA-256 of random bytes.
pub fn generate_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(Uuid::new_v4().as_bytes());
    hasher.update(nanos.to_le_bytes());
    hex::encode(hasher.finalize())
}

/// A query of exactly [`SHORT_ID_LEN`] characters matches by prefix, any
/// other length must equal the full id.
pub fn id_matches(id: &str, query: &str) -> bool {
    if query.len() == SHORT_ID_LEN {
        id.starts_with(query)
    } else {
        id == query
    }
}

pub fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

/// `<data>/locks/<id>.pid`, created exclusively and held under an exclusive
/// advisory lock for the lifetime of the instance.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    file: File,
}

impl PidLock {
    pub fn acquire(data_dir: &Path, id: &str, pid: u32) -> io::Result<Self> {
        let path = data_dir.join("locks").join(format!("{}.pid", id));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;
        file.try_lock_exclusive()?;
        writeln!(file, "{}", pid)?;
        file.sync_all()?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) -> io::Result<()> {
        let PidLock { path, file } = self;
        file.unlock()?;
        drop(file);
        fs::remove_file(path)
    }
}

pub struct Instance {
    pub id: String,
    pub image: String,
    pub kind: InstanceKind,
    pub pid: u32,
    pub pty: Option<Arc<File>>,
    pub tty_name: String,
    pub state: InstanceState,
    pub peer: Option<Peer>,
    pub start_time: DateTime<Utc>,
    pub exit_status: Option<i32>,
    pub termbuf: TermBuf,
    /// The pty reported end-of-file; the process is likely exiting.
    pub hung_up: bool,
    pid_lock: Option<PidLock>,
}

impl Instance {
    pub fn new(
        id: String,
        image: String,
        kind: InstanceKind,
        pid: u32,
        pty: File,
        tty_name: String,
        tty_buffer_size: usize,
    ) -> Self {
        Self {
            id,
            image,
            kind,
            pid,
            pty: Some(Arc::new(pty)),
            tty_name,
            state: InstanceState::empty(),
            peer: None,
            start_time: Utc::now(),
            exit_status: None,
            termbuf: TermBuf::new(tty_buffer_size),
            hung_up: false,
            pid_lock: None,
        }
    }

    pub fn with_pid_lock(mut self, lock: PidLock) -> Self {
        self.pid_lock = Some(lock);
        self
    }

    pub fn is_dead(&self) -> bool {
        self.state.contains(InstanceState::DEAD)
    }

    pub fn is_connected(&self) -> bool {
        self.state.contains(InstanceState::CONNECTED)
    }

    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    /// Install a console peer. Fails if one is already attached.
    pub fn attach(&mut self, peer: Peer) -> bool {
        if self.is_connected() {
            return false;
        }
        self.state.insert(InstanceState::CONNECTED);
        self.peer = Some(peer);
        true
    }

    pub fn detach(&mut self) -> Option<Peer> {
        self.state.remove(InstanceState::CONNECTED);
        self.peer.take()
    }

    /// Peer to forward live output to, if a console is attached.
    pub fn live_peer(&self) -> Option<Peer> {
        if self.is_connected() {
            self.peer.clone()
        } else {
            None
        }
    }

    /// Record the exit status and close the pty.
    pub fn mark_dead(&mut self, status: i32) {
        self.exit_status = Some(status);
        self.state.insert(InstanceState::DEAD);
        self.pty = None;
    }

    pub fn entry(&self) -> InstanceEntry {
        InstanceEntry {
            id: self.id.clone(),
            image: self.image.clone(),
            tty: self.tty_name.clone(),
            pid: self.pid,
            kind: self.kind,
            start_time: self.start_time,
        }
    }

    /// Drop the remaining per-instance resources once the instance has left
    /// the registry. Returns the pid-lock removal result.
    pub fn release(&mut self) -> io::Result<()> {
        self.pty = None;
        self.peer = None;
        self.termbuf.clear();
        match self.pid_lock.take() {
            Some(lock) => lock.release(),
            None => Ok(()),
        }
    }
}
