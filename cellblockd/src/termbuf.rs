//! Bounded per-instance console history.
//!
//! Output is stored one chunk per pty read. Small reads live inline in the
//! chunk, larger ones on the heap. Once the total exceeds the cap, whole
//! chunks are dropped from the oldest end.

use std::collections::VecDeque;

pub const DEFAULT_TTY_BUFFER_SIZE: usize = 5 * 4096;
pub const INLINE_CHUNK_LEN: usize = 128;

enum Chunk {
    Inline { len: u8, data: [u8; INLINE_CHUNK_LEN] },
    Heap(Box<[u8]>),
}

impl Chunk {
    fn new(bytes: &[u8]) -> Self {
        if bytes.len() < INLINE_CHUNK_LEN {
            let mut data = [0u8; INLINE_CHUNK_LEN];
            data[..bytes.len()].copy_from_slice(bytes);
            Chunk::Inline {
                len: bytes.len() as u8,
                data,
            }
        } else {
            Chunk::Heap(bytes.into())
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            Chunk::Inline { len, data } => &data[..*len as usize],
            Chunk::Heap(block) => block,
        }
    }

    fn len(&self) -> usize {
        self.as_slice().len()
    }
}

pub struct TermBuf {
    chunks: VecDeque<Chunk>,
    total: usize,
    cap: usize,
}

impl TermBuf {
    pub fn new(cap: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total: 0,
            cap,
        }
    }

    /// Record one read's worth of output. A write larger than the cap keeps
    /// only its trailing `cap` bytes.
    pub fn append(&mut self, bytes: &[u8]) {
        let bytes = if bytes.len() > self.cap {
            &bytes[bytes.len() - self.cap..]
        } else {
            bytes
        };
        if bytes.is_empty() {
            return;
        }
        self.chunks.push_back(Chunk::new(bytes));
        self.total += bytes.len();
        while self.total > self.cap {
            self.remove_oldest();
        }
    }

    /// Drop the oldest chunk and return the new total.
    pub fn remove_oldest(&mut self) -> usize {
        if let Some(chunk) = self.chunks.pop_front() {
            self.total -= chunk.len();
        }
        self.total
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Flatten the history with trailing whitespace and NUL bytes removed.
    /// The returned length is the exact length of the backlog.
    pub fn to_contiguous(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk.as_slice());
        }
        let keep = out
            .iter()
            .rposition(|b| !(b.is_ascii_whitespace() || *b == 0))
            .map_or(0, |pos| pos + 1);
        out.truncate(keep);
        out
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total = 0;
    }
}
