//! The weak-reference chunk cache and the shared [`Chunk`] handle it hands out.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::device::BlockDevice;
use crate::error::Result;

/// A live, in-memory copy of one chunk's bytes.
///
/// Any number of holders may share a `Chunk` through [`Arc`]; mutations made
/// by one holder are visible to all others, since they share the same
/// backing buffer. When the last strong reference is dropped, the chunk's
/// bytes are written back to the device — there is no explicit "close"
/// operation, the flush is the destructor's job.
pub struct Chunk {
    idx: u64,
    device: Arc<dyn BlockDevice>,
    bytes: Mutex<Box<[u8]>>,
}

impl Chunk {
    /// The chunk index this handle was loaded for.
    pub fn idx(&self) -> u64 {
        self.idx
    }

    /// Runs `f` with read access to the chunk's bytes under its per-chunk lock.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.bytes.lock();
        f(&guard)
    }

    /// Runs `f` with write access to the chunk's bytes under its per-chunk lock.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.bytes.lock();
        f(&mut guard)
    }

    /// Reads the little-endian `u64` at word index `word_idx` (i.e. byte
    /// offset `word_idx * 8`). Used to walk indirect-pointer tables.
    pub fn read_u64(&self, word_idx: usize) -> u64 {
        self.with_bytes(|b| {
            let off = word_idx * 8;
            u64::from_le_bytes(b[off..off + 8].try_into().unwrap())
        })
    }

    /// Writes a little-endian `u64` at word index `word_idx`.
    pub fn write_u64(&self, word_idx: usize, value: u64) {
        self.with_bytes_mut(|b| {
            let off = word_idx * 8;
            b[off..off + 8].copy_from_slice(&value.to_le_bytes());
        })
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        let bytes = self.bytes.lock();
        match self.device.write_chunk(self.idx, &bytes) {
            Ok(()) => log::trace!("flushed chunk {} on last release", self.idx),
            Err(e) => log::warn!("failed to flush chunk {} on release: {e}", self.idx),
        }
    }
}

struct Inner {
    map: HashMap<u64, Weak<Chunk>>,
    next_sweep: usize,
}

/// Mediates every read and write against a [`BlockDevice`].
///
/// `get_chunk(idx)` returns an existing strong reference if a weak handle for
/// `idx` still resolves; otherwise it loads the chunk from the device,
/// installs a new weak handle, and returns a strong reference. This
/// guarantees at most one in-memory copy of a given chunk index exists at a
/// time, so two callers mutating "the same chunk" concurrently really are
/// mutating the same bytes.
pub struct ChunkCache {
    device: Arc<dyn BlockDevice>,
    inner: Mutex<Inner>,
}

const MIN_SWEEP_THRESHOLD: usize = 16;

impl ChunkCache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Arc<Self> {
        Arc::new(Self {
            device,
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                next_sweep: MIN_SWEEP_THRESHOLD,
            }),
        })
    }

    pub fn chunk_size(&self) -> u64 {
        self.device.chunk_size()
    }

    pub fn chunk_count(&self) -> u64 {
        self.device.chunk_count()
    }

    /// Returns a strong reference to chunk `idx`, loading it from the device
    /// on a cache miss.
    pub fn get_chunk(&self, idx: u64) -> Result<Arc<Chunk>> {
        let mut inner = self.inner.lock();
        if let Some(weak) = inner.map.get(&idx) {
            if let Some(strong) = weak.upgrade() {
                return Ok(strong);
            }
        }

        let mut buf = vec![0u8; self.device.chunk_size() as usize];
        self.device.read_chunk(idx, &mut buf)?;
        log::debug!("chunk cache miss: loaded chunk {idx} from device");

        let chunk = Arc::new(Chunk {
            idx,
            device: self.device.clone(),
            bytes: Mutex::new(buf.into_boxed_slice()),
        });
        inner.map.insert(idx, Arc::downgrade(&chunk));
        self.sweep(&mut inner, false);
        Ok(chunk)
    }

    /// Drops any weak handles whose chunk has already been released. Runs
    /// automatically once the map has grown past the doubling threshold
    /// (minimum 16); `force` bypasses that check.
    fn sweep(&self, inner: &mut Inner, force: bool) {
        if !force && inner.map.len() < inner.next_sweep {
            return;
        }
        inner.map.retain(|_, weak| weak.strong_count() > 0);
        inner.next_sweep = (inner.map.len() * 2).max(MIN_SWEEP_THRESHOLD);
    }

    /// Forces an immediate sweep and reports how many entries remain live.
    /// Mirrors the close-time check a device performs to detect chunks still
    /// referenced elsewhere in the program.
    pub fn live_chunk_count(&self) -> usize {
        let mut inner = self.inner.lock();
        self.sweep(&mut inner, true);
        inner.map.len()
    }
}
