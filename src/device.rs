//! The fixed-size chunk store backing an image, and the two supported backings.

use std::fs::{File, OpenOptions};
use std::path::Path;

use libc::c_long;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// A fixed-size chunk store, byte-addressable via chunk index.
///
/// `get_chunk`/`flush_chunk` at the cache layer are built on top of
/// `read_chunk`/`write_chunk` here; implementors need only move bytes in and
/// out of whatever storage backs them.
pub trait BlockDevice: Send + Sync {
    /// Size in bytes of a single chunk.
    fn chunk_size(&self) -> u64;
    /// Total number of chunks in the image.
    fn chunk_count(&self) -> u64;
    /// Total size of the image in bytes.
    fn size_bytes(&self) -> u64 {
        self.chunk_size() * self.chunk_count()
    }
    /// Copies chunk `idx`'s current bytes into `buf`, which must be exactly
    /// `chunk_size()` long.
    fn read_chunk(&self, idx: u64, buf: &mut [u8]) -> Result<()>;
    /// Writes `buf`, which must be exactly `chunk_size()` long, into chunk `idx`.
    fn write_chunk(&self, idx: u64, buf: &[u8]) -> Result<()>;
}

fn check_idx(idx: u64, chunk_count: u64) -> Result<()> {
    if idx >= chunk_count {
        Err(Error::OutOfRange)
    } else {
        Ok(())
    }
}

/// An ephemeral in-memory image, useful for tests and scratch filesystems.
pub struct MemBackend {
    chunk_size: u64,
    chunk_count: u64,
    data: Mutex<Vec<u8>>,
}

impl MemBackend {
    pub fn new(chunk_size: u64, chunk_count: u64) -> Self {
        Self {
            chunk_size,
            chunk_count,
            data: Mutex::new(vec![0u8; (chunk_size * chunk_count) as usize]),
        }
    }
}

impl BlockDevice for MemBackend {
    fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    fn read_chunk(&self, idx: u64, buf: &mut [u8]) -> Result<()> {
        check_idx(idx, self.chunk_count)?;
        let data = self.data.lock();
        let start = (idx * self.chunk_size) as usize;
        buf.copy_from_slice(&data[start..start + self.chunk_size as usize]);
        Ok(())
    }

    fn write_chunk(&self, idx: u64, buf: &[u8]) -> Result<()> {
        check_idx(idx, self.chunk_count)?;
        let mut data = self.data.lock();
        let start = (idx * self.chunk_size) as usize;
        data[start..start + self.chunk_size as usize].copy_from_slice(buf);
        Ok(())
    }
}

/// A persistent image backed by a memory-mapped file.
pub struct MmapBackend {
    chunk_size: u64,
    chunk_count: u64,
    map: Mutex<MmapMut>,
    // Kept alive for as long as the mapping is; the file itself is never read
    // from or written to directly once mapped.
    _file: File,
}

impl MmapBackend {
    /// Opens (creating if necessary) `path`, sizes it to hold `chunk_count`
    /// chunks of `chunk_size` bytes, and maps it read-write.
    pub fn open(path: &Path, chunk_size: u64, chunk_count: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let size = chunk_size * chunk_count;
        file.set_len(size)?;
        let map = unsafe { MmapOptions::new().len(size as usize).map_mut(&file)? };
        Ok(Self {
            chunk_size,
            chunk_count,
            map: Mutex::new(map),
            _file: file,
        })
    }
}

impl BlockDevice for MmapBackend {
    fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    fn read_chunk(&self, idx: u64, buf: &mut [u8]) -> Result<()> {
        check_idx(idx, self.chunk_count)?;
        let map = self.map.lock();
        let start = (idx * self.chunk_size) as usize;
        buf.copy_from_slice(&map[start..start + self.chunk_size as usize]);
        Ok(())
    }

    fn write_chunk(&self, idx: u64, buf: &[u8]) -> Result<()> {
        check_idx(idx, self.chunk_count)?;
        let mut map = self.map.lock();
        let start = (idx * self.chunk_size) as usize;
        map[start..start + self.chunk_size as usize].copy_from_slice(buf);
        Ok(())
    }
}

/// ioctl macro: Command.
macro_rules! ioc {
    ($a:expr, $b:expr, $c:expr, $d:expr) => {
        (($a) << 30) | (($b) << 8) | ($c) | (($d) << 16)
    };
}

/// ioctl macro: Read command.
macro_rules! ior {
    ($a:expr, $b:expr, $c:ty) => {
        ioc!(2, $a, $b, std::mem::size_of::<$c>() as c_long)
    };
}

/// ioctl command: get the size of a block device in bytes.
const BLKGETSIZE64: c_long = ior!(0x12, 114, u64);

/// Returns the byte size of the file or block device at `path`. Used when
/// sizing an image file before it is formatted; a real block device reports
/// its size through `BLKGETSIZE64`, a regular file through its metadata.
pub fn device_size_bytes(path: &Path) -> Result<u64> {
    use std::os::fd::AsRawFd;
    use std::os::unix::fs::FileTypeExt;

    let metadata = std::fs::metadata(path)?;
    let file_type = metadata.file_type();
    if file_type.is_block_device() || file_type.is_char_device() {
        let dev = File::open(path)?;
        let mut size: u64 = 0;
        let ret = unsafe { libc::ioctl(dev.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(size)
    } else {
        Ok(metadata.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_backend_round_trips_a_chunk() {
        let dev = MemBackend::new(64, 16);
        let mut buf = vec![0xabu8; 64];
        dev.write_chunk(3, &buf).unwrap();
        buf.fill(0);
        dev.read_chunk(3, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xab));
    }

    #[test]
    fn mem_backend_rejects_out_of_range_index() {
        let dev = MemBackend::new(64, 16);
        let buf = vec![0u8; 64];
        let err = dev.write_chunk(16, &buf).unwrap_err();
        assert!(matches!(err, Error::OutOfRange));
    }

    #[test]
    fn mmap_backend_persists_bytes_across_reopen() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();

        {
            let dev = MmapBackend::open(&path, 64, 16).unwrap();
            let mut buf = vec![0u8; 64];
            buf[0..4].copy_from_slice(b"ping");
            dev.write_chunk(2, &buf).unwrap();
        }

        let dev2 = MmapBackend::open(&path, 64, 16).unwrap();
        let mut buf = vec![0u8; 64];
        dev2.read_chunk(2, &mut buf).unwrap();
        assert_eq!(&buf[0..4], b"ping");
    }

    #[test]
    fn mmap_backend_reports_configured_geometry() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let dev = MmapBackend::open(tmp.path(), 128, 32).unwrap();
        assert_eq!(dev.chunk_size(), 128);
        assert_eq!(dev.chunk_count(), 32);
        assert_eq!(dev.size_bytes(), 128 * 32);
    }
}
