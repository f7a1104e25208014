//! A user-space block-structured filesystem engine.
//!
//! This crate implements the on-disk data structures and in-memory caching
//! layer of a simple filesystem image: a chunked block device, a
//! weak-reference chunk cache, a free-chunk bitmap, a superblock that ties
//! them together, multi-level indirect inode addressing, and directory
//! streams built on top of inode byte streams. It does not itself speak any
//! kernel filesystem protocol (FUSE, 9P, NFS, ...); it is the engine a
//! protocol front-end drives.

pub mod bitmap;
pub mod cache;
pub mod config;
pub mod device;
pub mod directory;
pub mod error;
pub mod inode;
pub mod path;
pub mod superblock;

pub use bitmap::{BitRange, DiskBitMap};
pub use cache::{Chunk, ChunkCache};
pub use config::{Backing, FsConfig};
pub use device::{BlockDevice, MemBackend, MmapBackend};
pub use directory::Directory;
pub use error::{Error, Result};
pub use inode::{ChunkSource, Inode, InodeRecord, InodeTable, ADDRESS_COUNT, DIRECT_COUNT};
pub use path::resolve_path;
pub use superblock::Superblock;

use std::sync::Arc;

use inode::{TYPE_DIRECTORY, TYPE_REGULAR};

/// The top-level handle on an open image: owns the chunk cache and the
/// superblock built on top of it.
///
/// This is the entry point most embedders reach for; the individual modules
/// remain public for callers that want finer-grained control (e.g. a test
/// harness that wants direct access to the bitmap or inode table).
pub struct Filesystem {
    superblock: Superblock,
}

impl Filesystem {
    /// Formats a fresh image according to `config` and returns a handle on
    /// it, with a root directory inode already created at index `0`.
    pub fn init(config: &FsConfig) -> Result<Self> {
        let device = open_backing(config)?;
        let cache = ChunkCache::new(device);
        let superblock = Superblock::init(cache, config.inode_table_fraction)?;

        let mut root = superblock.inode_table().alloc_inode()?;
        root.record.kind = TYPE_DIRECTORY;
        Directory::initialize_empty(&mut root, &superblock)?;
        superblock.inode_table().set_inode(root.idx, &root)?;

        log::debug!("formatted new image, root inode at slot {}", root.idx);
        Ok(Self { superblock })
    }

    /// Opens a previously formatted image.
    pub fn load(config: &FsConfig) -> Result<Self> {
        let device = open_backing(config)?;
        let cache = ChunkCache::new(device);
        let superblock = Superblock::load(cache)?;
        Ok(Self { superblock })
    }

    /// Gives access to the underlying superblock for operations this facade
    /// doesn't wrap directly (allocation, the raw inode table, and so on).
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    /// Resolves a slash-separated path to an inode index, starting from the
    /// root inode at slot `0`.
    pub fn resolve(&self, path: &str) -> Result<u64> {
        resolve_path(&self.superblock, 0, path)
    }

    /// Creates a new, empty regular file at `parent_dir_idx` named `name`,
    /// returning its inode index.
    pub fn create_file(&self, parent_dir_idx: u64, name: &str) -> Result<u64> {
        let mut parent = self.superblock.inode_table().get_inode(parent_dir_idx)?;
        let mut file = self.superblock.inode_table().alloc_inode()?;
        file.record.kind = TYPE_REGULAR;
        self.superblock.inode_table().set_inode(file.idx, &file)?;

        let mut dir = Directory::open(&mut parent, &self.superblock)?;
        if let Err(e) = dir.add_file(name, file.idx, &self.superblock) {
            self.superblock.inode_table().free_inode(file.idx)?;
            return Err(e);
        }
        Ok(file.idx)
    }

    /// Creates a new, empty subdirectory at `parent_dir_idx` named `name`,
    /// returning its inode index.
    pub fn create_dir(&self, parent_dir_idx: u64, name: &str) -> Result<u64> {
        let mut parent = self.superblock.inode_table().get_inode(parent_dir_idx)?;
        let mut sub = self.superblock.inode_table().alloc_inode()?;
        sub.record.kind = TYPE_DIRECTORY;
        Directory::initialize_empty(&mut sub, &self.superblock)?;
        self.superblock.inode_table().set_inode(sub.idx, &sub)?;

        let mut dir = Directory::open(&mut parent, &self.superblock)?;
        if let Err(e) = dir.add_file(name, sub.idx, &self.superblock) {
            self.superblock.inode_table().free_inode(sub.idx)?;
            return Err(e);
        }
        Ok(sub.idx)
    }

    /// Reads up to `buf.len()` bytes from file `inode_idx` at `offset`.
    pub fn read_file(&self, inode_idx: u64, offset: u64, buf: &mut [u8]) -> Result<u64> {
        let mut inode = self.superblock.inode_table().get_inode(inode_idx)?;
        let n = inode.read(offset, buf, &self.superblock)?;
        Ok(n)
    }

    /// Writes `buf` to file `inode_idx` at `offset`, persisting the updated
    /// inode record afterward.
    pub fn write_file(&self, inode_idx: u64, offset: u64, buf: &[u8]) -> Result<u64> {
        let mut inode = self.superblock.inode_table().get_inode(inode_idx)?;
        let n = inode.write(offset, buf, &self.superblock)?;
        self.superblock.inode_table().set_inode(inode_idx, &inode)?;
        Ok(n)
    }
}

fn open_backing(config: &FsConfig) -> Result<Arc<dyn BlockDevice>> {
    match &config.backing {
        Backing::Memory => Ok(Arc::new(MemBackend::new(config.chunk_size, config.chunk_count))),
        Backing::MappedFile(path) => Ok(Arc::new(MmapBackend::open(
            path,
            config.chunk_size,
            config.chunk_count,
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_config() -> FsConfig {
        FsConfig {
            chunk_size: 512,
            chunk_count: 2048,
            inode_table_fraction: 0.1,
            backing: Backing::Memory,
        }
    }

    #[test]
    fn create_and_read_back_a_file() {
        let fs = Filesystem::init(&mem_config()).unwrap();
        let file_idx = fs.create_file(0, "hello.txt").unwrap();
        fs.write_file(file_idx, 0, b"hello world").unwrap();

        let mut buf = [0u8; 11];
        fs.read_file(file_idx, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello world");

        let resolved = fs.resolve("hello.txt").unwrap();
        assert_eq!(resolved, file_idx);
    }

    #[test]
    fn nested_directories_resolve() {
        let fs = Filesystem::init(&mem_config()).unwrap();
        let sub = fs.create_dir(0, "docs").unwrap();
        let file_idx = fs.create_file(sub, "readme.md").unwrap();
        assert_eq!(fs.resolve("docs/readme.md").unwrap(), file_idx);
    }

    #[test]
    fn creating_a_duplicate_name_fails() {
        let fs = Filesystem::init(&mem_config()).unwrap();
        fs.create_file(0, "a.txt").unwrap();
        let err = fs.create_file(0, "a.txt").unwrap_err();
        assert!(matches!(err, Error::Duplicate));
    }

    #[test]
    fn image_survives_a_drop_and_reopen_on_the_same_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let config = FsConfig {
            chunk_size: 512,
            chunk_count: 2048,
            inode_table_fraction: 0.1,
            backing: Backing::MappedFile(tmp.path().to_path_buf()),
        };

        let file_idx = {
            let fs = Filesystem::init(&config).unwrap();
            let file_idx = fs.create_file(0, "note.txt").unwrap();
            fs.write_file(file_idx, 0, b"ping").unwrap();
            file_idx
            // `fs` (and its chunk cache) drops here, flushing every live chunk.
        };

        let fs = Filesystem::load(&config).unwrap();
        let mut buf = [0u8; 4];
        fs.read_file(file_idx, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(fs.resolve("note.txt").unwrap(), file_idx);
    }
}
