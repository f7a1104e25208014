//! Runtime configuration for creating or opening an image.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where the image's bytes live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Backing {
    /// An ephemeral in-memory buffer, useful for tests.
    Memory,
    /// A memory-mapped file at the given path.
    MappedFile(PathBuf),
}

/// Parameters needed to format or open an image.
///
/// This does not impose a config-file format or location; an embedder free to
/// load one from TOML, JSON, or command-line flags and build this value itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    /// Size in bytes of a single chunk, the unit of persistence.
    pub chunk_size: u64,
    /// Total number of chunks in the image.
    pub chunk_count: u64,
    /// Fraction of the image, in (0, 1), to dedicate to inode slots.
    pub inode_table_fraction: f64,
    /// The backing store for the image bytes.
    pub backing: Backing,
}

impl FsConfig {
    /// Total size of the image in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.chunk_size * self.chunk_count
    }
}
