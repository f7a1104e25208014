//! Crate-wide error taxonomy.

use thiserror::Error;

/// Every documented failure kind a core call can return.
///
/// Every operation either succeeds with its documented return, or fails with
/// exactly one of these. Callers are never left to guess which invariant broke.
#[derive(Debug, Error)]
pub enum Error {
    /// A chunk or inode index fell outside the configured count.
    #[error("index out of range")]
    OutOfRange,
    /// An inode slot was accessed while its occupancy bit is clear.
    #[error("inode slot is not allocated")]
    NotAllocated,
    /// No free chunk was available in the free-chunk bitmap.
    #[error("out of space: no free chunk available")]
    OutOfSpace,
    /// No free slot was available in the inode occupancy bitmap.
    #[error("out of inodes: no free inode slot available")]
    OutOfInodes,
    /// Stored superblock constants disagree with the device they were loaded from.
    #[error("filesystem image is corrupt")]
    Corrupt,
    /// A directory add targeted a filename that already has an entry.
    #[error("a directory entry with that name already exists")]
    Duplicate,
    /// A directory lookup or remove targeted an absent filename.
    #[error("no directory entry with that name exists")]
    NotFound,
    /// The memory-mapped backing surfaced an OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
