//! The on-disk superblock header and the allocator it anchors.

use std::sync::Arc;

use crate::bitmap::DiskBitMap;
use crate::cache::{Chunk, ChunkCache};
use crate::error::{Error, Result};
use crate::inode::{ChunkSource, Inode, InodeTable};

/// Number of fixed `u64` fields in the on-disk header, in their mandated order.
const HEADER_FIELD_COUNT: usize = 10;
const HEADER_SIZE: usize = HEADER_FIELD_COUNT * 8;

/// The fixed-layout header stored in chunk 0 of every image.
///
/// Field order is part of the on-disk format and must never change: readers
/// written against an older layout would silently misparse a reordered one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    superblock_size_chunks: u64,
    disk_size_bytes: u64,
    disk_size_chunks: u64,
    chunk_size: u64,
    block_map_offset: u64,
    block_map_size_chunks: u64,
    inode_table_offset: u64,
    inode_table_size_chunks: u64,
    inode_count: u64,
    data_offset: u64,
}

impl Header {
    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        let fields = [
            self.superblock_size_chunks,
            self.disk_size_bytes,
            self.disk_size_chunks,
            self.chunk_size,
            self.block_map_offset,
            self.block_map_size_chunks,
            self.inode_table_offset,
            self.inode_table_size_chunks,
            self.inode_count,
            self.data_offset,
        ];
        for (i, f) in fields.iter().enumerate() {
            buf[i * 8..i * 8 + 8].copy_from_slice(&f.to_le_bytes());
        }
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let mut get = |i: usize| u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap());
        Self {
            superblock_size_chunks: get(0),
            disk_size_bytes: get(1),
            disk_size_chunks: get(2),
            chunk_size: get(3),
            block_map_offset: get(4),
            block_map_size_chunks: get(5),
            inode_table_offset: get(6),
            inode_table_size_chunks: get(7),
            inode_count: get(8),
            data_offset: get(9),
        }
    }
}

/// The root of a formatted image: header, free-chunk bitmap, and inode table.
///
/// Implements [`ChunkSource`] so an [`Inode`] can resolve and allocate chunks
/// through it without holding a reference back to whatever embeds the
/// superblock.
pub struct Superblock {
    cache: Arc<ChunkCache>,
    header: Header,
    block_map: DiskBitMap,
    inode_table: InodeTable,
}

impl Superblock {
    /// Formats a fresh image on `cache`'s device: lays out the header, the
    /// free-chunk bitmap, and the inode table, and marks every chunk those
    /// structures occupy (plus one margin chunk) as used so `allocate_chunk`
    /// never hands one out as file data.
    ///
    /// `inode_table_fraction` is the fraction, in `(0, 1]`, of the image's
    /// total chunk count to reserve as inode slots.
    pub fn init(cache: Arc<ChunkCache>, inode_table_fraction: f64) -> Result<Self> {
        let chunk_size = cache.chunk_size();
        let disk_size_chunks = cache.chunk_count();
        let disk_size_bytes = chunk_size * disk_size_chunks;

        if disk_size_chunks < 16 {
            log::warn!("image too small to format: {disk_size_chunks} chunks (minimum 16)");
            return Err(Error::OutOfSpace);
        }

        let superblock_size_chunks = 1u64;
        let mut offset = superblock_size_chunks;

        let block_map_offset = offset;
        let bits_per_chunk = chunk_size * 8;
        let block_map_size_chunks = disk_size_chunks.div_ceil(bits_per_chunk).max(1);
        offset += block_map_size_chunks;

        let inode_table_offset = offset;
        let inode_count = ((disk_size_chunks as f64) * inode_table_fraction).max(1.0) as u64;
        let inode_table = InodeTable::new(cache.clone(), inode_table_offset, inode_count);
        offset += inode_table.size_chunks();

        // One margin chunk between the inode table and the data region.
        offset += 1;
        let data_offset = offset;

        if data_offset >= disk_size_chunks {
            log::warn!(
                "image too small: metadata occupies {data_offset} of {disk_size_chunks} chunks"
            );
            return Err(Error::OutOfSpace);
        }

        let header = Header {
            superblock_size_chunks,
            disk_size_bytes,
            disk_size_chunks,
            chunk_size,
            block_map_offset,
            block_map_size_chunks,
            inode_table_offset,
            inode_table_size_chunks: inode_table.size_chunks(),
            inode_count,
            data_offset,
        };

        let block_map = DiskBitMap::new(cache.clone(), block_map_offset, disk_size_chunks);
        block_map.clear_all()?;
        for i in 0..data_offset {
            block_map.set(i)?;
        }
        inode_table.format()?;

        let sb = Self {
            cache,
            header,
            block_map,
            inode_table,
        };
        sb.write_header()?;
        Ok(sb)
    }

    /// Reopens a previously formatted image, validating the recomputable
    /// parts of the header against what the device actually reports.
    ///
    /// `data_offset` is trusted as stored rather than re-derived: the margin
    /// chunk `init` reserves beyond the inode table isn't itself a value
    /// recorded anywhere recoverable, so re-deriving it independently would
    /// only risk drifting from what was actually formatted. Everything else
    /// is cheap to recompute and is checked for consistency.
    pub fn load(cache: Arc<ChunkCache>) -> Result<Self> {
        let chunk0 = cache.get_chunk(0)?;
        let mut buf = [0u8; HEADER_SIZE];
        chunk0.with_bytes(|b| buf.copy_from_slice(&b[..HEADER_SIZE]));
        let header = Header::from_bytes(&buf);
        drop(chunk0);

        if header.chunk_size != cache.chunk_size() || header.disk_size_chunks != cache.chunk_count()
        {
            log::warn!("superblock header does not match the opened device's geometry");
            return Err(Error::Corrupt);
        }

        let block_map = DiskBitMap::new(cache.clone(), header.block_map_offset, header.disk_size_chunks);
        if block_map.size_chunks() != header.block_map_size_chunks {
            log::warn!("stored block map size disagrees with recomputed size");
            return Err(Error::Corrupt);
        }

        let inode_table = InodeTable::new(cache.clone(), header.inode_table_offset, header.inode_count);
        if inode_table.size_chunks() != header.inode_table_size_chunks {
            log::warn!("stored inode table size disagrees with recomputed size");
            return Err(Error::Corrupt);
        }

        if header.data_offset >= header.disk_size_chunks {
            log::warn!("stored data_offset is outside the device");
            return Err(Error::Corrupt);
        }

        for i in 0..header.data_offset {
            if !block_map.get(i)? {
                log::warn!("free-chunk bitmap bit {i} below data_offset is clear");
                return Err(Error::Corrupt);
            }
        }

        Ok(Self {
            cache,
            header,
            block_map,
            inode_table,
        })
    }

    fn write_header(&self) -> Result<()> {
        let chunk = self.cache.get_chunk(0)?;
        chunk.with_bytes_mut(|b| b[..HEADER_SIZE].copy_from_slice(&self.header.to_bytes()));
        Ok(())
    }

    pub fn inode_table(&self) -> &InodeTable {
        &self.inode_table
    }

    pub fn data_offset(&self) -> u64 {
        self.header.data_offset
    }

    pub fn root_inode(&self) -> Result<Inode> {
        self.inode_table.get_inode(0)
    }

    /// Releases chunk `idx` back to the free pool. The caller is responsible
    /// for having already unlinked any references to it.
    pub fn free_chunk(&self, idx: u64) -> Result<()> {
        if idx < self.header.data_offset {
            return Err(Error::OutOfRange);
        }
        self.block_map.clr(idx)
    }
}

impl ChunkSource for Superblock {
    fn chunk_size(&self) -> u64 {
        self.cache.chunk_size()
    }

    fn get_chunk(&self, idx: u64) -> Result<Arc<Chunk>> {
        self.cache.get_chunk(idx)
    }

    fn allocate_chunk(&self) -> Result<Arc<Chunk>> {
        let range = self.block_map.find_unset_bits(1)?;
        if range.bit_count != 1 {
            log::warn!("device exhausted: no free chunk available for allocation");
            return Err(Error::OutOfSpace);
        }
        range.set_range(&self.block_map)?;
        self.cache.get_chunk(range.start_idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBackend;

    fn fresh(chunk_count: u64, chunk_size: u64, frac: f64) -> Superblock {
        let device = Arc::new(MemBackend::new(chunk_size, chunk_count));
        let cache = ChunkCache::new(device);
        Superblock::init(cache, frac).unwrap()
    }

    #[test]
    fn init_reserves_metadata_chunks_as_used() {
        let sb = fresh(1024, 512, 0.1);
        for i in 0..sb.data_offset() {
            assert!(sb.block_map.get(i).unwrap());
        }
        assert!(!sb.block_map.get(sb.data_offset()).unwrap());
    }

    #[test]
    fn header_round_trips_through_reload() {
        let device = Arc::new(MemBackend::new(512, 1024));
        let cache = ChunkCache::new(device);
        let data_offset = {
            let sb = Superblock::init(cache.clone(), 0.1).unwrap();
            sb.data_offset()
        };
        let sb2 = Superblock::load(cache).unwrap();
        assert_eq!(sb2.data_offset(), data_offset);
    }

    #[test]
    fn allocate_chunk_never_returns_a_metadata_chunk() {
        let sb = fresh(64, 256, 0.1);
        for _ in 0..10 {
            let chunk = sb.allocate_chunk().unwrap();
            assert!(chunk.idx() >= sb.data_offset());
        }
    }

    #[test]
    fn load_rejects_geometry_mismatch() {
        let device = Arc::new(MemBackend::new(512, 1024));
        let cache = ChunkCache::new(device);
        Superblock::init(cache.clone(), 0.1).unwrap();

        let other_device = Arc::new(MemBackend::new(512, 2048));
        let other_cache = ChunkCache::new(other_device);
        // Copy chunk 0's header bytes across to simulate a mismatched reopen.
        let src = cache.get_chunk(0).unwrap();
        let dst = other_cache.get_chunk(0).unwrap();
        src.with_bytes(|b| dst.with_bytes_mut(|d| d.copy_from_slice(b)));
        drop(src);
        drop(dst);

        let err = Superblock::load(other_cache).unwrap_err();
        assert!(matches!(err, Error::Corrupt));
    }

    #[test]
    fn load_rejects_a_metadata_chunk_marked_free() {
        let device = Arc::new(MemBackend::new(512, 1024));
        let cache = ChunkCache::new(device);
        let data_offset = {
            let sb = Superblock::init(cache.clone(), 0.1).unwrap();
            sb.data_offset()
        };

        // Directly clear a bit below data_offset in the free-chunk bitmap,
        // simulating a torn or tampered image.
        let block_map = DiskBitMap::new(cache.clone(), 1, cache.chunk_count());
        block_map.clr(data_offset - 1).unwrap();

        let err = Superblock::load(cache).unwrap_err();
        assert!(matches!(err, Error::Corrupt));
    }
}
