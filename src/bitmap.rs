//! A persistent bit-array layered over the chunk cache, used both for free-chunk
//! tracking and for inode-slot occupancy.

use std::sync::Arc;

use crate::cache::ChunkCache;
use crate::error::{Error, Result};

/// A run of consecutive zero bits found by [`DiskBitMap::find_unset_bits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitRange {
    pub start_idx: u64,
    pub bit_count: u64,
}

impl BitRange {
    /// Sets every bit in the range. Convenience for callers that immediately
    /// want to claim the whole run they just found.
    pub fn set_range(&self, bitmap: &DiskBitMap) -> Result<()> {
        for i in self.start_idx..self.start_idx + self.bit_count {
            bitmap.set(i)?;
        }
        Ok(())
    }
}

/// A bit-addressable bitmap of `bit_count` bits, stored as a prefix of
/// contiguous chunks starting at `offset_chunks`.
pub struct DiskBitMap {
    cache: Arc<ChunkCache>,
    offset_chunks: u64,
    chunk_size: u64,
    bit_count: u64,
    size_chunks: u64,
}

impl DiskBitMap {
    pub fn new(cache: Arc<ChunkCache>, offset_chunks: u64, bit_count: u64) -> Self {
        let chunk_size = cache.chunk_size();
        let bits_per_chunk = chunk_size * 8;
        let size_chunks = bit_count.div_ceil(bits_per_chunk).max(1);
        Self {
            cache,
            offset_chunks,
            chunk_size,
            bit_count,
            size_chunks,
        }
    }

    pub fn size_chunks(&self) -> u64 {
        self.size_chunks
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    fn locate(&self, bit_idx: u64) -> (u64, usize, u8) {
        let byte_idx = bit_idx / 8;
        let chunk_idx = self.offset_chunks + byte_idx / self.chunk_size;
        let byte_off = (byte_idx % self.chunk_size) as usize;
        let bit_off = (bit_idx % 8) as u8;
        (chunk_idx, byte_off, bit_off)
    }

    pub fn get(&self, bit_idx: u64) -> Result<bool> {
        if bit_idx >= self.bit_count {
            return Err(Error::OutOfRange);
        }
        let (chunk_idx, byte_off, bit_off) = self.locate(bit_idx);
        let chunk = self.cache.get_chunk(chunk_idx)?;
        Ok(chunk.with_bytes(|b| (b[byte_off] >> bit_off) & 1 == 1))
    }

    pub fn set(&self, bit_idx: u64) -> Result<()> {
        self.write_bit(bit_idx, true)
    }

    pub fn clr(&self, bit_idx: u64) -> Result<()> {
        self.write_bit(bit_idx, false)
    }

    fn write_bit(&self, bit_idx: u64, value: bool) -> Result<()> {
        if bit_idx >= self.bit_count {
            return Err(Error::OutOfRange);
        }
        let (chunk_idx, byte_off, bit_off) = self.locate(bit_idx);
        let chunk = self.cache.get_chunk(chunk_idx)?;
        chunk.with_bytes_mut(|b| {
            if value {
                b[byte_off] |= 1 << bit_off;
            } else {
                b[byte_off] &= !(1 << bit_off);
            }
        });
        Ok(())
    }

    /// Zeroes every backing chunk, including the tail padding beyond `bit_count`.
    pub fn clear_all(&self) -> Result<()> {
        for c in 0..self.size_chunks {
            let chunk = self.cache.get_chunk(self.offset_chunks + c)?;
            chunk.with_bytes_mut(|b| b.fill(0));
        }
        Ok(())
    }

    /// Returns the lowest-indexed run of `min(k, largest run <= k)`
    /// consecutive zero bits. Bits at or beyond `bit_count` are never
    /// considered, so tail padding can never be handed out.
    pub fn find_unset_bits(&self, k: u64) -> Result<BitRange> {
        let mut best_start = 0u64;
        let mut best_len = 0u64;
        let mut run_start = 0u64;
        let mut run_len = 0u64;

        for i in 0..self.bit_count {
            if !self.get(i)? {
                if run_len == 0 {
                    run_start = i;
                }
                run_len += 1;
                if run_len == k {
                    return Ok(BitRange {
                        start_idx: run_start,
                        bit_count: k,
                    });
                }
                if run_len > best_len {
                    best_len = run_len;
                    best_start = run_start;
                }
            } else {
                run_len = 0;
            }
        }

        Ok(BitRange {
            start_idx: best_start,
            bit_count: best_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBackend;

    fn bitmap(bit_count: u64) -> DiskBitMap {
        let device = Arc::new(MemBackend::new(16, 256));
        let cache = ChunkCache::new(device);
        DiskBitMap::new(cache, 0, bit_count)
    }

    #[test]
    fn clear_all_leaves_every_bit_zero() {
        let bm = bitmap(32);
        bm.clear_all().unwrap();
        for i in 0..32 {
            assert!(!bm.get(i).unwrap());
        }
    }

    #[test]
    fn set_and_read_back_every_other_bit() {
        let bm = bitmap(32);
        bm.clear_all().unwrap();
        for i in (0..32).step_by(2) {
            bm.set(i + 1).unwrap();
        }
        for i in (0..32).step_by(2) {
            assert!(!bm.get(i).unwrap());
            assert!(bm.get(i + 1).unwrap());
        }
    }

    #[test]
    fn find_unset_bits_skips_set_bits() {
        let bm = bitmap(32);
        bm.clear_all().unwrap();
        for i in (0..32).step_by(4) {
            bm.set(i).unwrap();
        }
        for i in (0..32).step_by(4) {
            let range = bm.find_unset_bits(3).unwrap();
            assert_eq!(range.bit_count, 3);
            assert_eq!(range.start_idx, i + 1);
            range.set_range(&bm).unwrap();
        }
    }

    #[test]
    fn find_unset_bits_returns_shorter_run_when_request_exceeds_bitmap() {
        let bm = bitmap(4);
        bm.clear_all().unwrap();
        let range = bm.find_unset_bits(8).unwrap();
        assert_eq!(range.bit_count, 4);
        assert_eq!(range.start_idx, 0);
    }

    #[test]
    fn find_unset_bits_never_returns_padding_beyond_bit_count() {
        // bit_count=4 but the backing chunk holds 128 bits; only the first
        // 4 may ever be returned even though the rest are zero too.
        let bm = bitmap(4);
        bm.clear_all().unwrap();
        bm.set(0).unwrap();
        bm.set(1).unwrap();
        bm.set(2).unwrap();
        bm.set(3).unwrap();
        let range = bm.find_unset_bits(1).unwrap();
        assert_eq!(range.bit_count, 0);
    }
}
