//! Inode records, the inode table, and multi-level indirect addressing.

use std::sync::Arc;

use parking_lot::ReentrantMutex;

use crate::bitmap::DiskBitMap;
use crate::cache::{Chunk, ChunkCache};
use crate::error::{Error, Result};

/// Number of direct chunk pointers an inode carries.
pub const DIRECT_COUNT: usize = 8;
/// Direct + single + double + triple indirect pointer slots.
pub const ADDRESS_COUNT: usize = DIRECT_COUNT + 3;

const REGION_SIZES: [u64; 4] = [DIRECT_COUNT as u64, 1, 1, 1];

/// Anything that can hand an inode a chunk by index, or allocate a fresh one.
///
/// [`crate::superblock::Superblock`] is the only implementor; this trait
/// exists so an inode can walk its indirection tree without holding a
/// back-pointer to the superblock that owns it (an inode is a value type
/// callers copy around freely, and Rust has no convenient way to embed a
/// "pointer to my owner" in a value that also gets copied).
pub trait ChunkSource {
    fn chunk_size(&self) -> u64;
    fn get_chunk(&self, idx: u64) -> Result<Arc<Chunk>>;
    fn allocate_chunk(&self) -> Result<Arc<Chunk>>;
}

/// The on-disk inode record: metadata plus the address-tree root.
///
/// Field widths and ordering are part of the image format and must not change.
#[derive(Debug, Clone, Copy)]
pub struct InodeRecord {
    pub uid: u64,
    pub gid: u64,
    pub last_accessed: u64,
    pub last_modified: u64,
    pub file_size: u64,
    pub reference_count: u64,
    pub permissions: u32,
    pub kind: u32,
    pub addresses: [u64; ADDRESS_COUNT],
}

/// Regular file inode type tag.
pub const TYPE_REGULAR: u32 = 1;
/// Directory inode type tag.
pub const TYPE_DIRECTORY: u32 = 2;

impl Default for InodeRecord {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            last_accessed: 0,
            last_modified: 0,
            file_size: 0,
            reference_count: 1,
            permissions: 0,
            kind: 0,
            addresses: [0; ADDRESS_COUNT],
        }
    }
}

impl InodeRecord {
    pub const SIZE: usize = 8 * 6 + 4 * 2 + 8 * ADDRESS_COUNT;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut off = 0;
        macro_rules! put_u64 {
            ($v:expr) => {
                buf[off..off + 8].copy_from_slice(&($v).to_le_bytes());
                off += 8;
            };
        }
        macro_rules! put_u32 {
            ($v:expr) => {
                buf[off..off + 4].copy_from_slice(&($v).to_le_bytes());
                off += 4;
            };
        }
        put_u64!(self.uid);
        put_u64!(self.gid);
        put_u64!(self.last_accessed);
        put_u64!(self.last_modified);
        put_u64!(self.file_size);
        put_u64!(self.reference_count);
        put_u32!(self.permissions);
        put_u32!(self.kind);
        for addr in &self.addresses {
            put_u64!(*addr);
        }
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut off = 0;
        macro_rules! get_u64 {
            () => {{
                let v = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
                off += 8;
                v
            }};
        }
        macro_rules! get_u32 {
            () => {{
                let v = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
                off += 4;
                v
            }};
        }
        let uid = get_u64!();
        let gid = get_u64!();
        let last_accessed = get_u64!();
        let last_modified = get_u64!();
        let file_size = get_u64!();
        let reference_count = get_u64!();
        let permissions = get_u32!();
        let kind = get_u32!();
        let mut addresses = [0u64; ADDRESS_COUNT];
        for addr in &mut addresses {
            *addr = get_u64!();
        }
        Self {
            uid,
            gid,
            last_accessed,
            last_modified,
            file_size,
            reference_count,
            permissions,
            kind,
            addresses,
        }
    }
}

/// A value-type handle on one inode: its slot index plus a copy of its record.
///
/// Callers obtain a copy (via [`InodeTable::alloc_inode`] or `get_inode`),
/// mutate it through `read`/`write`, and write it back explicitly with
/// `InodeTable::set_inode` when they want the change to be visible to other
/// holders of the same index.
#[derive(Debug, Clone)]
pub struct Inode {
    pub idx: u64,
    pub record: InodeRecord,
}

/// Resolves `ptr`, allocating and zero-filling a fresh chunk in its place
/// when it is the hole sentinel `0` and `create` is set. Returns `None` for
/// a hole when `create` is false.
fn resolve_ptr(ptr: u64, create: bool, src: &dyn ChunkSource) -> Result<Option<(u64, Arc<Chunk>)>> {
    if ptr != 0 {
        let chunk = src.get_chunk(ptr)?;
        return Ok(Some((ptr, chunk)));
    }
    if !create {
        return Ok(None);
    }
    let chunk = src.allocate_chunk()?;
    chunk.with_bytes_mut(|b| b.fill(0));
    Ok(Some((chunk.idx(), chunk)))
}

impl Inode {
    /// Walks the direct/single/double/triple indirect address tree to find
    /// the chunk backing `chunk_number`. Returns `None` for a hole (an
    /// unallocated pointer) unless `create` is set, in which case the
    /// missing chunks along the path are allocated and zero-filled.
    fn resolve(
        &mut self,
        mut chunk_number: u64,
        create: bool,
        src: &dyn ChunkSource,
    ) -> Result<Option<Arc<Chunk>>> {
        let pointers_per_chunk = src.chunk_size() / 8;
        let mut stride = 1u64;
        let mut table_base = 0usize;

        for level in 0..REGION_SIZES.len() {
            let region_size = REGION_SIZES[level];
            let capacity = stride * region_size;
            if chunk_number < capacity {
                let slot = table_base + (chunk_number / stride) as usize;
                let existing = self.record.addresses[slot];
                let Some((ptr, mut chunk)) = resolve_ptr(existing, create, src)? else {
                    return Ok(None);
                };
                self.record.addresses[slot] = ptr;

                let mut depth = level;
                let mut local_stride = stride;
                let mut n = chunk_number;
                while depth != 0 {
                    local_stride /= pointers_per_chunk;
                    let idx_in_block = (n / local_stride) as usize;
                    let existing = chunk.read_u64(idx_in_block);
                    let Some((next_ptr, next_chunk)) = resolve_ptr(existing, create, src)? else {
                        return Ok(None);
                    };
                    chunk.write_u64(idx_in_block, next_ptr);
                    chunk = next_chunk;
                    n %= local_stride;
                    depth -= 1;
                }

                return Ok(Some(chunk));
            }
            chunk_number -= capacity;
            table_base += region_size as usize;
            stride *= pointers_per_chunk;
        }

        Err(Error::OutOfRange)
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, clamped to
    /// `file_size`. Holes read as zeros. Returns the number of bytes
    /// actually read.
    pub fn read(&mut self, offset: u64, buf: &mut [u8], src: &dyn ChunkSource) -> Result<u64> {
        let chunk_size = src.chunk_size();
        let file_size = self.record.file_size;

        if offset >= file_size {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(file_size - offset);
        let buf = &mut buf[..n as usize];

        let mut offset = offset;
        let mut remaining = n;
        let mut cursor = 0usize;

        let room = chunk_size - offset % chunk_size;
        let first = room.min(remaining);
        self.copy_chunk_range(offset, &mut buf[cursor..cursor + first as usize], src, false)?;
        cursor += first as usize;
        remaining -= first;
        offset += first;

        if remaining == 0 {
            return Ok(n);
        }
        debug_assert_eq!(offset % chunk_size, 0);

        while remaining > chunk_size {
            self.copy_chunk_range(
                offset,
                &mut buf[cursor..cursor + chunk_size as usize],
                src,
                false,
            )?;
            cursor += chunk_size as usize;
            remaining -= chunk_size;
            offset += chunk_size;
        }

        self.copy_chunk_range(offset, &mut buf[cursor..], src, false)?;
        Ok(n)
    }

    /// Writes `buf` at `offset`, growing `file_size` if the write extends
    /// past the current end of file. Returns the number of bytes written
    /// (always `buf.len()`).
    pub fn write(&mut self, offset: u64, buf: &[u8], src: &dyn ChunkSource) -> Result<u64> {
        let chunk_size = src.chunk_size();
        let n = buf.len() as u64;
        if offset + n > self.record.file_size {
            self.record.file_size = offset + n;
        }

        let mut offset = offset;
        let mut remaining = n;
        let mut cursor = 0usize;

        let room = chunk_size - offset % chunk_size;
        let first = room.min(remaining);
        self.write_chunk_range(offset, &buf[cursor..cursor + first as usize], src)?;
        cursor += first as usize;
        remaining -= first;
        offset += first;

        if remaining == 0 {
            return Ok(n);
        }
        debug_assert_eq!(offset % chunk_size, 0);

        while remaining > chunk_size {
            self.write_chunk_range(offset, &buf[cursor..cursor + chunk_size as usize], src)?;
            cursor += chunk_size as usize;
            remaining -= chunk_size;
            offset += chunk_size;
        }

        self.write_chunk_range(offset, &buf[cursor..], src)?;
        Ok(n)
    }

    fn copy_chunk_range(
        &mut self,
        offset: u64,
        out: &mut [u8],
        src: &dyn ChunkSource,
        create: bool,
    ) -> Result<()> {
        let chunk_size = src.chunk_size();
        let chunk_no = offset / chunk_size;
        let within = (offset % chunk_size) as usize;
        match self.resolve(chunk_no, create, src)? {
            Some(chunk) => chunk.with_bytes(|b| out.copy_from_slice(&b[within..within + out.len()])),
            None => out.fill(0),
        }
        Ok(())
    }

    fn write_chunk_range(&mut self, offset: u64, data: &[u8], src: &dyn ChunkSource) -> Result<()> {
        let chunk_size = src.chunk_size();
        let chunk_no = offset / chunk_size;
        let within = (offset % chunk_size) as usize;
        let chunk = self
            .resolve(chunk_no, true, src)?
            .expect("resolve with create=true never returns a hole");
        chunk.with_bytes_mut(|b| b[within..within + data.len()].copy_from_slice(data));
        Ok(())
    }
}

/// The inode allocator and persistence layer: an occupancy bitmap followed by
/// the packed ilist.
pub struct InodeTable {
    cache: Arc<ChunkCache>,
    lock: ReentrantMutex<()>,
    ilist_offset: u64,
    inode_count: u64,
    inodes_per_chunk: u64,
    size_chunks: u64,
    used: DiskBitMap,
}

impl InodeTable {
    pub fn new(cache: Arc<ChunkCache>, offset: u64, inode_count: u64) -> Self {
        let inodes_per_chunk = cache.chunk_size() / InodeRecord::SIZE as u64;
        let used = DiskBitMap::new(cache.clone(), offset, inode_count);
        let ilist_offset = offset + used.size_chunks();
        let size_chunks = used.size_chunks() + inode_count / inodes_per_chunk + 1;
        Self {
            cache,
            lock: ReentrantMutex::new(()),
            ilist_offset,
            inode_count,
            inodes_per_chunk,
            size_chunks,
            used,
        }
    }

    pub fn format(&self) -> Result<()> {
        self.used.clear_all()
    }

    pub fn size_chunks(&self) -> u64 {
        self.size_chunks
    }

    pub fn inode_count(&self) -> u64 {
        self.inode_count
    }

    fn locate(&self, idx: u64) -> (u64, usize) {
        let chunk_idx = self.ilist_offset + idx / self.inodes_per_chunk;
        let byte_off = ((idx % self.inodes_per_chunk) * InodeRecord::SIZE as u64) as usize;
        (chunk_idx, byte_off)
    }

    pub fn alloc_inode(&self) -> Result<Inode> {
        let _guard = self.lock.lock();
        let range = self.used.find_unset_bits(1)?;
        if range.bit_count != 1 {
            log::warn!("inode table exhausted: no free slot for allocation");
            return Err(Error::OutOfInodes);
        }
        let inode = Inode {
            idx: range.start_idx,
            record: InodeRecord::default(),
        };
        self.set_inode_locked(range.start_idx, &inode)?;
        Ok(inode)
    }

    pub fn get_inode(&self, idx: u64) -> Result<Inode> {
        let _guard = self.lock.lock();
        if idx >= self.inode_count {
            return Err(Error::OutOfRange);
        }
        if !self.used.get(idx)? {
            return Err(Error::NotAllocated);
        }
        let (chunk_idx, byte_off) = self.locate(idx);
        let chunk = self.cache.get_chunk(chunk_idx)?;
        let mut buf = [0u8; InodeRecord::SIZE];
        chunk.with_bytes(|b| buf.copy_from_slice(&b[byte_off..byte_off + InodeRecord::SIZE]));
        Ok(Inode {
            idx,
            record: InodeRecord::from_bytes(&buf),
        })
    }

    pub fn set_inode(&self, idx: u64, inode: &Inode) -> Result<()> {
        let _guard = self.lock.lock();
        self.set_inode_locked(idx, inode)
    }

    fn set_inode_locked(&self, idx: u64, inode: &Inode) -> Result<()> {
        if idx >= self.inode_count {
            return Err(Error::OutOfRange);
        }
        self.used.set(idx)?;
        let (chunk_idx, byte_off) = self.locate(idx);
        let chunk = self.cache.get_chunk(chunk_idx)?;
        chunk.with_bytes_mut(|b| {
            b[byte_off..byte_off + InodeRecord::SIZE].copy_from_slice(&inode.record.to_bytes())
        });
        Ok(())
    }

    /// Releases inode slot `idx`. The caller must already have released any
    /// chunks owned by the inode (see the module-level indirection docs);
    /// this only clears the occupancy bit.
    pub fn free_inode(&self, idx: u64) -> Result<()> {
        let _guard = self.lock.lock();
        if idx >= self.inode_count {
            return Err(Error::OutOfRange);
        }
        self.used.clr(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBackend;
    use crate::superblock::Superblock;
    use std::sync::Arc;

    fn fresh(chunk_count: u64, chunk_size: u64, frac: f64) -> Superblock {
        let device = Arc::new(MemBackend::new(chunk_size, chunk_count));
        let cache = ChunkCache::new(device);
        Superblock::init(cache, frac).unwrap()
    }

    #[test]
    fn single_byte_round_trip() {
        let sb = fresh(1024, 512, 0.1);
        let mut inode = sb.inode_table().alloc_inode().unwrap();
        inode.write(0, b"X", &sb).unwrap();
        let mut buf = [0u8; 1];
        inode.read(0, &mut buf, &sb).unwrap();
        assert_eq!(&buf, b"X");
    }

    #[test]
    fn overlapping_writes_compose() {
        let sb = fresh(1024, 512, 0.1);
        let mut inode = sb.inode_table().alloc_inode().unwrap();
        inode.write(0, b"ab", &sb).unwrap();
        inode.write(1, b"cd", &sb).unwrap();
        let mut buf = [0u8; 3];
        inode.read(0, &mut buf, &sb).unwrap();
        assert_eq!(&buf, b"acd");
    }

    #[test]
    fn write_straddling_a_chunk_boundary() {
        let sb = fresh(1024, 512, 0.1);
        let mut inode = sb.inode_table().alloc_inode().unwrap();
        inode.write(1022, b"abcd", &sb).unwrap();
        inode.write(1023, b"efgh", &sb).unwrap();
        let mut buf = [0u8; 5];
        inode.read(1022, &mut buf, &sb).unwrap();
        assert_eq!(&buf, b"aefgh");
    }

    #[test]
    fn indirect_allocation_far_past_direct_range() {
        let sb = fresh(20000, 1024, 0.1);
        let mut inode = sb.inode_table().alloc_inode().unwrap();
        let offset = 10 * 1024 * 1024;
        inode.write(offset, b"hello", &sb).unwrap();
        let mut buf = [0u8; 5];
        inode.read(offset, &mut buf, &sb).unwrap();
        assert_eq!(&buf, b"hello");

        // An earlier, never-written offset within file_size reads as zeros.
        let mut hole = [0xffu8; 4];
        inode.read(offset - 4, &mut hole, &sb).unwrap();
        assert_eq!(hole, [0u8; 4]);
    }

    #[test]
    fn get_inode_on_free_slot_fails() {
        let sb = fresh(1024, 512, 0.1);
        let inode = sb.inode_table().alloc_inode().unwrap();
        sb.inode_table().free_inode(inode.idx).unwrap();
        let err = sb.inode_table().get_inode(inode.idx).unwrap_err();
        assert!(matches!(err, Error::NotAllocated));
    }
}
