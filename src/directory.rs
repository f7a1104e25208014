//! A directory's contents as a singly-linked chain of variable-length records,
//! stored in the byte stream of a directory inode.

use crate::error::{Error, Result};
use crate::inode::{ChunkSource, Inode};

/// `record_count: u64` + `deleted_record_count: u64` + `head: u64` + `tail: u64`.
const HEADER_SIZE: u64 = 32;
/// `next_entry_ptr: u64` + `filename_length: u64` + `inode_idx: u64`.
const ENTRY_HEADER_SIZE: u64 = 24;
/// Longest name a single record can hold.
const MAX_NAME_LEN: usize = 255;

/// The four-field header at the front of every directory's byte stream.
#[derive(Debug, Clone, Copy)]
struct DirHeader {
    record_count: u64,
    deleted_record_count: u64,
    /// Byte offset of the first record, or `0` if the directory is empty.
    head: u64,
    /// Byte offset of the last record, or `0` if the directory is empty.
    tail: u64,
}

impl DirHeader {
    fn empty() -> Self {
        Self {
            record_count: 0,
            deleted_record_count: 0,
            head: 0,
            tail: 0,
        }
    }

    fn to_bytes(self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(&self.record_count.to_le_bytes());
        buf[8..16].copy_from_slice(&self.deleted_record_count.to_le_bytes());
        buf[16..24].copy_from_slice(&self.head.to_le_bytes());
        buf[24..32].copy_from_slice(&self.tail.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            record_count: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            deleted_record_count: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            head: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            tail: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        }
    }
}

/// One record in the chain: the offset of the next record (`0` for "no
/// successor"), the inode it names, and its filename.
#[derive(Debug, Clone)]
struct DirEntry {
    next_entry_ptr: u64,
    inode_idx: u64,
    name: String,
}

impl DirEntry {
    fn encoded_len(&self) -> u64 {
        ENTRY_HEADER_SIZE + self.name.len() as u64
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len() as usize);
        buf.extend_from_slice(&self.next_entry_ptr.to_le_bytes());
        buf.extend_from_slice(&(self.name.len() as u64).to_le_bytes());
        buf.extend_from_slice(&self.inode_idx.to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        buf
    }
}

/// A directory's record stream, addressed through the inode that backs it.
///
/// Borrowed for the lifetime of one operation; callers reopen it from the
/// inode's current record each time rather than holding it across unrelated
/// inode mutations.
pub struct Directory<'a> {
    inode: &'a mut Inode,
    header: DirHeader,
}

impl<'a> Directory<'a> {
    /// Opens an already-initialized directory inode.
    pub fn open(inode: &'a mut Inode, src: &dyn ChunkSource) -> Result<Self> {
        if inode.record.file_size < HEADER_SIZE {
            return Err(Error::Corrupt);
        }
        let mut buf = [0u8; HEADER_SIZE as usize];
        inode.read(0, &mut buf, src)?;
        Ok(Self {
            inode,
            header: DirHeader::from_bytes(&buf),
        })
    }

    /// Writes a zeroed header to a freshly allocated inode, establishing it
    /// as a directory stream.
    pub fn initialize_empty(inode: &'a mut Inode, src: &dyn ChunkSource) -> Result<Self> {
        let header = DirHeader::empty();
        inode.write(0, &header.to_bytes(), src)?;
        Ok(Self { inode, header })
    }

    /// Persists the in-memory header to the backing inode stream.
    pub fn flush(&mut self, src: &dyn ChunkSource) -> Result<()> {
        self.inode.write(0, &self.header.to_bytes(), src)
    }

    pub fn record_count(&self) -> u64 {
        self.header.record_count
    }

    pub fn deleted_record_count(&self) -> u64 {
        self.header.deleted_record_count
    }

    fn read_entry_at(&mut self, offset: u64, src: &dyn ChunkSource) -> Result<DirEntry> {
        let mut head = [0u8; ENTRY_HEADER_SIZE as usize];
        self.inode.read(offset, &mut head, src)?;
        let next_entry_ptr = u64::from_le_bytes(head[0..8].try_into().unwrap());
        let name_len = u64::from_le_bytes(head[8..16].try_into().unwrap()) as usize;
        let inode_idx = u64::from_le_bytes(head[16..24].try_into().unwrap());
        let mut name_buf = vec![0u8; name_len];
        self.inode.read(offset + ENTRY_HEADER_SIZE, &mut name_buf, src)?;
        let name = String::from_utf8(name_buf).map_err(|_| Error::Corrupt)?;
        Ok(DirEntry {
            next_entry_ptr,
            inode_idx,
            name,
        })
    }

    fn write_entry_at(&mut self, offset: u64, entry: &DirEntry, src: &dyn ChunkSource) -> Result<()> {
        self.inode.write(offset, &entry.to_bytes(), src)?;
        Ok(())
    }

    /// Patches just the `next_entry_ptr` field of the record at `offset`,
    /// leaving the rest of the record untouched.
    fn patch_next(&mut self, offset: u64, next_entry_ptr: u64, src: &dyn ChunkSource) -> Result<()> {
        self.inode.write(offset, &next_entry_ptr.to_le_bytes(), src)?;
        Ok(())
    }

    /// Appends a new record mapping `name` to `inode_idx`. Fails with
    /// [`Error::Duplicate`] if `name` already appears in the directory.
    pub fn add_file(&mut self, name: &str, inode_idx: u64, src: &dyn ChunkSource) -> Result<()> {
        if name.len() > MAX_NAME_LEN {
            return Err(Error::OutOfRange);
        }
        if self.get_file(name, src)?.is_some() {
            return Err(Error::Duplicate);
        }

        let entry = DirEntry {
            next_entry_ptr: 0,
            inode_idx,
            name: name.to_string(),
        };

        if self.header.head == 0 {
            let new_offset = HEADER_SIZE;
            self.write_entry_at(new_offset, &entry, src)?;
            self.header.head = new_offset;
            self.header.tail = new_offset;
        } else {
            let tail_offset = self.header.tail;
            let tail_entry = self.read_entry_at(tail_offset, src)?;
            let new_offset = tail_offset + tail_entry.encoded_len();
            self.patch_next(tail_offset, new_offset, src)?;
            self.write_entry_at(new_offset, &entry, src)?;
            self.header.tail = new_offset;
        }
        self.header.record_count += 1;
        log::trace!("directory add_file: linked '{name}' -> inode {inode_idx}");
        self.flush(src)
    }

    /// Returns the inode index `name` maps to, or `None` if it is absent.
    pub fn get_file(&mut self, name: &str, src: &dyn ChunkSource) -> Result<Option<u64>> {
        let mut offset = self.header.head;
        while offset != 0 {
            let entry = self.read_entry_at(offset, src)?;
            if entry.name == name {
                return Ok(Some(entry.inode_idx));
            }
            offset = entry.next_entry_ptr;
        }
        Ok(None)
    }

    /// Unlinks the record for `name` from the chain. The bytes it occupied
    /// in the inode's stream are not reclaimed; only the linkage changes.
    pub fn remove_file(&mut self, name: &str, src: &dyn ChunkSource) -> Result<()> {
        let mut prev_offset = 0u64;
        let mut offset = self.header.head;

        while offset != 0 {
            let entry = self.read_entry_at(offset, src)?;
            if entry.name == name {
                if prev_offset == 0 {
                    self.header.head = entry.next_entry_ptr;
                    if self.header.head == 0 {
                        self.header.tail = 0;
                    }
                } else {
                    self.patch_next(prev_offset, entry.next_entry_ptr, src)?;
                    if entry.next_entry_ptr == 0 {
                        self.header.tail = prev_offset;
                    }
                }
                self.header.deleted_record_count += 1;
                self.header.record_count -= 1;
                log::trace!("directory remove_file: unlinked '{name}'");
                return self.flush(src);
            }
            prev_offset = offset;
            offset = entry.next_entry_ptr;
        }

        Err(Error::NotFound)
    }

    /// Returns the record following `cursor` (the head if `cursor` is `None`),
    /// or `None` when the chain ends or the directory is empty.
    pub fn next_entry(&mut self, cursor: Option<u64>, src: &dyn ChunkSource) -> Result<Option<u64>> {
        let offset = match cursor {
            None => {
                if self.header.record_count == 0 {
                    return Ok(None);
                }
                self.header.head
            }
            Some(prev_offset) => {
                let entry = self.read_entry_at(prev_offset, src)?;
                entry.next_entry_ptr
            }
        };
        if offset == 0 {
            return Ok(None);
        }
        Ok(Some(offset))
    }

    /// Looks up the name and inode index of the record at byte offset `offset`.
    pub fn entry_at(&mut self, offset: u64, src: &dyn ChunkSource) -> Result<(String, u64)> {
        let entry = self.read_entry_at(offset, src)?;
        Ok((entry.name, entry.inode_idx))
    }

    /// Collects every `(name, inode_idx)` pair currently linked in, in chain
    /// order. Intended for listing and for tests; directories are not
    /// expected to grow large enough for this to matter.
    pub fn entries(&mut self, src: &dyn ChunkSource) -> Result<Vec<(String, u64)>> {
        let mut out = Vec::new();
        let mut offset = self.header.head;
        while offset != 0 {
            let entry = self.read_entry_at(offset, src)?;
            offset = entry.next_entry_ptr;
            out.push((entry.name, entry.inode_idx));
        }
        Ok(out)
    }
}
