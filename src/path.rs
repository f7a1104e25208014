//! A convenience walker from a root inode to the inode a slash-separated
//! path names.

use crate::directory::Directory;
use crate::error::{Error, Result};
use crate::inode::TYPE_DIRECTORY;
use crate::superblock::Superblock;

/// Resolves `path` (e.g. `"a/b/c"`) relative to `root_idx`, returning the
/// inode index it names.
///
/// This performs no permission checks of any kind — callers that need
/// access control must layer it on top, typically at the protocol-handling
/// boundary that calls into this crate. An empty path resolves to `root_idx`
/// itself.
pub fn resolve_path(superblock: &Superblock, root_idx: u64, path: &str) -> Result<u64> {
    let mut current = root_idx;

    for component in path.split('/').filter(|c| !c.is_empty()) {
        let mut inode = superblock.inode_table().get_inode(current)?;
        if inode.record.kind != TYPE_DIRECTORY {
            return Err(Error::NotFound);
        }
        let mut dir = Directory::open(&mut inode, superblock)?;
        current = dir
            .get_file(component, superblock)?
            .ok_or(Error::NotFound)?;
    }

    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ChunkCache;
    use crate::device::MemBackend;
    use crate::inode::{TYPE_DIRECTORY, TYPE_REGULAR};
    use std::sync::Arc;

    fn fresh(chunk_count: u64, chunk_size: u64, frac: f64) -> Superblock {
        let device = Arc::new(MemBackend::new(chunk_size, chunk_count));
        let cache = ChunkCache::new(device);
        Superblock::init(cache, frac).unwrap()
    }

    #[test]
    fn resolves_nested_path() {
        let sb = fresh(2048, 512, 0.1);

        let mut root = sb.inode_table().get_inode(0).unwrap_or_else(|_| {
            let mut i = sb.inode_table().alloc_inode().unwrap();
            i.record.kind = TYPE_DIRECTORY;
            i
        });
        root.record.kind = TYPE_DIRECTORY;
        {
            let mut dir = Directory::initialize_empty(&mut root, &sb).unwrap();
            let mut sub = sb.inode_table().alloc_inode().unwrap();
            sub.record.kind = TYPE_DIRECTORY;
            {
                let mut subdir = Directory::initialize_empty(&mut sub, &sb).unwrap();
                let mut file = sb.inode_table().alloc_inode().unwrap();
                file.record.kind = TYPE_REGULAR;
                sb.inode_table().set_inode(file.idx, &file).unwrap();
                subdir.add_file("leaf.txt", file.idx, &sb).unwrap();
            }
            sb.inode_table().set_inode(sub.idx, &sub).unwrap();
            dir.add_file("sub", sub.idx, &sb).unwrap();
        }
        sb.inode_table().set_inode(root.idx, &root).unwrap();

        let resolved = resolve_path(&sb, root.idx, "sub/leaf.txt").unwrap();
        let leaf = sb.inode_table().get_inode(resolved).unwrap();
        assert_eq!(leaf.record.kind, TYPE_REGULAR);
    }

    #[test]
    fn missing_component_is_not_found() {
        let sb = fresh(1024, 512, 0.1);
        let mut root = sb.inode_table().alloc_inode().unwrap();
        root.record.kind = TYPE_DIRECTORY;
        Directory::initialize_empty(&mut root, &sb).unwrap();
        sb.inode_table().set_inode(root.idx, &root).unwrap();

        let err = resolve_path(&sb, root.idx, "nope").unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[test]
    fn empty_path_resolves_to_root() {
        let sb = fresh(1024, 512, 0.1);
        let root = sb.inode_table().alloc_inode().unwrap();
        let resolved = resolve_path(&sb, root.idx, "").unwrap();
        assert_eq!(resolved, root.idx);
    }
}
