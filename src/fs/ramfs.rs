//! An in-memory filesystem driver: the concrete `VnodeOps` a namespace needs
//! something real to resolve against. Stands in for the teacher's `s5fs`
//! (the on-disk filesystem the arch examples pair with the VFS layer) the
//! way `hal::TestPageTable` stands in for a real MMU — there is no disk
//! here, so every byte just lives in a `Vec<u8>` or a `HashMap`.

use std::collections::HashMap;
use std::fmt;

use crate::error::{KError, KResult};
use crate::vfs::vnode::{VnodeKind, VnodeOps, VnodeTable};
use crate::vfs::VnodeId;

enum RamNode {
    Dir(HashMap<String, VnodeId>),
    File(Vec<u8>),
    /// A device special with no registered driver: every read/write is
    /// `ENXIO`, matching a `mknod` with nothing backing its device number.
    Device,
}

impl fmt::Debug for RamNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RamNode::Dir(entries) => f.debug_tuple("Dir").field(&entries.len()).finish(),
            RamNode::File(data) => f.debug_tuple("File").field(&data.len()).finish(),
            RamNode::Device => f.write_str("Device"),
        }
    }
}

impl VnodeOps for RamNode {
    fn kind(&self) -> VnodeKind {
        match self {
            RamNode::Dir(_) => VnodeKind::Directory,
            RamNode::File(_) | RamNode::Device => VnodeKind::Regular,
        }
    }

    fn lookup(&self, name: &str) -> KResult<VnodeId> {
        match self {
            RamNode::Dir(entries) => entries.get(name).copied().ok_or(KError::Enoent),
            RamNode::File(_) | RamNode::Device => Err(KError::Enotdir),
        }
    }

    fn link_child(&mut self, name: &str, child: VnodeId) -> KResult<()> {
        match self {
            RamNode::Dir(entries) => {
                entries.insert(name.to_string(), child);
                Ok(())
            }
            RamNode::File(_) | RamNode::Device => Err(KError::Enotdir),
        }
    }

    fn unlink_child(&mut self, name: &str) -> KResult<()> {
        match self {
            RamNode::Dir(entries) => {
                entries.remove(name).ok_or(KError::Enoent)?;
                Ok(())
            }
            RamNode::File(_) | RamNode::Device => Err(KError::Enotdir),
        }
    }

    fn readdir(&self, index: usize) -> Option<(String, VnodeId)> {
        match self {
            RamNode::Dir(entries) => entries
                .iter()
                .nth(index)
                .map(|(name, id)| (name.clone(), *id)),
            RamNode::File(_) | RamNode::Device => None,
        }
    }

    fn is_empty_dir(&self) -> bool {
        match self {
            RamNode::Dir(entries) => entries.keys().all(|k| k == "." || k == ".."),
            RamNode::File(_) | RamNode::Device => false,
        }
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> KResult<usize> {
        match self {
            RamNode::File(data) => {
                if offset >= data.len() {
                    return Ok(0);
                }
                let n = buf.len().min(data.len() - offset);
                buf[..n].copy_from_slice(&data[offset..offset + n]);
                Ok(n)
            }
            RamNode::Dir(_) => Err(KError::Eisdir),
            RamNode::Device => Err(KError::Enxio),
        }
    }

    fn write(&mut self, offset: usize, buf: &[u8]) -> KResult<usize> {
        match self {
            RamNode::File(data) => {
                let end = offset + buf.len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[offset..end].copy_from_slice(buf);
                Ok(buf.len())
            }
            RamNode::Dir(_) => Err(KError::Eisdir),
            RamNode::Device => Err(KError::Enxio),
        }
    }

    fn len(&self) -> usize {
        match self {
            RamNode::File(data) => data.len(),
            RamNode::Dir(_) | RamNode::Device => 0,
        }
    }
}

/// Create the root directory, self-linked for `.` and `..`.
pub fn mkroot(table: &mut VnodeTable) -> VnodeId {
    let id = table.alloc(Box::new(RamNode::Dir(HashMap::new())));
    let v = table.get_mut(id).expect("just allocated");
    v.ops.link_child(".", id).expect("root is a dir");
    v.ops.link_child("..", id).expect("root is a dir");
    id
}

fn check_new_name(table: &VnodeTable, parent: VnodeId, name: &str) -> KResult<()> {
    let p = table.get(parent)?;
    if p.ops.kind() != VnodeKind::Directory {
        return Err(KError::Enotdir);
    }
    if p.ops.lookup(name).is_ok() {
        return Err(KError::Eexist);
    }
    Ok(())
}

pub fn create(table: &mut VnodeTable, parent: VnodeId, name: &str) -> KResult<VnodeId> {
    check_new_name(table, parent, name)?;
    let id = table.alloc(Box::new(RamNode::File(Vec::new())));
    table.get_mut(parent)?.ops.link_child(name, id)?;
    Ok(id)
}

pub fn mknod(table: &mut VnodeTable, parent: VnodeId, name: &str) -> KResult<VnodeId> {
    check_new_name(table, parent, name)?;
    let id = table.alloc(Box::new(RamNode::Device));
    table.get_mut(parent)?.ops.link_child(name, id)?;
    Ok(id)
}

pub fn mkdir(table: &mut VnodeTable, parent: VnodeId, name: &str) -> KResult<VnodeId> {
    check_new_name(table, parent, name)?;
    let id = table.alloc(Box::new(RamNode::Dir(HashMap::new())));
    {
        let v = table.get_mut(id).expect("just allocated");
        v.ops.link_child(".", id)?;
        v.ops.link_child("..", parent)?;
    }
    table.get_mut(parent)?.ops.link_child(name, id)?;
    Ok(id)
}

/// `rmdir` whose final component resolves to `..` is rejected here rather
/// than in the namespace-agnostic path walker: it's this filesystem's own
/// entry (every directory carries a real `..`), so the check belongs where
/// the entry is materialized.
pub fn rmdir(table: &mut VnodeTable, parent: VnodeId, name: &str) -> KResult<()> {
    if name == "." {
        return Err(KError::Einval);
    }
    if name == ".." {
        return Err(KError::Enotempty);
    }
    let target = table.get(parent)?.ops.lookup(name)?;
    {
        let t = table.get(target)?;
        if t.ops.kind() != VnodeKind::Directory {
            return Err(KError::Enotdir);
        }
        if !t.ops.is_empty_dir() {
            return Err(KError::Enotempty);
        }
    }
    table.get_mut(parent)?.ops.unlink_child(name)?;
    table.decref(target);
    Ok(())
}

pub fn unlink(table: &mut VnodeTable, parent: VnodeId, name: &str) -> KResult<()> {
    let target = table.get(parent)?.ops.lookup(name)?;
    if table.get(target)?.ops.kind() == VnodeKind::Directory {
        return Err(KError::Eisdir);
    }
    table.get_mut(parent)?.ops.unlink_child(name)?;
    table.decref(target);
    Ok(())
}

pub fn link(table: &mut VnodeTable, parent: VnodeId, name: &str, existing: VnodeId) -> KResult<()> {
    check_new_name(table, parent, name)?;
    if table.get(existing)?.ops.kind() == VnodeKind::Directory {
        return Err(KError::Eisdir);
    }
    table.get_mut(parent)?.ops.link_child(name, existing)?;
    table.incref(existing)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::namev::{dir_namev, open_namev};

    #[test]
    fn create_then_resolve_roundtrips() {
        let mut table = VnodeTable::new();
        let root = mkroot(&mut table);
        let file = create(&mut table, root, "hello.txt").unwrap();
        assert_eq!(open_namev(&table, "/hello.txt", root, root).unwrap(), file);
    }

    #[test]
    fn nested_path_with_repeated_slashes_resolves() {
        let mut table = VnodeTable::new();
        let root = mkroot(&mut table);
        let a = mkdir(&mut table, root, "a").unwrap();
        let b = create(&mut table, a, "b").unwrap();
        assert_eq!(open_namev(&table, "/a///b/", root, root).unwrap(), b);
    }

    #[test]
    fn rmdir_on_nonempty_dir_fails() {
        let mut table = VnodeTable::new();
        let root = mkroot(&mut table);
        mkdir(&mut table, root, "a").unwrap();
        let a = table.get(root).unwrap().ops.lookup("a").unwrap();
        create(&mut table, a, "inside").unwrap();
        assert_eq!(rmdir(&mut table, root, "a"), Err(KError::Enotempty));
    }

    #[test]
    fn rmdir_dotdot_is_rejected() {
        let mut table = VnodeTable::new();
        let root = mkroot(&mut table);
        mkdir(&mut table, root, "a").unwrap();
        let a = table.get(root).unwrap().ops.lookup("a").unwrap();
        assert_eq!(rmdir(&mut table, a, ".."), Err(KError::Enotempty));
    }

    #[test]
    fn dir_namev_splits_parent_and_final_component() {
        let mut table = VnodeTable::new();
        let root = mkroot(&mut table);
        let a = mkdir(&mut table, root, "a").unwrap();
        let (parent, name) = dir_namev(&table, "/a/newfile", root, root).unwrap();
        assert_eq!(parent, a);
        assert_eq!(name, "newfile");
    }

    #[test]
    fn write_then_read_back() {
        let mut table = VnodeTable::new();
        let root = mkroot(&mut table);
        let f = create(&mut table, root, "f").unwrap();
        table.get_mut(f).unwrap().ops.write(0, b"hello").unwrap();
        let mut buf = [0u8; 5];
        table.get(f).unwrap().ops.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn device_node_is_enxio() {
        let mut table = VnodeTable::new();
        let root = mkroot(&mut table);
        let dev = mknod(&mut table, root, "dev0").unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(table.get(dev).unwrap().ops.read(0, &mut buf), Err(KError::Enxio));
    }
}
