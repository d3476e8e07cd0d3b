//! Open file descriptions and the per-process descriptor table (component E).
//!
//! Two tables, same split the teacher draws between `Proc.files` and the
//! open-file-table behind it: a `FileEntry` (vnode + seek position + mode)
//! is shared by every fd that `dup`/`dup2`/`fork` point at it, while the
//! descriptor table just maps small integers to `FileId`s.

use std::collections::HashMap;

use arrayvec::ArrayVec;

use crate::error::{KError, KResult};
use crate::param::NOFILE;
use crate::vfs::VnodeId;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FileId(pub u64);

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct OpenMode: u8 {
        const READ   = 0b001;
        const WRITE  = 0b010;
        const APPEND = 0b100;
    }
}

#[derive(Debug)]
pub struct FileEntry {
    pub vnode: VnodeId,
    pub pos: usize,
    pub mode: OpenMode,
    pub refcount: usize,
}

#[derive(Default)]
pub struct FileTable {
    next_id: u64,
    entries: HashMap<FileId, FileEntry>,
}

impl FileTable {
    pub fn new() -> FileTable {
        FileTable::default()
    }

    pub fn alloc(&mut self, vnode: VnodeId, mode: OpenMode) -> FileId {
        let id = FileId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            FileEntry {
                vnode,
                pos: 0,
                mode,
                refcount: 1,
            },
        );
        id
    }

    pub fn get(&self, id: FileId) -> KResult<&FileEntry> {
        self.entries.get(&id).ok_or(KError::Ebadf)
    }

    pub fn get_mut(&mut self, id: FileId) -> KResult<&mut FileEntry> {
        self.entries.get_mut(&id).ok_or(KError::Ebadf)
    }

    pub fn incref(&mut self, id: FileId) {
        if let Some(e) = self.entries.get_mut(&id) {
            e.refcount += 1;
        }
    }

    /// Returns the closed entry's vnode once its last descriptor is gone,
    /// so the caller can drop the matching vnode reference too.
    pub fn decref(&mut self, id: FileId) -> Option<VnodeId> {
        let e = self.entries.get_mut(&id)?;
        e.refcount -= 1;
        if e.refcount == 0 {
            Some(self.entries.remove(&id).unwrap().vnode)
        } else {
            None
        }
    }
}

/// A process's fixed-size fd -> open-file-description table. `NOFILE`-sized
/// and growable-within-that-bound rather than heap-unbounded, the one place
/// in this core a real resource ceiling (`EMFILE`) is enforced structurally.
#[derive(Debug, Default)]
pub struct FdTable {
    slots: ArrayVec<Option<FileId>, NOFILE>,
}

impl FdTable {
    pub fn new() -> FdTable {
        let mut slots = ArrayVec::new();
        for _ in 0..NOFILE {
            slots.push(None);
        }
        FdTable { slots }
    }

    pub fn get(&self, fd: i32) -> KResult<FileId> {
        self.slot(fd)?.ok_or(KError::Ebadf)
    }

    fn slot(&self, fd: i32) -> KResult<Option<FileId>> {
        let idx: usize = fd.try_into().map_err(|_| KError::Ebadf)?;
        self.slots.get(idx).copied().ok_or(KError::Ebadf)
    }

    /// Install `file` at the lowest free fd, as `open`/`dup` require.
    pub fn install_lowest(&mut self, file: FileId) -> KResult<i32> {
        let idx = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(KError::Emfile)?;
        self.slots[idx] = Some(file);
        Ok(idx as i32)
    }

    /// `dup2`: install `file` at exactly `fd`, growing the table's notion of
    /// "in use" but never its capacity.
    pub fn install_at(&mut self, fd: i32, file: FileId) -> KResult<Option<FileId>> {
        let idx: usize = fd.try_into().map_err(|_| KError::Ebadf)?;
        let slot = self.slots.get_mut(idx).ok_or(KError::Ebadf)?;
        Ok(std::mem::replace(slot, Some(file)))
    }

    pub fn clear(&mut self, fd: i32) -> KResult<FileId> {
        let idx: usize = fd.try_into().map_err(|_| KError::Ebadf)?;
        let slot = self.slots.get_mut(idx).ok_or(KError::Ebadf)?;
        slot.take().ok_or(KError::Ebadf)
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, FileId)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|f| (i as i32, f)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_lowest_fills_gaps_before_growing() {
        let mut fds = FdTable::new();
        let a = fds.install_lowest(FileId(1)).unwrap();
        let b = fds.install_lowest(FileId(2)).unwrap();
        assert_eq!((a, b), (0, 1));
        fds.clear(a).unwrap();
        let c = fds.install_lowest(FileId(3)).unwrap();
        assert_eq!(c, 0);
        let _ = b;
    }

    #[test]
    fn table_full_returns_emfile() {
        let mut fds = FdTable::new();
        for i in 0..NOFILE {
            fds.install_lowest(FileId(i as u64)).unwrap();
        }
        assert_eq!(fds.install_lowest(FileId(999)), Err(KError::Emfile));
    }
}
