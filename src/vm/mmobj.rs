//! Memory objects: the reference-counted COW chain (component C/D).
//!
//! The three variants (anon, shadow, file-backed) are a closed set known
//! ahead of time, so — per DESIGN.md's open question on dynamic dispatch —
//! this is a tagged `MmObjKind` enum dispatched with `match` rather than a
//! trait object; the vnode side (`vfs::VnodeOps`) stays open-ended (new
//! filesystem drivers) and keeps the trait object.

use std::collections::HashMap;

use crate::hal::PhysAddr;
use crate::vfs::VnodeId;
use crate::vm::VmaId;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MmObjId(pub u64);

/// A single resident page: the frame backing one page number of an mmobj.
#[derive(Copy, Clone, Debug)]
pub struct PFrame {
    pub pagenum: usize,
    pub phys: PhysAddr,
    pub dirty: bool,
}

#[derive(Debug)]
pub enum MmObjKind {
    /// Zero-fills new pages; terminal in any chain.
    Anon,
    /// COW indirection: `shadowed` is the next link down the chain,
    /// `bottom_obj` caches the chain's terminal (file or anon).
    Shadow {
        shadowed: MmObjId,
        bottom_obj: MmObjId,
    },
    /// Supplied by a filesystem; terminal. `vnode` is the backing file.
    File { vnode: VnodeId },
}

#[derive(Debug)]
pub struct MmObj {
    pub id: MmObjId,
    pub kind: MmObjKind,
    /// External references (vma.mmobj pointers, plus one per shadow that
    /// points down at this object) plus this object's own resident pages.
    pub refcount: usize,
    pub resident: HashMap<usize, PFrame>,
    /// Back-index of every PRIVATE vma that transitively shadows this
    /// object when it is a bottom object. A weak, non-owning link (design
    /// note: "cyclic ownership of the shadow chain") — vma destruction
    /// unlinks itself from here, and it never affects `refcount`.
    pub vmas: Vec<VmaId>,
}

impl MmObj {
    pub fn new(id: MmObjId, kind: MmObjKind) -> MmObj {
        MmObj {
            id,
            kind,
            refcount: 1,
            resident: HashMap::new(),
            vmas: Vec::new(),
        }
    }

    pub fn is_anon(&self) -> bool {
        matches!(self.kind, MmObjKind::Anon)
    }

    pub fn bottom_obj(&self) -> Option<MmObjId> {
        match self.kind {
            MmObjKind::Shadow { bottom_obj, .. } => Some(bottom_obj),
            MmObjKind::Anon | MmObjKind::File { .. } => Some(self.id),
        }
    }

    /// refcount(mmobj) >= resident_pages(mmobj); equality means the object
    /// is unreachable except through its own page cache.
    pub fn is_unreachable(&self) -> bool {
        self.refcount <= self.resident.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bottom_obj_of_anon_is_itself() {
        let obj = MmObj::new(MmObjId(1), MmObjKind::Anon);
        assert_eq!(obj.bottom_obj(), Some(MmObjId(1)));
    }

    #[test]
    fn unreachable_when_refcount_equals_resident_pages() {
        let mut obj = MmObj::new(MmObjId(1), MmObjKind::Anon);
        obj.refcount = 1;
        assert!(!obj.is_unreachable());
        obj.resident.insert(
            0,
            PFrame {
                pagenum: 0,
                phys: PhysAddr(0x1000),
                dirty: false,
            },
        );
        assert!(obj.is_unreachable());
    }
}
