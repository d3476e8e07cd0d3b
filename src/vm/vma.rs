//! Virtual memory areas: one contiguous run of a process's address space
//! mapped to one memory object, at one offset, with one protection/flag set.

use crate::vm::MmObjId;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct VmaId(pub u64);

bitflags::bitflags! {
    /// Page protection bits, as `handle_pagefault` checks them against the
    /// fault type.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Prot: u8 {
        const READ  = 0b001;
        const WRITE = 0b010;
        const EXEC  = 0b100;
    }
}

bitflags::bitflags! {
    /// Mapping flags. `SHARED`/`PRIVATE` are mutually exclusive in practice
    /// (callers pick one); `ANON` marks a mapping with no backing vnode.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct VmFlags: u8 {
        const SHARED  = 0b0001;
        const PRIVATE = 0b0010;
        const FIXED   = 0b0100;
        const ANON    = 0b1000;
    }
}

/// One mapped region: `[start_vfn, end_vfn)` of the owning process's address
/// space, backed by `mmobj` starting at page offset `off` into it.
#[derive(Clone, Debug)]
pub struct Vma {
    pub id: VmaId,
    pub start_vfn: usize,
    pub end_vfn: usize,
    pub off: usize,
    pub prot: Prot,
    pub flags: VmFlags,
    pub mmobj: MmObjId,
}

impl Vma {
    pub fn len_pages(&self) -> usize {
        self.end_vfn - self.start_vfn
    }

    pub fn contains(&self, vfn: usize) -> bool {
        vfn >= self.start_vfn && vfn < self.end_vfn
    }

    pub fn overlaps(&self, start_vfn: usize, end_vfn: usize) -> bool {
        self.start_vfn < end_vfn && start_vfn < self.end_vfn
    }

    /// Page offset into `mmobj` for frame number `vfn`, which must lie
    /// within this vma.
    pub fn mmobj_pagenum(&self, vfn: usize) -> usize {
        debug_assert!(self.contains(vfn));
        self.off + (vfn - self.start_vfn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vma(start: usize, end: usize) -> Vma {
        Vma {
            id: VmaId(0),
            start_vfn: start,
            end_vfn: end,
            off: 0,
            prot: Prot::READ,
            flags: VmFlags::PRIVATE,
            mmobj: MmObjId(0),
        }
    }

    #[test]
    fn overlap_detection() {
        let a = vma(10, 20);
        assert!(a.overlaps(15, 25));
        assert!(a.overlaps(5, 15));
        assert!(!a.overlaps(20, 30));
        assert!(!a.overlaps(0, 10));
    }

    #[test]
    fn mmobj_pagenum_honors_offset() {
        let mut a = vma(10, 20);
        a.off = 100;
        assert_eq!(a.mmobj_pagenum(10), 100);
        assert_eq!(a.mmobj_pagenum(15), 105);
    }
}
