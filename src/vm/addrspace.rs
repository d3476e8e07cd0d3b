//! A process's address-space map: the ordered set of vmas covering its
//! virtual address range, plus the hardware page directory they're mapped
//! into. Generalizes the teacher's flat `Proc` page-table handle into its
//! own type so `proc::Process` can hold one map per process (and `fork` can
//! build a child's map independently of the parent's).

use crate::hal::PageDirId;
use crate::param::{USER_MEM_HIGH_VFN, USER_MEM_LOW_VFN};
use crate::vm::{MmObjId, Vma, VmFlags, VmaId};

/// Search direction for `find_range`: low-to-high first fit, or
/// high-to-low (the policy `do_mmap` uses for unfixed, addr-less requests
/// so the heap and a top-down mmap region don't collide).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SearchDir {
    LoHi,
    HiLo,
}

#[derive(Debug)]
pub struct AddrSpaceMap {
    pub pagedir: PageDirId,
    /// Kept sorted by `start_vfn`; non-overlapping by construction.
    vmas: Vec<Vma>,
    next_vma_id: u64,
}

impl AddrSpaceMap {
    pub fn new(pagedir: PageDirId) -> AddrSpaceMap {
        AddrSpaceMap {
            pagedir,
            vmas: Vec::new(),
            next_vma_id: 1,
        }
    }

    pub fn alloc_vma_id(&mut self) -> VmaId {
        let id = VmaId(self.next_vma_id);
        self.next_vma_id += 1;
        id
    }

    pub fn vmas(&self) -> &[Vma] {
        &self.vmas
    }

    /// Insert a new, non-overlapping vma, keeping the list ordered.
    pub fn insert(&mut self, vma: Vma) {
        let idx = self
            .vmas
            .iter()
            .position(|v| v.start_vfn > vma.start_vfn)
            .unwrap_or(self.vmas.len());
        self.vmas.insert(idx, vma);
    }

    pub fn lookup(&self, vfn: usize) -> Option<&Vma> {
        self.vmas.iter().find(|v| v.contains(vfn))
    }

    pub fn lookup_mut(&mut self, vfn: usize) -> Option<&mut Vma> {
        self.vmas.iter_mut().find(|v| v.contains(vfn))
    }

    pub fn is_range_empty(&self, start_vfn: usize, end_vfn: usize) -> bool {
        !self.vmas.iter().any(|v| v.overlaps(start_vfn, end_vfn))
    }

    /// First-fit search for `npages` contiguous, currently-unmapped frames
    /// within the user range, in the given direction.
    pub fn find_range(&self, npages: usize, dir: SearchDir) -> Option<(usize, usize)> {
        let lo = USER_MEM_LOW_VFN;
        let hi = USER_MEM_HIGH_VFN;
        if npages == 0 || npages > hi - lo {
            return None;
        }
        match dir {
            SearchDir::LoHi => {
                let mut candidate = lo;
                for v in &self.vmas {
                    if v.start_vfn >= candidate + npages {
                        break;
                    }
                    if v.end_vfn > candidate {
                        candidate = v.end_vfn;
                    }
                }
                if candidate + npages <= hi {
                    Some((candidate, candidate + npages))
                } else {
                    None
                }
            }
            SearchDir::HiLo => {
                let mut candidate = hi - npages;
                for v in self.vmas.iter().rev() {
                    if v.end_vfn <= candidate {
                        break;
                    }
                    if v.start_vfn < candidate + npages {
                        if v.start_vfn < npages {
                            return None;
                        }
                        candidate = v.start_vfn - npages;
                    }
                }
                if candidate >= lo {
                    Some((candidate, candidate + npages))
                } else {
                    None
                }
            }
        }
    }

    /// Remove (trim/split/delete) every vma overlapping `[start_vfn,
    /// end_vfn)`, returning the vmas that were fully or partly inside the
    /// range so the caller can drop their mmobj references. Handles all
    /// four overlap shapes: fully contained, straddling (split into two),
    /// left-overlap (trim front), right-overlap (trim back).
    ///
    /// A straddling PRIVATE vma is split into two surviving halves that
    /// can no longer share one mmobj id (the removed middle piece's
    /// reference to it is about to be dropped by the caller, and letting
    /// both halves keep pointing at the same object they held jointly
    /// leaves one of them referencing a freed id once that drop happens).
    /// `split_mmobj` is called once per surviving half with the original
    /// backing id and must return a fresh id shadowing it.
    pub fn remove(
        &mut self,
        start_vfn: usize,
        end_vfn: usize,
        mut split_mmobj: impl FnMut(MmObjId) -> MmObjId,
    ) -> Vec<Vma> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.vmas.len());

        for v in self.vmas.drain(..) {
            if !v.overlaps(start_vfn, end_vfn) {
                kept.push(v);
                continue;
            }
            let fully_contained = v.start_vfn >= start_vfn && v.end_vfn <= end_vfn;
            if fully_contained {
                removed.push(v);
                continue;
            }
            let straddles = v.start_vfn < start_vfn && v.end_vfn > end_vfn;
            if straddles {
                let left_len = start_vfn - v.start_vfn;
                let mut left = v.clone();
                left.end_vfn = start_vfn;
                let mut right = v.clone();
                right.start_vfn = end_vfn;
                right.off += left_len + (end_vfn - start_vfn);
                if v.flags.contains(VmFlags::PRIVATE) {
                    left.mmobj = split_mmobj(v.mmobj);
                    right.mmobj = split_mmobj(v.mmobj);
                }
                removed.push(Vma {
                    id: v.id,
                    start_vfn,
                    end_vfn,
                    off: v.off + left_len,
                    prot: v.prot,
                    flags: v.flags,
                    mmobj: v.mmobj,
                });
                kept.push(left);
                kept.push(right);
                continue;
            }
            if v.start_vfn < start_vfn {
                // right-overlap: trim the tail off v.
                let trimmed_off = v.off + (start_vfn - v.start_vfn);
                removed.push(Vma {
                    id: v.id,
                    start_vfn,
                    end_vfn: v.end_vfn,
                    off: trimmed_off,
                    prot: v.prot,
                    flags: v.flags,
                    mmobj: v.mmobj,
                });
                let mut left = v;
                left.end_vfn = start_vfn;
                kept.push(left);
            } else {
                // left-overlap: trim the head off v.
                let new_off = v.off + (end_vfn - v.start_vfn);
                removed.push(Vma {
                    id: v.id,
                    start_vfn: v.start_vfn,
                    end_vfn,
                    off: v.off,
                    prot: v.prot,
                    flags: v.flags,
                    mmobj: v.mmobj,
                });
                let mut right = v;
                right.start_vfn = end_vfn;
                right.off = new_off;
                kept.push(right);
            }
        }

        kept.sort_by_key(|v| v.start_vfn);
        self.vmas = kept;
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{MmObjId, Prot, VmFlags};

    fn map() -> AddrSpaceMap {
        AddrSpaceMap::new(PageDirId(1))
    }

    fn vma(id: u64, start: usize, end: usize) -> Vma {
        Vma {
            id: VmaId(id),
            start_vfn: start,
            end_vfn: end,
            off: 0,
            prot: Prot::READ | Prot::WRITE,
            flags: VmFlags::PRIVATE | VmFlags::ANON,
            mmobj: MmObjId(id),
        }
    }

    #[test]
    fn find_range_lohi_skips_existing_vma() {
        let mut m = map();
        m.insert(vma(1, USER_MEM_LOW_VFN, USER_MEM_LOW_VFN + 4));
        let (start, end) = m.find_range(2, SearchDir::LoHi).unwrap();
        assert_eq!(start, USER_MEM_LOW_VFN + 4);
        assert_eq!(end, USER_MEM_LOW_VFN + 6);
    }

    #[test]
    fn remove_straddling_splits_into_two() {
        let mut m = map();
        m.insert(vma(1, 100, 200));
        let removed = m.remove(120, 150, |backing| backing);
        assert_eq!(removed.len(), 1);
        assert_eq!((removed[0].start_vfn, removed[0].end_vfn), (120, 150));
        assert_eq!(m.vmas().len(), 2);
        assert_eq!(m.vmas()[0].end_vfn, 120);
        assert_eq!(m.vmas()[1].start_vfn, 150);
    }

    #[test]
    fn remove_straddling_private_vma_gives_each_half_a_distinct_fresh_mmobj() {
        let mut m = map();
        m.insert(vma(1, 100, 200));
        let mut next_shadow = 100u64;
        let removed = m.remove(120, 150, |_backing| {
            next_shadow += 1;
            MmObjId(next_shadow)
        });
        assert_eq!(removed[0].mmobj, MmObjId(1), "removed piece keeps the original id");
        let left = m.lookup(110).unwrap();
        let right = m.lookup(160).unwrap();
        assert_ne!(left.mmobj, MmObjId(1));
        assert_ne!(right.mmobj, MmObjId(1));
        assert_ne!(left.mmobj, right.mmobj, "each half gets its own shadow");
    }

    #[test]
    fn remove_straddling_shared_vma_keeps_both_halves_on_the_same_mmobj() {
        let mut m = map();
        let mut v = vma(1, 100, 200);
        v.flags = VmFlags::SHARED;
        m.insert(v);
        let removed = m.remove(120, 150, |_| panic!("SHARED halves must not be reshadowed"));
        assert_eq!(removed[0].mmobj, MmObjId(1));
        assert_eq!(m.lookup(110).unwrap().mmobj, MmObjId(1));
        assert_eq!(m.lookup(160).unwrap().mmobj, MmObjId(1));
    }

    #[test]
    fn remove_fully_contained_drops_whole_vma() {
        let mut m = map();
        m.insert(vma(1, 100, 110));
        let removed = m.remove(90, 120, |backing| backing);
        assert_eq!(removed.len(), 1);
        assert!(m.vmas().is_empty());
    }

    #[test]
    fn remove_left_and_right_overlap_trims() {
        let mut m = map();
        m.insert(vma(1, 100, 110));
        m.insert(vma(2, 200, 210));
        m.remove(95, 105, |backing| backing);
        m.remove(205, 215, |backing| backing);
        assert_eq!(m.vmas()[0].start_vfn, 105);
        assert_eq!(m.vmas()[1].end_vfn, 205);
    }
}
