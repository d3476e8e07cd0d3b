//! Page-fault resolution over the memory-object chain (component D).
//!
//! These are free functions rather than methods on a `Kernel`: they only
//! need the mmobj table and the page-table handle, which keeps the COW
//! resolution logic testable without standing up a whole kernel, mirroring
//! how the teacher's `vm` helpers take the pieces they need rather than a
//! God object.

use std::collections::HashMap;

use crate::error::{KError, KResult};
use crate::hal::{PageTable, PhysAddr};
use crate::param::PAGE_SIZE;
use crate::vm::{MmObj, MmObjId, MmObjKind, PFrame, Prot, Vma, VmFlags};

/// Walk the shadow chain starting at `obj` looking for `pagenum`. Returns
/// the id of the object the page was actually found resident in (which may
/// be further down the chain than `obj` itself) alongside the frame.
pub fn lookup_page(
    mmobjs: &HashMap<MmObjId, MmObj>,
    obj: MmObjId,
    pagenum: usize,
) -> Option<(MmObjId, PFrame)> {
    let mut cur = obj;
    loop {
        let o = mmobjs.get(&cur)?;
        if let Some(frame) = o.resident.get(&pagenum) {
            return Some((cur, *frame));
        }
        match o.kind {
            MmObjKind::Shadow { shadowed, .. } => cur = shadowed,
            MmObjKind::Anon | MmObjKind::File { .. } => return None,
        }
    }
}

/// Materialize `pagenum` into `obj` (a terminal object: anon or file-backed):
/// zero-fill for anon, or read through `file_read` for a file mapping.
pub fn fill_page(
    hal: &mut dyn PageTable,
    mmobjs: &mut HashMap<MmObjId, MmObj>,
    obj: MmObjId,
    pagenum: usize,
    mut file_read: impl FnMut(MmObjId, usize, &mut [u8]) -> KResult<()>,
) -> KResult<PhysAddr> {
    let pa = hal.alloc_page().ok_or(KError::Enomem)?;
    let is_file = matches!(
        mmobjs.get(&obj).expect("fill_page: unknown mmobj").kind,
        MmObjKind::File { .. }
    );
    if is_file {
        let mut buf = vec![0u8; PAGE_SIZE];
        file_read(obj, pagenum, &mut buf)?;
        hal.write_frame(pa, 0, &buf);
    }
    let o = mmobjs.get_mut(&obj).expect("fill_page: unknown mmobj");
    o.resident.insert(
        pagenum,
        PFrame {
            pagenum,
            phys: pa,
            dirty: false,
        },
    );
    Ok(pa)
}

/// Break copy-on-write sharing: duplicate `src_phys`'s bytes into a fresh
/// frame and record it resident directly on `into_obj`.
pub fn cow_copy(
    hal: &mut dyn PageTable,
    mmobjs: &mut HashMap<MmObjId, MmObj>,
    into_obj: MmObjId,
    pagenum: usize,
    src_phys: PhysAddr,
) -> KResult<PhysAddr> {
    let new_pa = hal.alloc_page().ok_or(KError::Enomem)?;
    let mut buf = vec![0u8; PAGE_SIZE];
    hal.read_frame(src_phys, 0, &mut buf);
    hal.write_frame(new_pa, 0, &buf);
    let o = mmobjs
        .get_mut(&into_obj)
        .expect("cow_copy: unknown mmobj");
    o.resident.insert(
        pagenum,
        PFrame {
            pagenum,
            phys: new_pa,
            dirty: true,
        },
    );
    Ok(new_pa)
}

/// Resolve a fault at `fault_pagenum_in_obj` (already translated through
/// `vma.off`) against `vma`, returning the physical frame to map.
///
/// - Write fault against a read-only vma: `EFAULT`.
/// - Page already resident directly on `vma.mmobj`: use it as-is.
/// - Resident further down the chain, read fault, or a `SHARED` mapping:
///   share the existing frame.
/// - Resident further down the chain, write fault, `PRIVATE` mapping: COW —
///   copy up into `vma.mmobj` before mapping.
/// - Not resident anywhere: fill the chain's bottom object, then apply the
///   same sharing/COW decision against the newly filled frame.
pub fn handle_pagefault(
    hal: &mut dyn PageTable,
    mmobjs: &mut HashMap<MmObjId, MmObj>,
    vma: &Vma,
    fault_pagenum_in_obj: usize,
    for_write: bool,
    mut file_read: impl FnMut(MmObjId, usize, &mut [u8]) -> KResult<()>,
) -> KResult<PhysAddr> {
    if for_write && !vma.prot.contains(Prot::WRITE) {
        return Err(KError::Efault);
    }

    match lookup_page(mmobjs, vma.mmobj, fault_pagenum_in_obj) {
        Some((found_in, frame)) if found_in == vma.mmobj => Ok(frame.phys),
        Some((_, frame)) if !for_write || vma.flags.contains(VmFlags::SHARED) => Ok(frame.phys),
        Some((_, frame)) => cow_copy(hal, mmobjs, vma.mmobj, fault_pagenum_in_obj, frame.phys),
        None => {
            let bottom = mmobjs
                .get(&vma.mmobj)
                .and_then(|o| o.bottom_obj())
                .unwrap_or(vma.mmobj);
            let pa = fill_page(hal, mmobjs, bottom, fault_pagenum_in_obj, &mut file_read)?;
            if bottom == vma.mmobj || !for_write {
                Ok(pa)
            } else {
                cow_copy(hal, mmobjs, vma.mmobj, fault_pagenum_in_obj, pa)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::TestPageTable;

    fn anon(id: u64) -> (MmObjId, MmObj) {
        (MmObjId(id), MmObj::new(MmObjId(id), MmObjKind::Anon))
    }

    #[test]
    fn read_fault_on_unbacked_anon_zero_fills() {
        let mut hal = TestPageTable::new();
        let (id, obj) = anon(1);
        let mut mmobjs = HashMap::new();
        mmobjs.insert(id, obj);
        let vma = Vma {
            id: crate::vm::VmaId(1),
            start_vfn: 0,
            end_vfn: 1,
            off: 0,
            prot: Prot::READ | Prot::WRITE,
            flags: VmFlags::PRIVATE | VmFlags::ANON,
            mmobj: id,
        };
        let pa = handle_pagefault(&mut hal, &mut mmobjs, &vma, 0, false, |_, _, _| Ok(())).unwrap();
        let mut buf = [0xffu8; 1];
        hal.read_frame(pa, 0, &mut buf);
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn write_fault_through_shadow_copies_up_not_down() {
        let mut hal = TestPageTable::new();
        let (bottom_id, bottom) = anon(1);
        let shadow_id = MmObjId(2);
        let shadow = MmObj::new(
            shadow_id,
            MmObjKind::Shadow {
                shadowed: bottom_id,
                bottom_obj: bottom_id,
            },
        );
        let mut mmobjs = HashMap::new();
        mmobjs.insert(bottom_id, bottom);
        mmobjs.insert(shadow_id, shadow);

        let vma = Vma {
            id: crate::vm::VmaId(1),
            start_vfn: 0,
            end_vfn: 1,
            off: 0,
            prot: Prot::READ | Prot::WRITE,
            flags: VmFlags::PRIVATE | VmFlags::ANON,
            mmobj: shadow_id,
        };
        handle_pagefault(&mut hal, &mut mmobjs, &vma, 0, true, |_, _, _| Ok(())).unwrap();
        assert!(mmobjs[&shadow_id].resident.contains_key(&0));
        assert!(
            !mmobjs[&bottom_id].resident.contains_key(&0),
            "bottom object must stay untouched by a private write fault"
        );
    }

    #[test]
    fn write_fault_on_readonly_vma_is_efault() {
        let mut hal = TestPageTable::new();
        let (id, obj) = anon(1);
        let mut mmobjs = HashMap::new();
        mmobjs.insert(id, obj);
        let vma = Vma {
            id: crate::vm::VmaId(1),
            start_vfn: 0,
            end_vfn: 1,
            off: 0,
            prot: Prot::READ,
            flags: VmFlags::PRIVATE,
            mmobj: id,
        };
        assert_eq!(
            handle_pagefault(&mut hal, &mut mmobjs, &vma, 0, true, |_, _, _| Ok(())),
            Err(KError::Efault)
        );
    }
}
