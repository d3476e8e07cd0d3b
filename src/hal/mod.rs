//! Hardware abstraction layer: the physical frame allocator and page-table
//! interface the spec calls out as an external collaborator (§1), realized
//! as a trait instead of `target_arch`-gated assembly the way the teacher's
//! `arch::mem`/`arch::virtual_memory` modules re-export per-architecture
//! implementations behind one surface (`arch/mod.rs`).
//!
//! `TestPageTable` is the host-memory-backed implementation `Kernel::bootstrap`
//! installs in the absence of a real MMU; it is swappable without touching
//! any of the process/VM/VFS logic above it.

use std::collections::HashMap;

use crate::param::PAGE_SIZE;

bitflags::bitflags! {
    /// Page-directory flags a fault handler passes to `map` (§6).
    #[derive(Copy, Clone, Debug)]
    pub struct PdFlags: u8 {
        const PRESENT = 0b001;
        const USER    = 0b010;
        const WRITE   = 0b100;
    }
}

/// A physical page frame's address, as handed back by `alloc_page`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PhysAddr(pub usize);

/// Opaque per-process hardware page-directory handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PageDirId(pub u64);

/// The external interface §1 names: `alloc_page`, `map`, `unmap_range`,
/// `flush_tlb`, `virt_to_phys`.
pub trait PageTable: Send {
    fn new_pagedir(&mut self) -> PageDirId;
    fn destroy_pagedir(&mut self, pd: PageDirId);

    /// Allocate a fresh zero-filled physical page frame.
    fn alloc_page(&mut self) -> Option<PhysAddr>;
    fn free_page(&mut self, pa: PhysAddr);

    /// Install a mapping for one page-aligned virtual address.
    fn map(&mut self, pd: PageDirId, vaddr: usize, paddr: PhysAddr, flags: PdFlags);
    /// Remove mappings for `[start, start + len)` (both page-aligned).
    fn unmap_range(&mut self, pd: PageDirId, start: usize, len: usize);
    fn flush_tlb(&mut self);

    /// Translate a mapped virtual address to its backing physical address.
    fn virt_to_phys(&self, pd: PageDirId, vaddr: usize) -> Option<PhysAddr>;

    /// Read/write raw frame contents (the core's stand-in for `memcpy`
    /// against physical memory, since there is no real address space to
    /// dereference into on the host).
    fn read_frame(&self, pa: PhysAddr, offset: usize, buf: &mut [u8]);
    fn write_frame(&mut self, pa: PhysAddr, offset: usize, buf: &[u8]);
}

/// A host-memory-backed `PageTable`: every "physical frame" is a `Vec<u8>`
/// of `PAGE_SIZE` bytes in a table, and every "page directory" is a map from
/// virtual page number to physical frame, all living in ordinary heap
/// memory. Flushing the TLB is a no-op since there is no cache to flush.
pub struct TestPageTable {
    next_pa: usize,
    next_pd: u64,
    frames: HashMap<usize, Vec<u8>>,
    pagedirs: HashMap<PageDirId, HashMap<usize, PhysAddr>>,
}

impl TestPageTable {
    pub fn new() -> TestPageTable {
        TestPageTable {
            next_pa: PAGE_SIZE,
            next_pd: 1,
            frames: HashMap::new(),
            pagedirs: HashMap::new(),
        }
    }
}

impl Default for TestPageTable {
    fn default() -> Self {
        TestPageTable::new()
    }
}

impl PageTable for TestPageTable {
    fn new_pagedir(&mut self) -> PageDirId {
        let id = PageDirId(self.next_pd);
        self.next_pd += 1;
        self.pagedirs.insert(id, HashMap::new());
        id
    }

    fn destroy_pagedir(&mut self, pd: PageDirId) {
        self.pagedirs.remove(&pd);
    }

    fn alloc_page(&mut self) -> Option<PhysAddr> {
        let pa = PhysAddr(self.next_pa);
        self.next_pa += PAGE_SIZE;
        self.frames.insert(pa.0, vec![0u8; PAGE_SIZE]);
        Some(pa)
    }

    fn free_page(&mut self, pa: PhysAddr) {
        self.frames.remove(&pa.0);
    }

    fn map(&mut self, pd: PageDirId, vaddr: usize, paddr: PhysAddr, _flags: PdFlags) {
        if let Some(table) = self.pagedirs.get_mut(&pd) {
            table.insert(vaddr, paddr);
        }
    }

    fn unmap_range(&mut self, pd: PageDirId, start: usize, len: usize) {
        if let Some(table) = self.pagedirs.get_mut(&pd) {
            let mut vaddr = start;
            while vaddr < start + len {
                table.remove(&vaddr);
                vaddr += PAGE_SIZE;
            }
        }
    }

    fn flush_tlb(&mut self) {}

    fn virt_to_phys(&self, pd: PageDirId, vaddr: usize) -> Option<PhysAddr> {
        self.pagedirs.get(&pd)?.get(&vaddr).copied()
    }

    fn read_frame(&self, pa: PhysAddr, offset: usize, buf: &mut [u8]) {
        let frame = self.frames.get(&pa.0).expect("read of unmapped frame");
        buf.copy_from_slice(&frame[offset..offset + buf.len()]);
    }

    fn write_frame(&mut self, pa: PhysAddr, offset: usize, buf: &[u8]) {
        let frame = self.frames.get_mut(&pa.0).expect("write of unmapped frame");
        frame[offset..offset + buf.len()].copy_from_slice(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_then_translate_then_unmap() {
        let mut hw = TestPageTable::new();
        let pd = hw.new_pagedir();
        let pa = hw.alloc_page().unwrap();
        hw.map(pd, 0x1000, pa, PdFlags::PRESENT | PdFlags::USER);
        assert_eq!(hw.virt_to_phys(pd, 0x1000), Some(pa));
        hw.unmap_range(pd, 0x1000, PAGE_SIZE);
        assert_eq!(hw.virt_to_phys(pd, 0x1000), None);
    }

    #[test]
    fn frame_read_write_roundtrip() {
        let mut hw = TestPageTable::new();
        let pa = hw.alloc_page().unwrap();
        hw.write_frame(pa, 0, &[0x55]);
        let mut out = [0u8; 1];
        hw.read_frame(pa, 0, &mut out);
        assert_eq!(out[0], 0x55);
    }
}
