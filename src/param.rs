//! Kernel-wide tunables, generalized from the teacher's flat constant table.
//!
//! Unlike the teacher (which sizes static arrays against these constants for
//! a fixed memory budget on bare metal), `Kernel` holds growable collections
//! bounded by these constants: there is no physical table to lay out ahead
//! of time once hardware is out of scope, only a limit to enforce.

/// Maximum number of open files per process (size of the descriptor table).
pub const NOFILE: usize = 32;

/// Maximum number of simultaneously-live processes (size of the process table).
pub const NPROC: usize = 128;

/// Maximum path length accepted by path resolution.
pub const MAXPATHLEN: usize = 1024;

/// Maximum length of a single path component.
pub const NAMELEN: usize = 256;

/// Bytes per virtual/physical page.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Lowest user-mappable virtual address.
pub const USER_MEM_LOW: usize = 0x0010_0000;
/// One past the highest user-mappable virtual address.
pub const USER_MEM_HIGH: usize = 0x8000_0000;

/// Where a fresh process's heap (`brk`) starts growing from.
pub const HEAP_START: usize = USER_MEM_LOW;

pub const USER_MEM_LOW_VFN: usize = USER_MEM_LOW >> PAGE_SHIFT;
pub const USER_MEM_HIGH_VFN: usize = USER_MEM_HIGH >> PAGE_SHIFT;

/// Reserved pid of the idle process.
pub const PID_IDLE: i32 = 0;
/// Reserved pid of the init process.
pub const PID_INIT: i32 = 1;

/// Convert a byte address to its virtual frame number.
pub const fn addr_to_pn(addr: usize) -> usize {
    addr >> PAGE_SHIFT
}

/// Convert a virtual frame number back to its page-aligned byte address.
pub const fn pn_to_addr(pn: usize) -> usize {
    pn << PAGE_SHIFT
}

/// Round an address down to the start of its containing page.
pub const fn page_align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Round an address up to the start of the next page (or itself if aligned).
pub const fn page_align_up(addr: usize) -> usize {
    page_align_down(addr + PAGE_SIZE - 1)
}

pub const fn is_page_aligned(addr: usize) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}
