//! Virtual memory: the COW memory-object chain (component C) and the
//! address-space map / page-fault resolver built on top of it (component D).

pub mod addrspace;
pub mod mmobj;
pub mod pagefault;
pub mod vma;

pub use addrspace::{AddrSpaceMap, SearchDir};
pub use mmobj::{MmObj, MmObjId, MmObjKind, PFrame};
pub use vma::{Prot, Vma, VmFlags, VmaId};
