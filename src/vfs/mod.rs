//! The VFS namespace layer: vnodes, open file descriptions, and path
//! resolution (component E).

pub mod file;
pub mod namev;
pub mod vnode;

pub use file::{FdTable, FileEntry, FileId, FileTable, OpenMode};
pub use vnode::{Vnode, VnodeId, VnodeKind, VnodeOps, VnodeStat, VnodeTable};
