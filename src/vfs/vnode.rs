//! Vnodes: the filesystem-independent object every path component resolves
//! to. `VnodeOps` is the open-ended seam — unlike `vm::MmObjKind`, new
//! filesystem drivers are expected, so this stays a trait object rather
//! than a closed enum (see `vm::mmobj` for the contrasting case).

use std::collections::HashMap;

use crate::error::{KError, KResult};
use crate::vm::MmObjId;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct VnodeId(pub u64);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VnodeKind {
    Regular,
    Directory,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct VnodeStat {
    pub size: usize,
    pub is_dir: bool,
}

/// The operations a concrete filesystem (e.g. `fs::ramfs`) must provide for
/// one vnode. Directory entries are created by the table (which owns id
/// allocation) and then linked into the parent via `link_child`, mirroring
/// how the teacher's `namev` calls into `vnode->vn_ops->create` and then
/// records the result in the directory's own entry list.
pub trait VnodeOps: Send + std::fmt::Debug {
    fn kind(&self) -> VnodeKind;

    /// Resolve a single path component against this (directory) vnode.
    fn lookup(&self, name: &str) -> KResult<VnodeId>;

    /// Record a new child under `name`. Called after the table has already
    /// allocated `child`'s vnode.
    fn link_child(&mut self, name: &str, child: VnodeId) -> KResult<()>;

    /// Remove the directory entry named `name` (not the vnode itself: that
    /// happens once its refcount drops to zero).
    fn unlink_child(&mut self, name: &str) -> KResult<()>;

    /// Entry at position `index` in iteration order, if any.
    fn readdir(&self, index: usize) -> Option<(String, VnodeId)>;

    fn is_empty_dir(&self) -> bool;

    fn read(&self, offset: usize, buf: &mut [u8]) -> KResult<usize>;
    fn write(&mut self, offset: usize, buf: &[u8]) -> KResult<usize>;
    fn len(&self) -> usize;
}

pub struct Vnode {
    pub id: VnodeId,
    pub ops: Box<dyn VnodeOps>,
    pub refcount: usize,
    /// Lazily allocated the first time this vnode is mmapped; reused by
    /// every later mmap of the same vnode so `SHARED` mappings actually
    /// share state. Cleared once the object it names becomes unreachable.
    pub mmobj: Option<MmObjId>,
}

/// The kernel's flat vnode table. Filesystems other than the root (none
/// exist yet) would each own a table like this behind a mount point.
#[derive(Default)]
pub struct VnodeTable {
    next_id: u64,
    nodes: HashMap<VnodeId, Vnode>,
}

impl VnodeTable {
    pub fn new() -> VnodeTable {
        VnodeTable {
            next_id: 1,
            nodes: HashMap::new(),
        }
    }

    pub fn alloc(&mut self, ops: Box<dyn VnodeOps>) -> VnodeId {
        let id = VnodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            Vnode {
                id,
                ops,
                refcount: 1,
                mmobj: None,
            },
        );
        id
    }

    pub fn get(&self, id: VnodeId) -> KResult<&Vnode> {
        self.nodes.get(&id).ok_or(KError::Enoent)
    }

    pub fn get_mut(&mut self, id: VnodeId) -> KResult<&mut Vnode> {
        self.nodes.get_mut(&id).ok_or(KError::Enoent)
    }

    pub fn incref(&mut self, id: VnodeId) -> KResult<()> {
        self.get_mut(id)?.refcount += 1;
        Ok(())
    }

    /// Drop one reference; once it reaches zero the vnode is removed from
    /// the table entirely (nothing else may still name it, by invariant).
    pub fn decref(&mut self, id: VnodeId) {
        if let Some(v) = self.nodes.get_mut(&id) {
            v.refcount -= 1;
            if v.refcount == 0 {
                self.nodes.remove(&id);
            }
        }
    }
}
