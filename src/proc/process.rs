//! The process: a name, a parent/child position in the process tree, an
//! address space, a descriptor table, and the thread(s) executing in it.

use crate::sync::{Tid, WqId};
use crate::vfs::{FdTable, VnodeId};
use crate::vm::AddrSpaceMap;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Pid(pub i32);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcState {
    Running,
    /// Exited but not yet reaped by a parent's `waitpid`; carries its
    /// exit status alongside.
    Dead,
}

#[derive(Debug)]
pub struct Process {
    pub pid: Pid,
    pub name: String,
    pub parent: Option<Pid>,
    pub children: Vec<Pid>,
    pub state: ProcState,
    pub exit_status: i32,
    /// Where a parent blocks in `waitpid` for one of this process's
    /// children to die — owned by the process itself, not by any one call.
    pub waitq: WqId,
    pub vm: AddrSpaceMap,
    pub fds: FdTable,
    pub cwd: VnodeId,
    pub brk_start: usize,
    pub brk: usize,
    pub threads: Vec<Tid>,
}

impl Process {
    pub fn new(
        pid: Pid,
        name: String,
        parent: Option<Pid>,
        waitq: WqId,
        vm: AddrSpaceMap,
        cwd: VnodeId,
    ) -> Process {
        Process {
            pid,
            name,
            parent,
            children: Vec::new(),
            state: ProcState::Running,
            exit_status: 0,
            waitq,
            vm,
            fds: FdTable::new(),
            cwd,
            brk_start: crate::param::HEAP_START,
            brk: crate::param::HEAP_START,
            threads: Vec::new(),
        }
    }

    pub fn is_dead(&self) -> bool {
        self.state == ProcState::Dead
    }
}
