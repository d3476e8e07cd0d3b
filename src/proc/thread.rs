//! Thread identity and saved context (component B).
//!
//! Generalizes the teacher's `Trapframe`/`Context` pair: real register
//! state and a real kernel stack only matter once something actually jumps
//! into user code, which is out of scope here (§1's dispatch trampoline).
//! What's kept is the bookkeeping a caller can observe: a kernel stack size,
//! a saved context record, and the fields `Scheduler::ThreadControl` doesn't
//! own (exit value, owning process, intrusive process-thread-list position).

use crate::proc::Pid;
use crate::sync::Tid;

/// `entry(a, b)` as `thread_create` would set a stack up to call, kept as
/// data since nothing here ever actually invokes it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ThreadEntry {
    pub entry: usize,
    pub arg_a: usize,
    pub arg_b: usize,
}

/// A register snapshot as `fork_setup_stack` would consume (§6). Only the
/// return-value slot is meaningful to this core: `Kernel::fork` zeroes it so
/// the child "observes" a 0 return from fork.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ForkRegs {
    pub return_slot: i64,
}

/// Saved context: stack pointer, instruction pointer, page-directory
/// pointer, stack base/size, exactly as the spec's data model lists them.
#[derive(Copy, Clone, Debug, Default)]
pub struct Context {
    pub sp: usize,
    pub ip: usize,
    pub pagedir: u64,
    pub stack_base: usize,
    pub stack_size: usize,
}

pub const DEFAULT_KSTACK_SIZE: usize = 8192;

#[derive(Debug)]
pub struct Thread {
    pub tid: Tid,
    pub owner: Pid,
    pub kstack_size: usize,
    pub context: Context,
    pub exit_value: Option<i32>,
    /// Set on a freshly-forked child; `Kernel::take_fork_return` consumes it
    /// once, the way the real value is only meaningful the first time the
    /// child resumes past its `fork` call.
    pub fork_return: Option<ForkRegs>,
}

impl Thread {
    pub fn new(tid: Tid, owner: Pid, context: Context) -> Thread {
        Thread {
            tid,
            owner,
            kstack_size: DEFAULT_KSTACK_SIZE,
            context,
            exit_value: None,
            fork_return: None,
        }
    }
}
