//! The kernel: process/thread lifecycle (component B) plus the syscall-level
//! operations that tie components A-E together behind one lock.
//!
//! Generalizes the teacher's global `PROCS`/`proctable` plus its
//! `trap`/`syscall` dispatch into a single `Kernel` whose every operation
//! takes the same lock the scheduler itself uses — the "big kernel lock"
//! `sync` documents. There is no real context switch: a blocked operation
//! releases the lock by calling into `Switcher::sleep_on`/`cancellable_sleep_on`
//! and nothing runs until some other OS thread, standing in for another CPU
//! in a preemptive system, calls back into the kernel and wakes it.

pub mod process;
pub mod thread;

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{KError, KResult};
use crate::fs::ramfs;
use crate::hal::{PageTable, PdFlags, TestPageTable};
use crate::param::{self, addr_to_pn, page_align_up, PAGE_SIZE};
use crate::sync::{alloc_tid, alloc_wq, Scheduler, Switcher, ThreadState, Tid};
use crate::vfs::vnode::VnodeTable;
use crate::vfs::{FileId, FileTable, OpenMode, VnodeId, VnodeKind};
use crate::vm::{AddrSpaceMap, MmObj, MmObjId, MmObjKind, Prot, SearchDir, Vma, VmFlags};

pub use process::{Pid, ProcState, Process};
pub use thread::{Context, ForkRegs, Thread, ThreadEntry};

thread_local! {
    /// The CPU-local record: which (process, thread) the calling OS thread
    /// is presently executing as. Real hardware would thread this through
    /// an implicit per-core pointer; a real OS thread here plays the part
    /// of "the CPU currently running this kernel thread".
    static CURRENT: Cell<Option<(Pid, Tid)>> = Cell::new(None);
}

struct KernelState {
    sched: Scheduler,
    processes: HashMap<Pid, Process>,
    threads: HashMap<Tid, Thread>,
    mmobjs: HashMap<MmObjId, MmObj>,
    next_mmobj: u64,
    vnodes: VnodeTable,
    files: FileTable,
    hal: Box<dyn PageTable>,
    root: VnodeId,
    next_pid: i32,
}

pub struct Kernel {
    state: Mutex<KernelState>,
    switcher: Switcher,
}

impl Kernel {
    /// Build a fresh kernel: mount the root filesystem, create the idle and
    /// init processes (pids 0 and 1, per `param`), and make the calling OS
    /// thread `curthr` of `init`.
    pub fn bootstrap() -> Arc<Kernel> {
        let mut state = KernelState {
            sched: Scheduler::new(),
            processes: HashMap::new(),
            threads: HashMap::new(),
            mmobjs: HashMap::new(),
            next_mmobj: 1,
            vnodes: VnodeTable::new(),
            files: FileTable::new(),
            hal: Box::new(TestPageTable::new()),
            root: VnodeId(0),
            next_pid: param::PID_IDLE,
        };
        let root = ramfs::mkroot(&mut state.vnodes);
        state.root = root;

        let idle_pid = Self::create_process_locked(&mut state, "idle", None, root)
            .expect("process table has room for idle");
        let idle_tid = Self::create_thread_locked(&mut state, idle_pid, Context::default());
        state.sched.make_runnable(idle_tid);

        // init's parent is idle itself, not ownerless like idle is.
        let init_pid = Self::create_process_locked(&mut state, "init", Some(idle_pid), root)
            .expect("process table has room for init");
        let init_tid = Self::create_thread_locked(&mut state, init_pid, Context::default());
        state.sched.make_runnable(init_tid);

        let kernel = Arc::new(Kernel {
            state: Mutex::new(state),
            switcher: Switcher::new(),
        });
        kernel.set_current(init_pid, init_tid);
        log::info!("kernel bootstrapped: idle={:?} init={:?}", idle_pid, init_pid);
        kernel
    }

    fn lock(&self) -> MutexGuard<'_, KernelState> {
        self.state.lock().expect("kernel lock poisoned")
    }

    /// Make the calling OS thread "become" the given kernel thread. Used by
    /// bootstrap and by anything that wants to drive a second, genuinely
    /// concurrent kernel thread via `std::thread::spawn`.
    pub fn set_current(&self, pid: Pid, tid: Tid) {
        CURRENT.with(|c| c.set(Some((pid, tid))));
    }

    pub fn current(&self) -> (Pid, Tid) {
        CURRENT
            .with(|c| c.get())
            .expect("no current process/thread set on this OS thread")
    }

    /// Scan the table starting at `next_pid`, wrapping mod `NPROC`, for the
    /// lowest currently-unused pid; advances `next_pid` past whatever it
    /// returns. `None` once every one of the `NPROC` slots is occupied.
    fn alloc_pid_locked(state: &mut KernelState) -> Option<Pid> {
        let start = state.next_pid;
        let mut pid = start;
        loop {
            if !state.processes.contains_key(&Pid(pid)) {
                state.next_pid = (pid + 1) % param::NPROC as i32;
                return Some(Pid(pid));
            }
            pid = (pid + 1) % param::NPROC as i32;
            if pid == start {
                return None;
            }
        }
    }

    fn create_process_locked(
        state: &mut KernelState,
        name: &str,
        parent: Option<Pid>,
        cwd: VnodeId,
    ) -> KResult<Pid> {
        if state.processes.len() >= param::NPROC {
            return Err(KError::Enomem);
        }
        let pid = Self::alloc_pid_locked(state).ok_or(KError::Enomem)?;
        let waitq = alloc_wq(&mut state.sched.wait_queues);
        let pagedir = state.hal.new_pagedir();
        let vm = AddrSpaceMap::new(pagedir);
        state.vnodes.incref(cwd).ok();
        let proc = Process::new(pid, name.to_string(), parent, waitq, vm, cwd);
        state.processes.insert(pid, proc);
        Ok(pid)
    }

    fn create_thread_locked(state: &mut KernelState, owner: Pid, context: Context) -> Tid {
        let tid = alloc_tid();
        state.sched.register_thread(tid);
        state.threads.insert(tid, Thread::new(tid, owner, context));
        state
            .processes
            .get_mut(&owner)
            .expect("create_thread_locked: unknown owner")
            .threads
            .push(tid);
        tid
    }

    fn alloc_mmobj_locked(state: &mut KernelState, kind: MmObjKind) -> MmObjId {
        let id = MmObjId(state.next_mmobj);
        state.next_mmobj += 1;
        state.mmobjs.insert(id, MmObj::new(id, kind));
        id
    }

    /// Drop one reference to `id`; if that was its last, free its resident
    /// frames and recurse down a shadow chain (the object it shadowed may
    /// now be unreachable too).
    fn release_mmobj_locked(state: &mut KernelState, id: MmObjId) {
        let unreachable = match state.mmobjs.get_mut(&id) {
            Some(obj) => {
                obj.refcount = obj.refcount.saturating_sub(1);
                obj.is_unreachable()
            }
            None => false,
        };
        if !unreachable {
            return;
        }
        if let Some(obj) = state.mmobjs.remove(&id) {
            for frame in obj.resident.values() {
                state.hal.free_page(frame.phys);
            }
            match obj.kind {
                MmObjKind::Shadow { shadowed, .. } => Self::release_mmobj_locked(state, shadowed),
                MmObjKind::File { vnode } => {
                    if let Ok(v) = state.vnodes.get_mut(vnode) {
                        if v.mmobj == Some(id) {
                            v.mmobj = None;
                        }
                    }
                }
                MmObjKind::Anon => {}
            }
        }
    }

    /// Interpose a fresh shadow over `backing` (used when an interior
    /// `munmap` straddle-splits a PRIVATE vma into two independently
    /// COW-able halves; each half gets its own shadow over the same
    /// backing object rather than continuing to share one mmobj id).
    fn split_shadow_locked(
        mmobjs: &mut HashMap<MmObjId, MmObj>,
        next_mmobj: &mut u64,
        backing: MmObjId,
    ) -> MmObjId {
        let bottom = mmobjs.get(&backing).and_then(|o| o.bottom_obj()).unwrap_or(backing);
        let id = MmObjId(*next_mmobj);
        *next_mmobj += 1;
        mmobjs.insert(
            id,
            MmObj::new(
                id,
                MmObjKind::Shadow {
                    shadowed: backing,
                    bottom_obj: bottom,
                },
            ),
        );
        mmobjs.get_mut(&backing).expect("vma mmobj missing").refcount += 1;
        id
    }

    /// Unlink a destroyed vma from the bottom object's back-index, if it was
    /// ever linked there (only PRIVATE vmas are).
    fn unlink_vma_from_bottom_locked(state: &mut KernelState, vma: &Vma) {
        if let Some(bottom) = state.mmobjs.get(&vma.mmobj).and_then(|o| o.bottom_obj()) {
            if let Some(obj) = state.mmobjs.get_mut(&bottom) {
                obj.vmas.retain(|id| *id != vma.id);
            }
        }
    }

    fn destroy_process_locked(state: &mut KernelState, pid: Pid) {
        let Some(proc) = state.processes.remove(&pid) else {
            return;
        };
        for (_, file_id) in proc.fds.iter() {
            if let Some(vnode) = state.files.decref(file_id) {
                state.vnodes.decref(vnode);
            }
        }
        state.vnodes.decref(proc.cwd);
        let vmas: Vec<Vma> = proc.vm.vmas().to_vec();
        for vma in &vmas {
            Self::unlink_vma_from_bottom_locked(state, vma);
        }
        for vma in vmas {
            Self::release_mmobj_locked(state, vma.mmobj);
        }
        state.hal.destroy_pagedir(proc.vm.pagedir);
        for t in &proc.threads {
            state.sched.forget_thread(*t);
            state.threads.remove(t);
        }
    }

    // ---- component B: process & thread lifecycle -------------------------

    /// Duplicate `curproc`: a new address space that copy-on-write shares
    /// every private mapping with the parent, a descriptor table sharing
    /// every open file description, the same cwd, and one new thread whose
    /// saved context matches `curthr`'s but "returns" 0.
    pub fn fork(&self) -> KResult<Pid> {
        let (ppid, ptid) = self.current();
        let mut state = self.lock();

        let parent_cwd = state.processes[&ppid].cwd;
        let parent_name = state.processes[&ppid].name.clone();
        let child_pid = Self::create_process_locked(
            &mut state,
            &format!("{}-child", parent_name),
            Some(ppid),
            parent_cwd,
        )?;

        let parent_vmas: Vec<Vma> = state.processes[&ppid].vm.vmas().to_vec();
        for vma in parent_vmas {
            let mut private_bottom = None;
            let child_mmobj = if vma.flags.contains(VmFlags::SHARED) {
                state.mmobjs.get_mut(&vma.mmobj).expect("vma mmobj missing").refcount += 1;
                vma.mmobj
            } else {
                // Classic shadow-of-shadow COW: interpose a *fresh* shadow
                // between the parent's vma and the object it used to point
                // at directly, and give the child an equivalent shadow of
                // the same object. Neither parent nor child ever writes
                // into the shared object again — each write COWs into its
                // own shadow — so leaving the parent's vma pointing at the
                // old object directly would let a post-fork parent write
                // land somewhere the child's shadow chain can still see.
                let bottom = state
                    .mmobjs
                    .get(&vma.mmobj)
                    .and_then(|o| o.bottom_obj())
                    .unwrap_or(vma.mmobj);
                let parent_shadow = Self::alloc_mmobj_locked(
                    &mut state,
                    MmObjKind::Shadow {
                        shadowed: vma.mmobj,
                        bottom_obj: bottom,
                    },
                );
                let child_shadow = Self::alloc_mmobj_locked(
                    &mut state,
                    MmObjKind::Shadow {
                        shadowed: vma.mmobj,
                        bottom_obj: bottom,
                    },
                );
                // Two new shadows now directly reference the old object.
                state.mmobjs.get_mut(&vma.mmobj).expect("vma mmobj missing").refcount += 2;
                state
                    .processes
                    .get_mut(&ppid)
                    .expect("curproc vanished")
                    .vm
                    .lookup_mut(vma.start_vfn)
                    .expect("parent vma vanished mid-fork")
                    .mmobj = parent_shadow;
                private_bottom = Some(bottom);
                child_shadow
            };
            let child_vma_id = state
                .processes
                .get_mut(&child_pid)
                .expect("just created")
                .vm
                .alloc_vma_id();
            if let Some(bottom) = private_bottom {
                state
                    .mmobjs
                    .get_mut(&bottom)
                    .expect("bottom mmobj missing")
                    .vmas
                    .push(child_vma_id);
            }
            state
                .processes
                .get_mut(&child_pid)
                .expect("just created")
                .vm
                .insert(Vma {
                    id: child_vma_id,
                    start_vfn: vma.start_vfn,
                    end_vfn: vma.end_vfn,
                    off: vma.off,
                    prot: vma.prot,
                    flags: vma.flags,
                    mmobj: child_mmobj,
                });
        }

        let parent_fds: Vec<(i32, FileId)> = state.processes[&ppid].fds.iter().collect();
        for (fd, file_id) in parent_fds {
            state.files.incref(file_id);
            state
                .processes
                .get_mut(&child_pid)
                .expect("just created")
                .fds
                .install_at(fd, file_id)
                .ok();
        }

        let (brk_start, brk) = {
            let p = &state.processes[&ppid];
            (p.brk_start, p.brk)
        };
        {
            let c = state.processes.get_mut(&child_pid).expect("just created");
            c.brk_start = brk_start;
            c.brk = brk;
        }

        state
            .processes
            .get_mut(&ppid)
            .expect("curproc vanished")
            .children
            .push(child_pid);

        let parent_ctx = state.threads[&ptid].context;
        let child_tid = Self::create_thread_locked(&mut state, child_pid, parent_ctx);
        state.threads.get_mut(&child_tid).expect("just created").fork_return = Some(ForkRegs::default());
        state.sched.make_runnable(child_tid);

        Ok(child_pid)
    }

    /// Consume and return the zero `fork()` observes in the child, if
    /// `curthr` is a freshly-forked child that hasn't read it yet.
    pub fn take_fork_return(&self) -> Option<i64> {
        let (_, tid) = self.current();
        let mut state = self.lock();
        state
            .threads
            .get_mut(&tid)
            .and_then(|t| t.fork_return.take())
            .map(|r| r.return_slot)
    }

    /// Terminate `curthr`. Once every thread of `curproc` has exited, the
    /// process becomes a zombie: its children are reparented to `init` and
    /// its parent (sleeping in `waitpid`) is woken.
    pub fn exit(&self, status: i32) {
        let (pid, tid) = self.current();
        let mut state = self.lock();
        if let Some(t) = state.threads.get_mut(&tid) {
            t.exit_value = Some(status);
        }
        state.sched.control_mut(tid).state = ThreadState::Exited;

        let all_exited = state.processes[&pid]
            .threads
            .iter()
            .all(|t| state.sched.control(*t).state == ThreadState::Exited);
        if all_exited {
            Self::zombify_locked(&mut state, pid, status);
        }
        self.switcher.notify_all();
    }

    fn zombify_locked(state: &mut KernelState, pid: Pid, status: i32) {
        let init_pid = Pid(param::PID_INIT);
        let children = state.processes[&pid].children.clone();
        for c in children {
            if let Some(child) = state.processes.get_mut(&c) {
                child.parent = Some(init_pid);
            }
            if pid != init_pid {
                if let Some(init) = state.processes.get_mut(&init_pid) {
                    init.children.push(c);
                }
            }
        }
        let parent = {
            let proc = state.processes.get_mut(&pid).expect("zombify: unknown pid");
            proc.state = ProcState::Dead;
            proc.exit_status = status;
            proc.parent
        };
        if let Some(p) = parent {
            if let Some(parent_proc) = state.processes.get(&p) {
                let wq = parent_proc.waitq;
                state.sched.wakeup_all_on(wq);
            }
        }
    }

    /// Block until a child matching `target` (`-1` for any) has exited,
    /// reap it, and return its pid and exit status.
    pub fn waitpid(&self, target: i32) -> KResult<(Pid, i32)> {
        let (pid, tid) = self.current();
        let mut guard = self.lock();
        loop {
            if guard.processes[&pid].children.is_empty() {
                return Err(KError::Echild);
            }
            let dead = guard.processes[&pid].children.iter().copied().find(|c| {
                (target == -1 || c.0 == target)
                    && guard.processes.get(c).map(|p| p.is_dead()).unwrap_or(false)
            });
            if let Some(cpid) = dead {
                let status = guard.processes[&cpid].exit_status;
                guard
                    .processes
                    .get_mut(&pid)
                    .expect("curproc vanished")
                    .children
                    .retain(|c| *c != cpid);
                Self::destroy_process_locked(&mut guard, cpid);
                return Ok((cpid, status));
            }
            let wq = guard.processes[&pid].waitq;
            guard = self
                .switcher
                .sleep_on(guard, |s: &mut KernelState| &mut s.sched, tid, wq);
        }
    }

    /// Mark every thread of `target` cancelled; each observes it the next
    /// time it would block or is otherwise checked (no preemption here).
    /// Killing the running process is special-cased: a non-sleeping thread
    /// never observes a cancellation, so the only way to actually stop it is
    /// to exit it directly.
    pub fn kill(&self, target: i32, status: i32) -> KResult<()> {
        let (curpid, _) = self.current();
        if target == curpid.0 {
            self.exit(status);
            return Ok(());
        }
        let mut state = self.lock();
        let pid = Pid(target);
        let threads = state
            .processes
            .get(&pid)
            .ok_or(KError::Einval)?
            .threads
            .clone();
        for t in threads {
            state.sched.cancel(t, status);
        }
        self.switcher.notify_all();
        Ok(())
    }

    /// Cancel every process whose parent isn't idle, e.g. at shutdown — idle
    /// itself (no parent) and init (idle's only direct child) are spared.
    /// If the caller itself qualifies it's exited directly rather than
    /// cancelled, for the same reason `kill` special-cases the running
    /// process.
    pub fn kill_all(&self) {
        let (curpid, _) = self.current();
        let mut state = self.lock();
        let pids: Vec<Pid> = state
            .processes
            .iter()
            .filter(|(p, proc)| {
                **p != curpid && proc.parent.map_or(false, |pp| pp.0 != param::PID_IDLE)
            })
            .map(|(p, _)| *p)
            .collect();
        for pid in pids {
            let threads = state.processes[&pid].threads.clone();
            for t in threads {
                state.sched.cancel(t, -1);
            }
        }
        let kill_self = state
            .processes
            .get(&curpid)
            .and_then(|p| p.parent)
            .map_or(false, |pp| pp.0 != param::PID_IDLE);
        self.switcher.notify_all();
        drop(state);
        if kill_self {
            self.exit(-1);
        }
    }

    // ---- component D: page-fault resolution / mmap / brk -----------------

    /// An unrecoverable fault kills the faulting process with `EFAULT` rather
    /// than handing a recoverable-looking error back up to a caller that has
    /// nowhere sensible to propagate it — there is no signal delivery here,
    /// just the process's own exit path.
    pub fn handle_fault(&self, vaddr: usize, for_write: bool) -> KResult<()> {
        let result = self.resolve_fault(vaddr, for_write);
        if let Err(e) = result {
            self.exit(e.to_errno());
        }
        result
    }

    fn resolve_fault(&self, vaddr: usize, for_write: bool) -> KResult<()> {
        let (pid, _) = self.current();
        let mut guard = self.lock();
        let state = &mut *guard;
        let vfn = addr_to_pn(vaddr);
        let proc = state.processes.get(&pid).ok_or(KError::Efault)?;
        let vma = proc.vm.lookup(vfn).ok_or(KError::Efault)?.clone();
        let pagedir = proc.vm.pagedir;
        let pagenum_in_obj = vma.mmobj_pagenum(vfn);

        let vnode_opt = state
            .mmobjs
            .get(&vma.mmobj)
            .and_then(|o| o.bottom_obj())
            .and_then(|b| state.mmobjs.get(&b))
            .and_then(|bo| match bo.kind {
                MmObjKind::File { vnode } => Some(vnode),
                _ => None,
            });
        let vnodes = &state.vnodes;

        let pa = crate::vm::pagefault::handle_pagefault(
            &mut *state.hal,
            &mut state.mmobjs,
            &vma,
            pagenum_in_obj,
            for_write,
            |_obj, pagenum, buf| match vnode_opt {
                Some(vnode) => {
                    let v = vnodes.get(vnode).map_err(|_| KError::Efault)?;
                    let n = v.ops.read(pagenum * PAGE_SIZE, buf)?;
                    buf[n..].fill(0);
                    Ok(())
                }
                None => Ok(()),
            },
        )?;

        let mut flags = PdFlags::PRESENT | PdFlags::USER;
        if vma.prot.contains(Prot::WRITE) {
            flags |= PdFlags::WRITE;
        }
        state.hal.map(pagedir, param::pn_to_addr(vfn), pa, flags);
        state.hal.flush_tlb();
        Ok(())
    }

    /// Map `len` bytes anonymously (or backed by `fd` at byte offset `off`
    /// if given), returning the chosen start address.
    pub fn do_mmap(
        &self,
        len: usize,
        prot: Prot,
        flags: VmFlags,
        fd: Option<i32>,
        off: usize,
    ) -> KResult<usize> {
        if len == 0 {
            return Err(KError::Einval);
        }
        let (pid, _) = self.current();
        let mut state = self.lock();
        let npages = page_align_up(len) / PAGE_SIZE;

        // The backing object: a fresh anon object, or the vnode's own
        // lazily-allocated (and shared across every mmap of it) file object.
        let backing = match fd {
            Some(fd) => {
                let file_id = state.processes[&pid].fds.get(fd)?;
                let vnode = state.files.get(file_id)?.vnode;
                match state.vnodes.get(vnode)?.mmobj {
                    Some(id) => {
                        state.mmobjs.get_mut(&id).expect("cached mmobj missing").refcount += 1;
                        id
                    }
                    None => {
                        let id = Self::alloc_mmobj_locked(&mut state, MmObjKind::File { vnode });
                        state.vnodes.get_mut(vnode).expect("vnode vanished").mmobj = Some(id);
                        id
                    }
                }
            }
            None => Self::alloc_mmobj_locked(&mut state, MmObjKind::Anon),
        };

        // PRIVATE mappings COW off the backing object through a shadow of
        // their own; SHARED mappings point at it directly.
        let mmobj = if flags.contains(VmFlags::PRIVATE) {
            Self::alloc_mmobj_locked(
                &mut state,
                MmObjKind::Shadow {
                    shadowed: backing,
                    bottom_obj: backing,
                },
            )
        } else {
            backing
        };

        let (start_vfn, end_vfn) = state.processes[&pid]
            .vm
            .find_range(npages, SearchDir::HiLo)
            .ok_or(KError::Enomem)?;
        let vma_id = state.processes.get_mut(&pid).unwrap().vm.alloc_vma_id();
        if flags.contains(VmFlags::PRIVATE) {
            state.mmobjs.get_mut(&backing).expect("backing mmobj missing").vmas.push(vma_id);
        }
        state.processes.get_mut(&pid).unwrap().vm.insert(Vma {
            id: vma_id,
            start_vfn,
            end_vfn,
            off: off / PAGE_SIZE,
            prot,
            flags,
            mmobj,
        });
        Ok(param::pn_to_addr(start_vfn))
    }

    pub fn do_munmap(&self, addr: usize, len: usize) -> KResult<()> {
        if len == 0 || !param::is_page_aligned(addr) {
            return Err(KError::Einval);
        }
        let (pid, _) = self.current();
        let mut guard = self.lock();
        let state = &mut *guard;
        let start_vfn = addr_to_pn(addr);
        let end_vfn = addr_to_pn(page_align_up(addr + len));
        let pagedir = state.processes[&pid].vm.pagedir;
        let mmobjs = &mut state.mmobjs;
        let next_mmobj = &mut state.next_mmobj;
        let removed = state
            .processes
            .get_mut(&pid)
            .expect("curproc vanished")
            .vm
            .remove(start_vfn, end_vfn, |backing| {
                Self::split_shadow_locked(mmobjs, next_mmobj, backing)
            });
        for vma in &removed {
            Self::unlink_vma_from_bottom_locked(state, vma);
        }
        for vma in removed {
            Self::release_mmobj_locked(state, vma.mmobj);
        }
        state
            .hal
            .unmap_range(pagedir, param::pn_to_addr(start_vfn), (end_vfn - start_vfn) * PAGE_SIZE);
        state.hal.flush_tlb();
        Ok(())
    }

    /// Grow or shrink the heap by `incr` bytes (negative to shrink),
    /// returning the new break address. The heap lives in one anonymous,
    /// private vma starting at `brk_start`; growing it extends that vma
    /// into adjoining free space, shrinking it trims/unmaps the tail.
    pub fn do_brk(&self, incr: isize) -> KResult<usize> {
        let (pid, _) = self.current();
        let mut state = self.lock();
        let (brk_start, old_brk) = {
            let p = &state.processes[&pid];
            (p.brk_start, p.brk)
        };
        let new_brk = (old_brk as isize + incr).max(brk_start as isize) as usize;
        let heap_start_vfn = addr_to_pn(brk_start);
        let old_end_vfn = addr_to_pn(page_align_up(old_brk));
        let new_end_vfn = addr_to_pn(page_align_up(new_brk));

        if new_end_vfn > old_end_vfn {
            if !state.processes[&pid].vm.is_range_empty(old_end_vfn, new_end_vfn) {
                return Err(KError::Enomem);
            }
            // The heap is always the single vma starting at `brk_start`, if
            // it has grown before; extend it in place rather than creating
            // a second adjoining one.
            let heap_id = state.processes[&pid]
                .vm
                .vmas()
                .iter()
                .find(|v| v.start_vfn == heap_start_vfn)
                .map(|v| v.id);
            match heap_id {
                Some(id) => {
                    let mmobjs = &mut state.mmobjs;
                    let next_mmobj = &mut state.next_mmobj;
                    let vm = &mut state.processes.get_mut(&pid).unwrap().vm;
                    let mut vmas = vm.remove(heap_start_vfn, old_end_vfn, |backing| {
                        Self::split_shadow_locked(mmobjs, next_mmobj, backing)
                    });
                    let mut heap_vma = vmas.pop().expect("heap vma missing");
                    debug_assert_eq!(heap_vma.id, id);
                    heap_vma.end_vfn = new_end_vfn;
                    vm.insert(heap_vma);
                }
                None => {
                    let mmobj = Self::alloc_mmobj_locked(&mut state, MmObjKind::Anon);
                    let vma_id = state.processes.get_mut(&pid).unwrap().vm.alloc_vma_id();
                    state.processes.get_mut(&pid).unwrap().vm.insert(Vma {
                        id: vma_id,
                        start_vfn: heap_start_vfn,
                        end_vfn: new_end_vfn,
                        off: 0,
                        prot: Prot::READ | Prot::WRITE,
                        flags: VmFlags::PRIVATE | VmFlags::ANON,
                        mmobj,
                    });
                }
            }
        } else if new_end_vfn < old_end_vfn {
            let pagedir = state.processes[&pid].vm.pagedir;
            let mmobjs = &mut state.mmobjs;
            let next_mmobj = &mut state.next_mmobj;
            let removed = state
                .processes
                .get_mut(&pid)
                .unwrap()
                .vm
                .remove(new_end_vfn, old_end_vfn, |backing| {
                    Self::split_shadow_locked(mmobjs, next_mmobj, backing)
                });
            for vma in &removed {
                Self::unlink_vma_from_bottom_locked(&mut state, vma);
            }
            for vma in removed {
                Self::release_mmobj_locked(&mut state, vma.mmobj);
            }
            state.hal.unmap_range(
                pagedir,
                param::pn_to_addr(new_end_vfn),
                (old_end_vfn - new_end_vfn) * PAGE_SIZE,
            );
        }

        state.processes.get_mut(&pid).unwrap().brk = new_brk;
        Ok(new_brk)
    }

    // ---- component E: VFS namespace / descriptor table --------------------

    pub fn open(&self, path: &str, mode: OpenMode, create: bool) -> KResult<i32> {
        let (pid, _) = self.current();
        let mut state = self.lock();
        let root = state.root;
        let cwd = state.processes[&pid].cwd;

        let vnode = match crate::vfs::namev::open_namev(&state.vnodes, path, root, cwd) {
            Ok(id) => id,
            Err(KError::Enoent) if create => {
                let (parent, name) = crate::vfs::namev::dir_namev(&state.vnodes, path, root, cwd)?;
                if name.is_empty() {
                    return Err(KError::Einval);
                }
                ramfs::create(&mut state.vnodes, parent, &name)?
            }
            Err(e) => return Err(e),
        };
        if state.vnodes.get(vnode)?.ops.kind() == VnodeKind::Directory && mode.contains(OpenMode::WRITE) {
            return Err(KError::Eisdir);
        }
        state.vnodes.incref(vnode).ok();
        let file_id = state.files.alloc(vnode, mode);
        state.processes.get_mut(&pid).unwrap().fds.install_lowest(file_id)
    }

    pub fn close(&self, fd: i32) -> KResult<()> {
        let (pid, _) = self.current();
        let mut state = self.lock();
        let file_id = state.processes.get_mut(&pid).unwrap().fds.clear(fd)?;
        if let Some(vnode) = state.files.decref(file_id) {
            state.vnodes.decref(vnode);
        }
        Ok(())
    }

    pub fn read(&self, fd: i32, buf: &mut [u8]) -> KResult<usize> {
        let (pid, _) = self.current();
        let mut state = self.lock();
        let file_id = state.processes[&pid].fds.get(fd)?;
        if !state.files.get(file_id)?.mode.contains(OpenMode::READ) {
            return Err(KError::Ebadf);
        }
        let vnode = state.files.get(file_id)?.vnode;
        let pos = state.files.get(file_id)?.pos;
        let n = state.vnodes.get(vnode)?.ops.read(pos, buf)?;
        state.files.get_mut(file_id)?.pos += n;
        Ok(n)
    }

    pub fn write(&self, fd: i32, buf: &[u8]) -> KResult<usize> {
        let (pid, _) = self.current();
        let mut state = self.lock();
        let file_id = state.processes[&pid].fds.get(fd)?;
        if !state.files.get(file_id)?.mode.contains(OpenMode::WRITE) {
            return Err(KError::Ebadf);
        }
        let vnode = state.files.get(file_id)?.vnode;
        let append = state.files.get(file_id)?.mode.contains(OpenMode::APPEND);
        let pos = if append {
            state.vnodes.get(vnode)?.ops.len()
        } else {
            state.files.get(file_id)?.pos
        };
        let n = state.vnodes.get_mut(vnode)?.ops.write(pos, buf)?;
        state.files.get_mut(file_id)?.pos = pos + n;
        Ok(n)
    }

    pub fn lseek(&self, fd: i32, offset: i64, whence: Whence) -> KResult<usize> {
        let (pid, _) = self.current();
        let mut state = self.lock();
        let file_id = state.processes[&pid].fds.get(fd)?;
        let vnode = state.files.get(file_id)?.vnode;
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => state.files.get(file_id)?.pos as i64,
            Whence::End => state.vnodes.get(vnode)?.ops.len() as i64,
        };
        let new_pos = base + offset;
        if new_pos < 0 {
            return Err(KError::Einval);
        }
        state.files.get_mut(file_id)?.pos = new_pos as usize;
        Ok(new_pos as usize)
    }

    pub fn dup(&self, fd: i32) -> KResult<i32> {
        let (pid, _) = self.current();
        let mut state = self.lock();
        let file_id = state.processes[&pid].fds.get(fd)?;
        state.files.incref(file_id);
        state.processes.get_mut(&pid).unwrap().fds.install_lowest(file_id)
    }

    pub fn dup2(&self, oldfd: i32, newfd: i32) -> KResult<i32> {
        let (pid, _) = self.current();
        let mut state = self.lock();
        let file_id = state.processes[&pid].fds.get(oldfd)?;
        state.files.incref(file_id);
        let replaced = state.processes.get_mut(&pid).unwrap().fds.install_at(newfd, file_id)?;
        if let Some(old) = replaced {
            if let Some(vnode) = state.files.decref(old) {
                state.vnodes.decref(vnode);
            }
        }
        Ok(newfd)
    }

    /// Create a device special with no backing driver: every read/write on
    /// it is `ENXIO`, there being nothing here to register a driver against.
    pub fn mknod(&self, path: &str) -> KResult<()> {
        let (pid, _) = self.current();
        let mut state = self.lock();
        let root = state.root;
        let cwd = state.processes[&pid].cwd;
        let (parent, name) = crate::vfs::namev::dir_namev(&state.vnodes, path, root, cwd)?;
        if name.is_empty() {
            return Err(KError::Einval);
        }
        ramfs::mknod(&mut state.vnodes, parent, &name)?;
        Ok(())
    }

    pub fn mkdir(&self, path: &str) -> KResult<()> {
        let (pid, _) = self.current();
        let mut state = self.lock();
        let root = state.root;
        let cwd = state.processes[&pid].cwd;
        let (parent, name) = crate::vfs::namev::dir_namev(&state.vnodes, path, root, cwd)?;
        if name.is_empty() {
            return Err(KError::Einval);
        }
        ramfs::mkdir(&mut state.vnodes, parent, &name)?;
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> KResult<()> {
        let (pid, _) = self.current();
        let mut state = self.lock();
        let root = state.root;
        let cwd = state.processes[&pid].cwd;
        let (parent, name) = crate::vfs::namev::dir_namev(&state.vnodes, path, root, cwd)?;
        if name.is_empty() {
            return Err(KError::Einval);
        }
        ramfs::rmdir(&mut state.vnodes, parent, &name)
    }

    pub fn unlink(&self, path: &str) -> KResult<()> {
        let (pid, _) = self.current();
        let mut state = self.lock();
        let root = state.root;
        let cwd = state.processes[&pid].cwd;
        let (parent, name) = crate::vfs::namev::dir_namev(&state.vnodes, path, root, cwd)?;
        if name.is_empty() {
            return Err(KError::Einval);
        }
        ramfs::unlink(&mut state.vnodes, parent, &name)
    }

    pub fn link(&self, existing_path: &str, new_path: &str) -> KResult<()> {
        let (pid, _) = self.current();
        let mut state = self.lock();
        let root = state.root;
        let cwd = state.processes[&pid].cwd;
        let existing = crate::vfs::namev::open_namev(&state.vnodes, existing_path, root, cwd)?;
        let (parent, name) = crate::vfs::namev::dir_namev(&state.vnodes, new_path, root, cwd)?;
        if name.is_empty() {
            return Err(KError::Einval);
        }
        ramfs::link(&mut state.vnodes, parent, &name, existing)
    }

    /// `link(old, new)` then `unlink(old)`. Non-atomic: a crash or error
    /// between the two leaves `old` linked under both names.
    pub fn rename(&self, old_path: &str, new_path: &str) -> KResult<()> {
        self.link(old_path, new_path)?;
        self.unlink(old_path)
    }

    pub fn chdir(&self, path: &str) -> KResult<()> {
        let (pid, _) = self.current();
        let mut state = self.lock();
        let root = state.root;
        let cwd = state.processes[&pid].cwd;
        let target = crate::vfs::namev::open_namev(&state.vnodes, path, root, cwd)?;
        if state.vnodes.get(target)?.ops.kind() != VnodeKind::Directory {
            return Err(KError::Enotdir);
        }
        state.vnodes.incref(target).ok();
        let old_cwd = std::mem::replace(&mut state.processes.get_mut(&pid).unwrap().cwd, target);
        state.vnodes.decref(old_cwd);
        Ok(())
    }

    pub fn stat(&self, path: &str) -> KResult<crate::vfs::VnodeStat> {
        let (pid, _) = self.current();
        let state = self.lock();
        let root = state.root;
        let cwd = state.processes[&pid].cwd;
        let vnode = crate::vfs::namev::open_namev(&state.vnodes, path, root, cwd)?;
        let v = state.vnodes.get(vnode)?;
        Ok(crate::vfs::VnodeStat {
            size: v.ops.len(),
            is_dir: v.ops.kind() == VnodeKind::Directory,
        })
    }

    pub fn getdent(&self, fd: i32, index: usize) -> KResult<Option<(String, VnodeId)>> {
        let (pid, _) = self.current();
        let state = self.lock();
        let file_id = state.processes[&pid].fds.get(fd)?;
        let vnode = state.files.get(file_id)?.vnode;
        let v = state.vnodes.get(vnode)?;
        if v.ops.kind() != VnodeKind::Directory {
            return Err(KError::Enotdir);
        }
        Ok(v.ops.readdir(index))
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_creates_idle_and_init() {
        let kernel = Kernel::bootstrap();
        let state = kernel.lock();
        assert!(state.processes.contains_key(&Pid(param::PID_IDLE)));
        assert!(state.processes.contains_key(&Pid(param::PID_INIT)));
    }

    #[test]
    fn fork_gives_child_its_own_pid_and_registers_parent_link() {
        let kernel = Kernel::bootstrap();
        let child = kernel.fork().unwrap();
        assert_ne!(child, Pid(param::PID_INIT));
        let state = kernel.lock();
        assert_eq!(state.processes[&child].parent, Some(Pid(param::PID_INIT)));
        assert!(state.processes[&Pid(param::PID_INIT)].children.contains(&child));
    }

    #[test]
    fn fork_then_write_is_cow_isolated_from_parent() {
        let kernel = Kernel::bootstrap();
        kernel.do_mmap(PAGE_SIZE, Prot::READ | Prot::WRITE, VmFlags::PRIVATE | VmFlags::ANON, None, 0).unwrap();
        let vaddr = {
            let state = kernel.lock();
            let (pid, _) = kernel.current();
            state.processes[&pid].vm.vmas()[0].start_vfn * PAGE_SIZE
        };
        kernel.handle_fault(vaddr, true).unwrap();

        let child = kernel.fork().unwrap();

        // Parent writes after fork: child must not observe it.
        kernel.handle_fault(vaddr, true).unwrap();
        {
            let mut state = kernel.lock();
            let (pid, _) = kernel.current();
            let pagedir = state.processes[&pid].vm.pagedir;
            let pa = state.hal.virt_to_phys(pagedir, vaddr).unwrap();
            state.hal.write_frame(pa, 0, &[0xAB]);
        }

        let (parent_tid, child_tid) = {
            let state = kernel.lock();
            (
                state.processes[&Pid(param::PID_INIT)].threads[0],
                state.processes[&child].threads[0],
            )
        };
        let _ = parent_tid;
        kernel.set_current(child, child_tid);
        kernel.handle_fault(vaddr, false).unwrap();
        let mut buf = [0u8; 1];
        {
            let state = kernel.lock();
            let pagedir = state.processes[&child].vm.pagedir;
            let pa = state.hal.virt_to_phys(pagedir, vaddr).unwrap();
            state.hal.read_frame(pa, 0, &mut buf);
        }
        assert_eq!(buf[0], 0, "child must not see the parent's post-fork write");
    }

    #[test]
    fn exit_then_waitpid_reaps_zombie() {
        let kernel = Kernel::bootstrap();
        let child = kernel.fork().unwrap();
        let child_tid = {
            let state = kernel.lock();
            state.processes[&child].threads[0]
        };
        kernel.set_current(child, child_tid);
        kernel.exit(7);

        kernel.set_current(Pid(param::PID_INIT), {
            let state = kernel.lock();
            state.processes[&Pid(param::PID_INIT)].threads[0]
        });
        let (pid, status) = kernel.waitpid(-1).unwrap();
        assert_eq!(pid, child);
        assert_eq!(status, 7);
        assert!(kernel.waitpid(-1).is_err());
    }

    #[test]
    fn path_with_repeated_and_trailing_slashes_resolves_through_kernel() {
        let kernel = Kernel::bootstrap();
        kernel.mkdir("/a").unwrap();
        kernel.open("/a/b", OpenMode::WRITE | OpenMode::READ, true).unwrap();
        kernel.stat("/a///b/").unwrap();
    }

    #[test]
    fn rename_moves_name_and_old_path_is_gone() {
        let kernel = Kernel::bootstrap();
        kernel.open("/a", OpenMode::WRITE | OpenMode::READ, true).unwrap();
        kernel.rename("/a", "/b").unwrap();
        assert!(kernel.stat("/a").is_err());
        assert!(kernel.stat("/b").is_ok());
    }

    #[test]
    fn mknod_creates_a_device_that_is_enxio_on_read() {
        let kernel = Kernel::bootstrap();
        kernel.mknod("/dev0").unwrap();
        let fd = kernel.open("/dev0", OpenMode::READ, false).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(kernel.read(fd, &mut buf), Err(KError::Enxio)));
    }

    #[test]
    fn mmap_shared_file_twice_shares_the_same_mmobj() {
        let kernel = Kernel::bootstrap();
        let fd = kernel.open("/f", OpenMode::WRITE | OpenMode::READ, true).unwrap();
        kernel
            .do_mmap(PAGE_SIZE, Prot::READ | Prot::WRITE, VmFlags::SHARED, Some(fd), 0)
            .unwrap();
        kernel
            .do_mmap(PAGE_SIZE, Prot::READ | Prot::WRITE, VmFlags::SHARED, Some(fd), 0)
            .unwrap();
        let state = kernel.lock();
        let (pid, _) = kernel.current();
        let vmas = state.processes[&pid].vm.vmas();
        assert_eq!(vmas.len(), 2);
        assert_eq!(vmas[0].mmobj, vmas[1].mmobj, "repeated SHARED mmaps of one vnode share an mmobj");
    }

    #[test]
    fn mmap_private_file_wraps_the_shared_backing_in_its_own_shadow() {
        let kernel = Kernel::bootstrap();
        let fd = kernel.open("/g", OpenMode::WRITE | OpenMode::READ, true).unwrap();
        kernel
            .do_mmap(PAGE_SIZE, Prot::READ | Prot::WRITE, VmFlags::PRIVATE, Some(fd), 0)
            .unwrap();
        kernel
            .do_mmap(PAGE_SIZE, Prot::READ | Prot::WRITE, VmFlags::SHARED, Some(fd), 0)
            .unwrap();
        let state = kernel.lock();
        let (pid, _) = kernel.current();
        let vmas = state.processes[&pid].vm.vmas();
        assert_ne!(
            vmas[0].mmobj, vmas[1].mmobj,
            "a PRIVATE mapping's shadow must not be the same object a SHARED mapping points at directly"
        );
    }

    #[test]
    fn brk_growth_is_a_single_extending_vma() {
        let kernel = Kernel::bootstrap();
        let b1 = kernel.do_brk(PAGE_SIZE as isize).unwrap();
        let b2 = kernel.do_brk(PAGE_SIZE as isize).unwrap();
        assert!(b2 > b1);
        let state = kernel.lock();
        let (pid, _) = kernel.current();
        assert_eq!(state.processes[&pid].vm.vmas().len(), 1);
    }
}
