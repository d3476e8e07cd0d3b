//! Wait queues and the cooperative scheduler (component A).
//!
//! Generalizes the teacher's `sync::spinlock`/`sync::sleeplock` pair and its
//! `scheduler::{sleep, wakeup}` functions. The teacher parks a thread by
//! flipping its state to `Sleeping` and calling `sched()` to `swtch` into the
//! next runnable context; real context switching is out of scope here, so
//! the same state machine is realized on top of a single `Condvar` shared by
//! the whole kernel, guarded by the same lock every other operation takes.
//! Only one OS thread ever runs kernel code at a time (a "big kernel lock"),
//! which is exactly the single-CPU, non-preemptive discipline §5 describes:
//! the lock is released only at the documented suspension points
//! (`sleep_on`, `cancellable_sleep_on`).

pub mod mutex;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{KError, KResult};

/// Unique id of a kernel thread, assigned once and never reused.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Tid(pub u64);

/// Unique id of a wait queue, assigned once per queue for its lifetime.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct WqId(pub u64);

static NEXT_TID: AtomicU64 = AtomicU64::new(1);
static NEXT_WQ: AtomicU64 = AtomicU64::new(1);

pub fn alloc_tid() -> Tid {
    Tid(NEXT_TID.fetch_add(1, Ordering::Relaxed))
}

/// Allocate a fresh, initially-empty wait queue id.
pub fn alloc_wq(table: &mut HashMap<WqId, VecDeque<Tid>>) -> WqId {
    let id = WqId(NEXT_WQ.fetch_add(1, Ordering::Relaxed));
    table.insert(id, VecDeque::new());
    id
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadState {
    NoState,
    Run,
    Sleep,
    SleepCancellable,
    Exited,
}

/// A kernel thread's scheduling-relevant state. Process-identity and
/// context fields that don't participate in scheduling live on
/// `crate::proc::thread::Thread`; this is the subset the scheduler itself
/// reads and writes, kept together the way the teacher keeps `p->state`,
/// `p->chan` and `p->killed` co-located on `Proc`.
#[derive(Debug)]
pub struct ThreadControl {
    pub state: ThreadState,
    /// The wait queue this thread is parked on, if any. Invariant 8: this is
    /// `Some` iff state is `Sleep` or `SleepCancellable`.
    pub wchan: Option<WqId>,
    pub cancelled: bool,
    pub retval: Option<i32>,
}

impl ThreadControl {
    pub fn new() -> ThreadControl {
        ThreadControl {
            state: ThreadState::NoState,
            wchan: None,
            cancelled: false,
            retval: None,
        }
    }
}

impl Default for ThreadControl {
    fn default() -> Self {
        ThreadControl::new()
    }
}

/// The scheduler's bookkeeping: every thread's control block plus the
/// global runnable queue and the wait-queue table. Owned by
/// `crate::proc::Kernel` and mutated only while its lock is held.
#[derive(Default)]
pub struct Scheduler {
    pub threads: HashMap<Tid, ThreadControl>,
    pub run_queue: VecDeque<Tid>,
    pub wait_queues: HashMap<WqId, VecDeque<Tid>>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler::default()
    }

    pub fn register_thread(&mut self, tid: Tid) {
        self.threads.insert(tid, ThreadControl::new());
    }

    pub fn forget_thread(&mut self, tid: Tid) {
        self.threads.remove(&tid);
    }

    pub fn control(&self, tid: Tid) -> &ThreadControl {
        self.threads
            .get(&tid)
            .expect("scheduler: unknown thread id")
    }

    pub fn control_mut(&mut self, tid: Tid) -> &mut ThreadControl {
        self.threads
            .get_mut(&tid)
            .expect("scheduler: unknown thread id")
    }

    /// `make_runnable(t)`: t.state := RUN; insert at tail of run queue.
    pub fn make_runnable(&mut self, tid: Tid) {
        self.control_mut(tid).state = ThreadState::Run;
        self.run_queue.push_back(tid);
    }

    /// Park `tid` on wait queue `wq`, recording the link both ways
    /// (invariant 8). Does not itself suspend anything — the caller
    /// (`System::sleep_on`) performs the actual blocking wait.
    fn enqueue(&mut self, tid: Tid, wq: WqId, cancellable: bool) {
        let ctl = self.control_mut(tid);
        ctl.state = if cancellable {
            ThreadState::SleepCancellable
        } else {
            ThreadState::Sleep
        };
        ctl.wchan = Some(wq);
        self.wait_queues.entry(wq).or_default().push_back(tid);
    }

    /// `wakeup_on(q)`: dequeue the head of `q` (FIFO), clear its wchan, and
    /// make it runnable. Returns the woken thread, if any.
    pub fn wakeup_on(&mut self, wq: WqId) -> Option<Tid> {
        let tid = self.wait_queues.get_mut(&wq)?.pop_front()?;
        self.control_mut(tid).wchan = None;
        self.make_runnable(tid);
        Some(tid)
    }

    /// Wake every thread currently parked on `q`, in FIFO order.
    pub fn wakeup_all_on(&mut self, wq: WqId) {
        while self.wakeup_on(wq).is_some() {}
    }

    /// `cancel(t, retval)`: one-shot. Always records cancellation + retval
    /// (kill_all depends on this even for threads that are RUN/EXITED); if
    /// `t` is parked on a cancellable queue, it is pulled off immediately
    /// and made runnable rather than waiting for its resource.
    pub fn cancel(&mut self, tid: Tid, retval: i32) {
        let ctl = self.control_mut(tid);
        ctl.cancelled = true;
        ctl.retval = Some(retval);

        if ctl.state == ThreadState::SleepCancellable {
            let wq = ctl.wchan.expect("invariant 8: cancellable sleeper has a wchan");
            if let Some(q) = self.wait_queues.get_mut(&wq) {
                q.retain(|t| *t != tid);
            }
            self.make_runnable(tid);
        }
    }
}

/// The facade every suspension point is realized through: a `Scheduler`
/// behind a lock plus the one condition variable that stands in for a real
/// context switch. `S` is whatever larger state (the rest of `Kernel`) the
/// scheduler is embedded in; callers pass a projection closure so this stays
/// reusable without every caller re-deriving the same `wait_while` dance.
pub struct Switcher {
    pub cvar: std::sync::Condvar,
}

impl Switcher {
    pub fn new() -> Switcher {
        Switcher {
            cvar: std::sync::Condvar::new(),
        }
    }

    /// `sleep_on(q)`: mark curthr asleep on `q` and block until some other
    /// thread of execution wakes it via `wakeup_on`/`cancel`.
    pub fn sleep_on<'a, T>(
        &self,
        mut guard: std::sync::MutexGuard<'a, T>,
        sched: impl Fn(&mut T) -> &mut Scheduler,
        tid: Tid,
        wq: WqId,
    ) -> std::sync::MutexGuard<'a, T> {
        sched(&mut guard).enqueue(tid, wq, false);
        self.cvar
            .wait_while(guard, |s| sched(s).control(tid).state == ThreadState::Sleep)
            .expect("kernel lock poisoned")
    }

    /// `cancellable_sleep_on(q)`: same as `sleep_on`, but returns `EINTR`
    /// instead of `Ok(())` if `cancel` fired while parked (or had already
    /// fired before we even got here).
    pub fn cancellable_sleep_on<'a, T>(
        &self,
        mut guard: std::sync::MutexGuard<'a, T>,
        sched: impl Fn(&mut T) -> &mut Scheduler,
        tid: Tid,
        wq: WqId,
    ) -> (std::sync::MutexGuard<'a, T>, KResult<()>) {
        if sched(&mut guard).control(tid).cancelled {
            return (guard, Err(KError::Eintr));
        }
        sched(&mut guard).enqueue(tid, wq, true);
        let mut guard = self
            .cvar
            .wait_while(guard, |s| {
                sched(s).control(tid).state == ThreadState::SleepCancellable
            })
            .expect("kernel lock poisoned");
        let cancelled = sched(&mut guard).control(tid).cancelled;
        let result = if cancelled { Err(KError::Eintr) } else { Ok(()) };
        (guard, result)
    }

    pub fn notify_all(&self) {
        self.cvar.notify_all();
    }
}

impl Default for Switcher {
    fn default() -> Self {
        Switcher::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> (Scheduler, Tid, Tid) {
        let mut s = Scheduler::new();
        let a = alloc_tid();
        let b = alloc_tid();
        s.register_thread(a);
        s.register_thread(b);
        (s, a, b)
    }

    #[test]
    fn wakeup_is_fifo() {
        let (mut s, a, b) = fresh();
        let wq = alloc_wq(&mut s.wait_queues);
        s.enqueue(a, wq, false);
        s.enqueue(b, wq, false);
        assert_eq!(s.wakeup_on(wq), Some(a));
        assert_eq!(s.control(a).state, ThreadState::Run);
        assert_eq!(s.wakeup_on(wq), Some(b));
        assert_eq!(s.wakeup_on(wq), None);
    }

    #[test]
    fn cancel_wakes_cancellable_sleeper_only() {
        let (mut s, a, b) = fresh();
        let wq = alloc_wq(&mut s.wait_queues);
        s.enqueue(a, wq, true);
        s.enqueue(b, wq, false);

        s.cancel(a, 42);
        assert_eq!(s.control(a).state, ThreadState::Run);
        assert!(s.control(a).cancelled);
        assert_eq!(s.control(a).retval, Some(42));

        // b was non-cancellable: untouched by cancel.
        assert_eq!(s.control(b).state, ThreadState::Sleep);
        assert!(!s.control(b).cancelled);
    }

    #[test]
    fn cancel_on_running_thread_just_records() {
        let (mut s, a, _b) = fresh();
        s.make_runnable(a);
        s.cancel(a, 7);
        assert_eq!(s.control(a).state, ThreadState::Run);
        assert!(s.control(a).cancelled);
        assert_eq!(s.control(a).retval, Some(7));
    }

    #[test]
    fn wchan_invariant_holds_through_enqueue_and_wake() {
        let (mut s, a, _b) = fresh();
        let wq = alloc_wq(&mut s.wait_queues);
        s.enqueue(a, wq, false);
        assert_eq!(s.control(a).wchan, Some(wq));
        s.wakeup_on(wq);
        assert_eq!(s.control(a).wchan, None);
    }
}
