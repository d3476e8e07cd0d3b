//! The non-reentrant, sleep-based mutex used by vnode implementations (§5).
//!
//! Grounded on the teacher's `sync::sleeplock::Sleeplock` (FIFO sleep/wakeup
//! on a private channel) and its commented-out `sync::mutex::Mutex` sketch —
//! this is that sketch finished, generalized from a single hard-coded
//! spinning channel to the core's general-purpose `Scheduler`/`Switcher`.
//! Unlike a spinlock it never busy-waits: on contention the caller sleeps on
//! a FIFO wait queue, and `unlock` hands ownership straight to the head
//! sleeper rather than merely waking everyone to race for it.

use super::{alloc_wq, KError, KResult, Scheduler, Switcher, Tid, WqId};

pub struct KMutex {
    holder: Option<Tid>,
    wq: WqId,
}

impl KMutex {
    pub fn new(sched: &mut Scheduler) -> KMutex {
        KMutex {
            holder: None,
            wq: alloc_wq(&mut sched.wait_queues),
        }
    }

    pub fn holder(&self) -> Option<Tid> {
        self.holder
    }

    /// Blocking lock. Precondition (asserted): caller does not already hold it.
    pub fn lock<'a, T>(
        &mut self,
        switcher: &Switcher,
        mut guard: std::sync::MutexGuard<'a, T>,
        sched: impl Fn(&mut T) -> &mut Scheduler,
        tid: Tid,
    ) -> std::sync::MutexGuard<'a, T> {
        assert_ne!(self.holder, Some(tid), "kmutex: lock is not reentrant");
        if self.holder.is_none() {
            self.holder = Some(tid);
            return guard;
        }
        loop {
            guard = switcher.sleep_on(guard, &sched, tid, self.wq);
            if self.holder == Some(tid) {
                return guard;
            }
            // Spurious wake from an unrelated notify_all; the FIFO transfer
            // in `unlock` guarantees we only truly wake once we're the new
            // holder, but re-check defensively rather than assume it.
        }
    }

    /// Cancellable lock variant: returns `EINTR` if the wait was cancelled
    /// instead of acquiring the lock.
    pub fn lock_cancellable<'a, T>(
        &mut self,
        switcher: &Switcher,
        mut guard: std::sync::MutexGuard<'a, T>,
        sched: impl Fn(&mut T) -> &mut Scheduler,
        tid: Tid,
    ) -> (std::sync::MutexGuard<'a, T>, KResult<()>) {
        assert_ne!(self.holder, Some(tid), "kmutex: lock is not reentrant");
        if self.holder.is_none() {
            self.holder = Some(tid);
            return (guard, Ok(()));
        }
        loop {
            let (g, result) = switcher.cancellable_sleep_on(guard, &sched, tid, self.wq);
            guard = g;
            match result {
                Err(KError::Eintr) => return (guard, Err(KError::Eintr)),
                Ok(()) if self.holder == Some(tid) => return (guard, Ok(())),
                _ => continue,
            }
        }
    }

    /// Precondition (asserted): caller is the current holder. Hands the lock
    /// straight to the FIFO head of the wait queue, if any.
    pub fn unlock(&mut self, switcher: &Switcher, sched: &mut Scheduler, tid: Tid) {
        assert_eq!(self.holder, Some(tid), "kmutex: unlock by non-holder");
        self.holder = sched.wakeup_on(self.wq);
        switcher.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::alloc_tid;

    #[test]
    fn second_locker_blocks_then_acquires_after_unlock() {
        let mut sched = Scheduler::new();
        let a = alloc_tid();
        let b = alloc_tid();
        sched.register_thread(a);
        sched.register_thread(b);
        let mut m = KMutex::new(&mut sched);

        // `a` locks uncontended.
        assert!(m.holder().is_none());
        m.holder = Some(a);

        // `b` would block: simulate the enqueue half of `lock` directly
        // since a real `wait_while` needs a live Mutex<T> guard.
        sched.register_thread(b);
        let wq = m.wq;
        sched
            .wait_queues
            .get_mut(&wq)
            .unwrap()
            .push_back(b);
        sched.control_mut(b).state = super::super::ThreadState::Sleep;
        sched.control_mut(b).wchan = Some(wq);

        // `a` unlocks: ownership transfers straight to `b`.
        let switcher = Switcher::new();
        m.unlock(&switcher, &mut sched, a);
        assert_eq!(m.holder(), Some(b));
        assert_eq!(sched.control(b).state, super::super::ThreadState::Run);
    }

    #[test]
    #[should_panic(expected = "not reentrant")]
    fn relock_by_holder_panics() {
        let mut sched = Scheduler::new();
        let a = alloc_tid();
        sched.register_thread(a);
        let mut m = KMutex::new(&mut sched);
        m.holder = Some(a);
        let switcher = Switcher::new();
        let outer = std::sync::Mutex::new(0u8);
        let guard = outer.lock().unwrap();
        let _ = m.lock(&switcher, guard, |x: &mut u8| {
            // never reached for a reentrant caller: panics before sleeping.
            unreachable!("{}", x)
        }, a);
    }
}
