//! Condition variables on top of the wait-queue primitives.

use alloc::sync::{Arc, Weak};

use log::trace;

use crate::mutex::Mutex;
use crate::scheduler::Scheduler;
use crate::waitqueue::WaitQueue;

/// A condition variable paired with a [`Mutex`] at each wait.
#[derive(Debug)]
pub struct CondVar {
    sched: Weak<Scheduler>,
    waiters: WaitQueue,
}

unsafe impl Send for CondVar {}
unsafe impl Sync for CondVar {}

impl CondVar {
    pub fn new(sched: &Arc<Scheduler>) -> CondVar {
        CondVar {
            sched: Arc::downgrade(sched),
            waiters: WaitQueue::new(),
        }
    }

    fn sched(&self) -> Arc<Scheduler> {
        self.sched
            .upgrade()
            .expect("scheduler dropped under a live condition variable")
    }

    /// Atomically releases `mtx` and blocks until a signal or broadcast;
    /// reacquires `mtx` before returning. The caller must hold `mtx`.
    ///
    /// Masking preemption across the release closes the window in which a
    /// wakeup could slip in before the caller is blocked.
    pub fn wait(&self, mtx: &Mutex) {
        let sched = self.sched();
        let was = (sched.upcalls().set_preemption)(false);

        trace!("{} waits on condvar {:p}", sched.current(), self);
        mtx.exit();
        sched
            .sleep(&self.waiters)
            .expect("waiting with nothing else runnable");
        mtx.enter();

        (sched.upcalls().set_preemption)(was);
    }

    /// Makes the longest-waiting thread eligible again, if any. Never
    /// switches; the woken thread runs only when later dispatched.
    pub fn signal(&self) {
        let sched = self.sched();
        let woken = sched.wakeup(&self.waiters, false);
        trace!("condvar {:p} signal woke {}", self, woken);
    }

    /// Makes every waiting thread eligible again, preserving blocked order.
    pub fn broadcast(&self) {
        let sched = self.sched();
        let woken = sched.wakeup(&self.waiters, true);
        trace!("condvar {:p} broadcast woke {}", self, woken);
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::ptr;

    use crossbeam_queue::ArrayQueue;

    use super::*;
    use crate::scheduler::Target;
    use crate::threads::ThreadId;

    #[test]
    fn signal_then_broadcast_wakes_in_blocked_order() {
        let _r = env_logger::try_init();
        let s = Scheduler::new();
        let m = Arc::new(Mutex::new(&s));
        let cv = Arc::new(CondVar::new(&s));
        let order: Arc<ArrayQueue<usize>> = Arc::new(ArrayQueue::new(4));

        for _ in 0..3 {
            let s2 = Arc::clone(&s);
            let m2 = Arc::clone(&m);
            let cv2 = Arc::clone(&cv);
            let order2 = Arc::clone(&order);
            s.spawn(
                move |_| {
                    m2.enter();
                    cv2.wait(&m2);
                    let _r = order2.push(s2.current().0);
                    m2.exit();
                },
                ptr::null_mut(),
            )
            .expect("spawn failed");
        }

        // One yield cascades through all three: each acquires the mutex,
        // waits (releasing it), and hands control on.
        assert_eq!(s.yield_to(Target::Any), Ok(ThreadId(1)));
        assert!(cv.has_waiters());
        assert_eq!(s.ready_count(), 1);

        // Wake strictly the first waiter.
        cv.signal();
        assert_eq!(s.ready_count(), 2);
        let _r = s.yield_to(Target::Any);

        // Wake the rest at once.
        cv.broadcast();
        assert!(!cv.has_waiters());
        while s.live_count() > 1 {
            let _r = s.yield_to(Target::Any);
        }

        let mut seen = Vec::new();
        while let Some(tid) = order.pop() {
            seen.push(tid);
        }
        assert_eq!(seen, [1, 2, 3]);
    }

    #[test]
    fn signal_without_waiters_is_a_noop() {
        let _r = env_logger::try_init();
        let s = Scheduler::new();
        let cv = CondVar::new(&s);

        assert!(!cv.has_waiters());
        cv.signal();
        cv.broadcast();
        assert_eq!(s.ready_count(), 1);
        assert_eq!(s.live_count(), 1);
    }
}
