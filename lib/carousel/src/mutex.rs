//! Blocking mutual exclusion on top of the wait-queue primitives.

use alloc::sync::{Arc, Weak};
use core::cell::Cell;

use log::trace;

use crate::scheduler::Scheduler;
use crate::threads::ThreadId;
use crate::waitqueue::WaitQueue;

/// A non-recursive blocking mutex.
///
/// Contended acquisitions block the calling thread on an internal wait
/// queue; release makes the first waiter eligible again. There is no hand-off
/// of ownership: a woken waiter competes for the mutex when it next runs.
#[derive(Debug)]
pub struct Mutex {
    sched: Weak<Scheduler>,
    held: Cell<bool>,
    owner: Cell<Option<ThreadId>>,
    waiters: WaitQueue,
}

// Shared between threads of one scheduler, which all run on the same
// execution stream with preemption masked around every state change.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    pub fn new(sched: &Arc<Scheduler>) -> Mutex {
        Mutex {
            sched: Arc::downgrade(sched),
            held: Cell::new(false),
            owner: Cell::new(None),
            waiters: WaitQueue::new(),
        }
    }

    fn sched(&self) -> Arc<Scheduler> {
        self.sched
            .upgrade()
            .expect("scheduler dropped under a live mutex")
    }

    /// Acquires the mutex, blocking while another thread holds it.
    pub fn enter(&self) {
        let sched = self.sched();
        let was = (sched.upcalls().set_preemption)(false);

        let tid = sched.current();
        assert!(
            self.owner.get() != Some(tid),
            "locking mutex against itself"
        );

        loop {
            if !self.held.get() {
                self.held.set(true);
                self.owner.set(Some(tid));
                break;
            }
            trace!("{} contends for mutex {:p}", tid, self);
            sched
                .sleep(&self.waiters)
                .expect("mutex is held but nothing else is runnable");
        }

        (sched.upcalls().set_preemption)(was);
    }

    /// Acquires the mutex only if it is free right now.
    pub fn try_enter(&self) -> bool {
        let sched = self.sched();
        let was = (sched.upcalls().set_preemption)(false);

        let acquired = if self.held.get() {
            false
        } else {
            self.held.set(true);
            self.owner.set(Some(sched.current()));
            true
        };

        (sched.upcalls().set_preemption)(was);
        acquired
    }

    /// Releases the mutex and makes the first waiter, if any, eligible.
    pub fn exit(&self) {
        let sched = self.sched();
        let was = (sched.upcalls().set_preemption)(false);

        assert_eq!(
            self.owner.get(),
            Some(sched.current()),
            "mutex released by a thread that does not hold it"
        );
        self.owner.set(None);
        self.held.set(false);
        sched.wakeup(&self.waiters, false);

        (sched.upcalls().set_preemption)(was);
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.owner.get()
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use core::ptr;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::scheduler::Target;

    #[test]
    fn uncontended_enter_exit() {
        let _r = env_logger::try_init();
        let s = Scheduler::new();
        let m = Mutex::new(&s);

        assert_eq!(m.owner(), None);
        m.enter();
        assert_eq!(m.owner(), Some(ThreadId(0)));
        m.exit();
        assert_eq!(m.owner(), None);
    }

    #[test]
    fn try_enter_fails_while_held() {
        let _r = env_logger::try_init();
        let s = Scheduler::new();
        let m = Arc::new(Mutex::new(&s));
        let observed = Arc::new(AtomicBool::new(true));

        m.enter();

        let m2 = Arc::clone(&m);
        let observed2 = Arc::clone(&observed);
        s.spawn(
            move |_| {
                observed2.store(m2.try_enter(), Ordering::Relaxed);
            },
            ptr::null_mut(),
        )
        .expect("spawn failed");

        let _r = s.yield_to(Target::Any);
        assert!(!observed.load(Ordering::Relaxed), "held mutex was acquired");

        m.exit();
        assert!(m.try_enter());
        m.exit();
    }

    #[test]
    fn mutual_exclusion_with_yields() {
        let _r = env_logger::try_init();
        let s = Scheduler::new();
        let m = Arc::new(Mutex::new(&s));
        let in_critical = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicUsize::new(0));
        let count = Arc::new(AtomicUsize::new(0));

        let rounds = 10;
        for _ in 0..2 {
            let s2 = Arc::clone(&s);
            let m2 = Arc::clone(&m);
            let in_critical2 = Arc::clone(&in_critical);
            let violations2 = Arc::clone(&violations);
            let count2 = Arc::clone(&count);
            s.spawn(
                move |_| {
                    for _ in 0..rounds {
                        m2.enter();
                        if in_critical2.swap(true, Ordering::Relaxed) {
                            violations2.fetch_add(1, Ordering::Relaxed);
                        }
                        // Hand the stream away while inside the section.
                        let _r = s2.yield_to(Target::Any);
                        in_critical2.store(false, Ordering::Relaxed);
                        m2.exit();
                        count2.fetch_add(1, Ordering::Relaxed);
                    }
                },
                ptr::null_mut(),
            )
            .expect("spawn failed");
        }

        while s.live_count() > 1 {
            let _r = s.yield_to(Target::Any);
        }

        assert_eq!(violations.load(Ordering::Relaxed), 0);
        assert_eq!(count.load(Ordering::Relaxed), 2 * rounds);
    }

    #[test]
    #[should_panic(expected = "against itself")]
    fn relocking_own_mutex_panics() {
        let s = Scheduler::new();
        let m = Mutex::new(&s);
        m.enter();
        m.enter();
    }
}
