//! The core logic of the scheduler.
//!
//! Has the following properties:
//! * Cooperative scheduling (threads switch voluntarily; an external timer
//!   may drive [`Scheduler::yield_to`] for preemption)
//! * Round-robin dispatch over a single ready queue
//! * The head of the ready queue is the thread that is currently executing
//! * Wait-queue based blocking and waking
//! * Deferred reclamation of exited threads through the destroy queue

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use core::ptr;

use hashbrown::HashMap;
use log::trace;
use spin::MutexGuard;

use crate::arch::{self, Context};
use crate::stack::{ThreadStack, DEFAULT_STACK_SIZE_BYTES};
use crate::threads::{Thread, ThreadId, ThreadState};
use crate::upcalls::Upcalls;
use crate::waitqueue::WaitQueue;
use crate::Error;

/// Selects the thread a dispatch operation applies to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Target {
    /// Any other eligible thread.
    Any,
    /// The calling thread itself.
    Current,
    /// The thread with this id.
    Tid(ThreadId),
}

/// Scheduler state shared by all dispatch operations.
///
/// Mutated only while preemption is masked; no lock is ever held across a
/// context switch.
struct SchedState {
    /// `true` for every id held by a live (non-exited) thread.
    tids: [bool; Scheduler::MAX_THREADS],

    /// Arena of live thread control blocks, addressed by id.
    threads: HashMap<ThreadId, Thread>,

    /// Runnable ids in dispatch order. The head is the running thread.
    ready: VecDeque<ThreadId>,

    /// Exited control blocks pending reclamation, newest first. Their stacks
    /// stay allocated until [`Scheduler::reap_exited`] or drop.
    destroy: VecDeque<Thread>,
}

impl SchedState {
    /// Id of the running thread, by invariant the ready-queue head.
    fn running(&self) -> ThreadId {
        *self.ready.front().expect("ready queue has no running thread")
    }

    fn set_state(&mut self, tid: ThreadId, state: ThreadState) {
        self.threads
            .get_mut(&tid)
            .expect("state change for unknown thread")
            .state = state;
    }

    /// Claims the lowest free id. The caller has already checked capacity.
    fn allocate_tid(&mut self) -> ThreadId {
        let id = self
            .tids
            .iter()
            .position(|used| !used)
            .expect("tid table exhausted below capacity");
        self.tids[id] = true;
        ThreadId(id)
    }

    /// Retires the ready thread at `pos`: marks it exited, transfers its
    /// control block to the destroy queue and frees its id.
    fn retire_at(&mut self, pos: usize) -> ThreadId {
        let tid = self.ready.remove(pos).expect("retire position out of range");
        let mut tcb = self
            .threads
            .remove(&tid)
            .expect("retiring thread missing from arena");
        tcb.state = ThreadState::Exited;
        self.tids[tid.0] = false;
        self.destroy.push_front(tcb);
        tid
    }

    /// Makes a blocked thread eligible again at the tail of the ready queue.
    fn make_ready(&mut self, tid: ThreadId) {
        self.set_state(tid, ThreadState::Ready);
        self.ready.push_back(tid);
    }
}

/// A cooperative scheduler multiplexing up to [`Scheduler::MAX_THREADS`]
/// threads onto the execution stream it was created on.
///
/// Construction is the `init` step: the calling thread becomes thread 0,
/// RUNNING, and the sole member of the ready queue. Clients hold the
/// scheduler in an [`Arc`] so that spawned thread bodies can reach it; at
/// least one strong reference must live outside the spawned threads' own
/// stacks (thread 0's frame qualifies), since dropping the scheduler frees
/// those stacks.
///
/// All operations must be called from a thread managed by this scheduler
/// (thread 0 included).
pub struct Scheduler {
    state: spin::Mutex<SchedState>,
    upcalls: Upcalls,

    /// Handed to spawned threads so the entry trampoline can reach back.
    self_ref: Weak<Scheduler>,
}

// TCBs contain raw stack and payload pointers, but every access happens on
// the single execution stream the scheduler multiplexes, with preemption
// masked around state mutation.
unsafe impl Send for Scheduler {}
unsafe impl Sync for Scheduler {}

impl Scheduler {
    /// Fixed maximum population of concurrent (non-exited) threads.
    pub const MAX_THREADS: usize = 1024;

    pub fn new() -> Arc<Scheduler> {
        Scheduler::with_upcalls(Default::default())
    }

    /// A scheduler wired to embedder-provided preemption/termination
    /// primitives.
    pub fn with_upcalls(upcalls: Upcalls) -> Arc<Scheduler> {
        let boot = ThreadId(0);
        let mut tids = [false; Scheduler::MAX_THREADS];
        tids[boot.0] = true;

        let mut threads = HashMap::with_capacity(Scheduler::MAX_THREADS);
        threads.insert(boot, Thread::bootstrap(boot));

        let mut ready = VecDeque::with_capacity(Scheduler::MAX_THREADS);
        ready.push_back(boot);

        Arc::new_cyclic(|self_ref| Scheduler {
            state: spin::Mutex::new(SchedState {
                tids,
                threads,
                ready,
                destroy: VecDeque::new(),
            }),
            upcalls,
            self_ref: self_ref.clone(),
        })
    }

    pub fn upcalls(&self) -> Upcalls {
        self.upcalls
    }

    /// Runs `f` with preemption masked, restoring the previous mask on the
    /// way out. The restore also covers the post-resume path of operations
    /// that context-switch inside `f`.
    fn masked<T>(&self, f: impl FnOnce() -> T) -> T {
        let was = (self.upcalls.set_preemption)(false);
        let r = f();
        (self.upcalls.set_preemption)(was);
        r
    }

    /// Creates a thread running `f(arg)` on a default-sized stack.
    ///
    /// The new thread is appended to the ready-queue tail and does not run
    /// until the scheduler later makes it the head. Returns the new id.
    pub fn spawn<F>(&self, f: F, arg: *mut u8) -> Result<ThreadId, Error>
    where
        F: 'static + FnOnce(*mut u8) + Send,
    {
        self.spawn_with_stack(DEFAULT_STACK_SIZE_BYTES, f, arg)
    }

    /// Like [`Scheduler::spawn`] with an explicit stack size (rounded up to
    /// the minimum).
    pub fn spawn_with_stack<F>(
        &self,
        stack_size: usize,
        f: F,
        arg: *mut u8,
    ) -> Result<ThreadId, Error>
    where
        F: 'static + FnOnce(*mut u8) + Send,
    {
        self.masked(|| {
            let mut state = self.state.lock();

            if state.threads.len() >= Scheduler::MAX_THREADS {
                return Err(Error::NoMoreThreads);
            }
            let stack = ThreadStack::from_size(stack_size).ok_or(Error::OutOfMemory)?;

            let tid = state.allocate_tid();
            let thread = unsafe { Thread::new(tid, stack, self.self_ref.clone(), f, arg) };
            trace!(
                "spawned {} with a {} byte stack",
                tid,
                thread.stack.as_ref().map_or(0, |s| s.size())
            );
            state.threads.insert(tid, thread);
            state.ready.push_back(tid);
            Ok(tid)
        })
    }

    /// Voluntarily hands the execution stream to another thread.
    ///
    /// On the switching paths the returned id is the thread that became
    /// RUNNING at the moment the caller suspended, delivered when the caller
    /// is eventually resumed.
    pub fn yield_to(&self, target: Target) -> Result<ThreadId, Error> {
        self.masked(|| self.yield_inner(target))
    }

    fn yield_inner(&self, target: Target) -> Result<ThreadId, Error> {
        let mut state = self.state.lock();
        match target {
            Target::Current => Ok(state.running()),
            Target::Any => {
                if state.ready.len() < 2 {
                    return Err(Error::NoTarget);
                }
                let prev = state.ready.pop_front().expect("ready queue empty");
                state.set_state(prev, ThreadState::Ready);
                state.ready.push_back(prev);

                let next = state.running();
                state.set_state(next, ThreadState::Running);
                trace!("yield {} -> {}", prev, next);
                Ok(self.suspend_and_switch_to(state, prev, next))
            }
            Target::Tid(tid) => {
                if state.ready.is_empty() {
                    return Err(Error::NoTarget);
                }
                let prev = state.running();
                if tid == prev {
                    return Ok(prev);
                }

                match state.ready.iter().position(|&t| t == tid) {
                    Some(pos) => {
                        state.ready.remove(pos);
                        state.ready.push_front(tid);
                        state.set_state(prev, ThreadState::Ready);
                        state.set_state(tid, ThreadState::Running);
                        trace!("yield {} -> {} (targeted)", prev, tid);
                        Ok(self.suspend_and_switch_to(state, prev, tid))
                    }
                    None => Err(Error::InvalidThread),
                }
            }
        }
    }

    /// Retires a thread for good.
    ///
    /// Targeting the calling thread (or its own id) never returns on
    /// success: control transfers to the next ready thread and the caller's
    /// stack is parked in the destroy queue. Targeting another ready thread
    /// retires it without a context switch and returns its id.
    pub fn exit(&self, target: Target) -> Result<ThreadId, Error> {
        self.masked(|| self.exit_inner(target))
    }

    fn exit_inner(&self, target: Target) -> Result<ThreadId, Error> {
        let mut state = self.state.lock();
        let running = state.running();
        match target {
            Target::Current => self.exit_running(state),
            Target::Tid(tid) if tid == running => self.exit_running(state),
            Target::Any => {
                if state.ready.len() < 2 {
                    return Err(Error::NoTarget);
                }
                let tid = state.retire_at(1);
                trace!("retired {} ({} pending reclaim)", tid, state.destroy.len());
                Ok(tid)
            }
            Target::Tid(tid) => match state.ready.iter().position(|&t| t == tid) {
                // Position 0 is the running thread, handled above.
                Some(pos) => {
                    state.retire_at(pos);
                    trace!("retired {} ({} pending reclaim)", tid, state.destroy.len());
                    Ok(tid)
                }
                None => Err(Error::InvalidThread),
            },
        }
    }

    /// The self-exit path: park the running thread's control block in the
    /// destroy queue and resume the next head, never to come back.
    fn exit_running(&self, mut state: MutexGuard<'_, SchedState>) -> Result<ThreadId, Error> {
        if state.ready.len() < 2 {
            // Exiting the last thread would leave nothing runnable.
            return Err(Error::NoTarget);
        }

        let prev = state.ready.pop_front().expect("ready queue empty");
        let mut tcb = state
            .threads
            .remove(&prev)
            .expect("running thread missing from arena");
        tcb.state = ThreadState::Exited;
        state.tids[prev.0] = false;
        // The stack we are executing on moves into the destroy queue, which
        // keeps it allocated until reclamation.
        state.destroy.push_front(tcb);

        let next = state.running();
        state.set_state(next, ThreadState::Running);
        let next_ctx: *const Context = {
            let t = state.threads.get(&next).expect("resuming unknown thread");
            &t.ctx
        };
        trace!("exit {} -> {}", prev, next);

        drop(state);
        unsafe { arch::jump_context(next_ctx) }
    }

    /// Blocks the calling thread on `queue` until a wakeup makes it eligible
    /// again. Returns, once resumed, the id of the thread that became
    /// RUNNING at the moment the caller blocked.
    pub fn sleep(&self, queue: &WaitQueue) -> Result<ThreadId, Error> {
        self.masked(|| {
            let mut state = self.state.lock();
            if state.ready.len() < 2 {
                // Blocking would leave nothing runnable.
                return Err(Error::NoTarget);
            }

            let prev = state.ready.pop_front().expect("ready queue empty");
            state.set_state(prev, ThreadState::Blocked);
            queue.push(prev);

            let next = state.running();
            state.set_state(next, ThreadState::Running);
            trace!("sleep {} -> {}", prev, next);
            Ok(self.suspend_and_switch_to(state, prev, next))
        })
    }

    /// Makes the head of `queue` (or, with `all`, every member in blocked
    /// order) eligible at the ready-queue tail. Never switches; woken
    /// threads run only when later dispatched. Returns 1 if any thread
    /// moved, else 0.
    pub fn wakeup(&self, queue: &WaitQueue, all: bool) -> usize {
        self.masked(|| {
            let mut state = self.state.lock();
            let mut moved = 0;
            while let Some(tid) = queue.pop() {
                state.make_ready(tid);
                moved += 1;
                trace!("woke {}", tid);
                if !all {
                    break;
                }
            }
            usize::from(moved > 0)
        })
    }

    /// Suspend checkpoint: captures the caller's context and transfers
    /// control to `next`. The call completes a second time, with `next` as
    /// its value, when some later dispatch restores the suspended context.
    fn suspend_and_switch_to(
        &self,
        mut state: MutexGuard<'_, SchedState>,
        prev: ThreadId,
        next: ThreadId,
    ) -> ThreadId {
        let prev_ctx: *mut Context = {
            let t = state
                .threads
                .get_mut(&prev)
                .expect("suspending unknown thread");
            &mut t.ctx
        };
        let next_ctx: *const Context = {
            let t = state.threads.get(&next).expect("resuming unknown thread");
            &t.ctx
        };

        // Queues are consistent; release the lock before leaving this stack.
        // Nothing can run in between while preemption is masked.
        drop(state);
        unsafe { arch::switch_context(prev_ctx, next_ctx) };
        next
    }

    /// Id of the calling (running) thread.
    pub fn current(&self) -> ThreadId {
        self.masked(|| self.state.lock().running())
    }

    /// Number of live (ready, running or blocked) threads.
    pub fn live_count(&self) -> usize {
        self.masked(|| self.state.lock().threads.len())
    }

    /// Number of runnable threads, the running one included.
    pub fn ready_count(&self) -> usize {
        self.masked(|| self.state.lock().ready.len())
    }

    /// Number of exited threads whose stacks have not been reclaimed yet.
    pub fn exited_count(&self) -> usize {
        self.masked(|| self.state.lock().destroy.len())
    }

    /// Frees every control block in the destroy queue and returns how many
    /// were reclaimed.
    ///
    /// Reclamation is deliberately explicit: exited stacks are otherwise
    /// retained until the scheduler is dropped. Calling this from any live
    /// thread is safe, since an exited thread's context can never be resumed
    /// and the self-exit path leaves its dying stack before any other thread
    /// can run.
    pub fn reap_exited(&self) -> usize {
        self.masked(|| {
            let mut state = self.state.lock();
            let n = state.destroy.len();
            state.destroy.clear();
            n
        })
    }

    /// Called by the entry trampoline on first activation: the bootstrap
    /// payload has been consumed, so the control block must no longer own it.
    pub(crate) fn mark_booted(&self) {
        self.masked(|| {
            let mut state = self.state.lock();
            let tid = state.running();
            state
                .threads
                .get_mut(&tid)
                .expect("booting thread missing from arena")
                .boot = ptr::null_mut();
        })
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let state = self.state.lock();
        let running: alloc::vec::Vec<ThreadId> = state
            .threads
            .values()
            .filter(|t| t.state == ThreadState::Running)
            .map(|t| t.id)
            .collect();
        assert_eq!(running.len(), 1, "exactly one RUNNING thread");
        assert_eq!(running[0], *state.ready.front().expect("empty ready queue"));

        for (pos, tid) in state.ready.iter().enumerate() {
            let t = state.threads.get(tid).expect("ready id missing from arena");
            let want = if pos == 0 {
                ThreadState::Running
            } else {
                ThreadState::Ready
            };
            assert_eq!(t.state, want, "ready-queue member {} state", tid);
        }
        for t in state.destroy.iter() {
            assert_eq!(t.state, ThreadState::Exited);
            assert!(!state.tids[t.id.0], "exited id still marked used");
        }
        for (tid, _) in state.threads.iter() {
            assert!(state.tids[tid.0], "live id not marked used");
        }
    }
}
