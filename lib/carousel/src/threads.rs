//! Thread control blocks and the entry trampoline.

use alloc::boxed::Box;
use alloc::sync::Weak;
use core::fmt;
use core::ptr;

use log::trace;

use crate::arch::{self, Context};
use crate::scheduler::{Scheduler, Target};
use crate::stack::ThreadStack;
use crate::Error;

/// The id of a thread.
///
/// Unique among all non-exited threads of one scheduler; ids are drawn from
/// `[0, Scheduler::MAX_THREADS)` and become reusable the instant their thread
/// exits. Id 0 belongs to the thread of control that was alive at
/// initialization.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct ThreadId(pub usize);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ThreadId({})", self.0)
    }
}

/// Lifecycle state of a thread control block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ThreadState {
    Ready,
    Running,
    Blocked,
    Exited,
}

/// Per-thread state: identity, lifecycle, saved context, owned stack.
///
/// Owned by the scheduler arena while the thread is live and moved into the
/// destroy queue, exactly once, when it exits.
pub(crate) struct Thread {
    pub(crate) id: ThreadId,
    pub(crate) state: ThreadState,
    pub(crate) ctx: Context,

    /// `None` for the bootstrap thread, which runs on the host stack.
    pub(crate) stack: Option<ThreadStack>,

    /// The bootstrap payload, owned here until the thread runs for the first
    /// time and consumes it. Freed on drop for threads that never started.
    pub(crate) boot: *mut BootPayload,
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Thread#{} ({:?})", self.id.0, self.state)
    }
}

impl Thread {
    /// The control block for the thread of control already executing when the
    /// scheduler is initialized. Its context is filled in the first time it
    /// switches away.
    pub(crate) fn bootstrap(id: ThreadId) -> Thread {
        Thread {
            id,
            state: ThreadState::Running,
            ctx: Context::default(),
            stack: None,
            boot: ptr::null_mut(),
        }
    }

    /// Allocates a control block whose saved context enters the trampoline on
    /// first restore.
    ///
    /// # Safety
    /// `stack` must be freshly allocated and not referenced by any other
    /// context.
    pub(crate) unsafe fn new<F>(
        id: ThreadId,
        stack: ThreadStack,
        sched: Weak<Scheduler>,
        f: F,
        arg: *mut u8,
    ) -> Thread
    where
        F: 'static + FnOnce(*mut u8) + Send,
    {
        let payload = Box::into_raw(Box::new(BootPayload {
            sched,
            body: Box::new(f),
            arg,
        }));

        let mut ctx = Context::default();
        arch::prepare_context(&mut ctx, stack.top(), thread_boot, payload as *mut u8);

        Thread {
            id,
            state: ThreadState::Ready,
            ctx,
            stack: Some(stack),
            boot: payload,
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // Still owning a payload means the thread never ran; reclaim it.
        if !self.boot.is_null() {
            drop(unsafe { Box::from_raw(self.boot) });
        }
    }
}

/// Everything a freshly created thread needs for its first activation.
pub(crate) struct BootPayload {
    pub(crate) sched: Weak<Scheduler>,
    pub(crate) body: Box<dyn FnOnce(*mut u8) + Send + 'static>,
    pub(crate) arg: *mut u8,
}

/// First Rust frame of every spawned thread.
///
/// Arrives with preemption still masked by whichever dispatch operation
/// switched here. Re-enables preemption, runs the body, restores the mask,
/// and retires the thread; when the runtime reports that no other thread is
/// left, the whole process is done.
///
/// A panic in the body aborts at this boundary; there is no frame to unwind
/// into on a scheduler-owned stack.
extern "C" fn thread_boot(raw: *mut u8) -> ! {
    let payload = unsafe { Box::from_raw(raw as *mut BootPayload) };
    let BootPayload { sched, body, arg } = *payload;

    let upcalls = {
        let sched = sched
            .upgrade()
            .expect("scheduler dropped under a running thread");
        sched.mark_booted();
        sched.upcalls()
    };

    let was = (upcalls.set_preemption)(true);
    body(arg);
    (upcalls.set_preemption)(was);

    // A running thread pins its scheduler; the strong reference below is
    // intentionally never released on the success path, since self-exit
    // abandons this frame wholesale.
    let sched = sched
        .upgrade()
        .expect("scheduler dropped under a running thread");
    trace!("{} body returned, retiring", sched.current());
    match sched.exit(Target::Current) {
        // The last thread has no successor to hand control to; the process
        // is finished.
        Err(Error::NoTarget) => (upcalls.exit_process)(0),
        Ok(_) => unreachable!("self-exit returned to its caller"),
        Err(e) => panic!("self-exit failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_display() {
        assert_eq!(alloc::format!("{}", ThreadId(3)), "ThreadId(3)");
    }
}
