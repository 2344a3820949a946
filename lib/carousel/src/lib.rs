//! A cooperative user-level thread runtime.
//!
//! Many logical threads are multiplexed onto one execution stream by saving
//! and restoring machine state explicitly. The [`Scheduler`] owns all thread
//! control blocks and dispatches them round-robin; the head of its ready
//! queue is always the thread that is currently executing. Threads block on
//! caller-owned [`WaitQueue`]s and become runnable again only through
//! [`Scheduler::wakeup`]. [`Mutex`] and [`CondVar`] are layered on top of the
//! wait-queue primitives.
//!
//! Exactly one thread computes at any instant; every dispatch operation masks
//! asynchronous preemption (see [`Upcalls`]) while it mutates scheduler
//! state.
//!
//! # Example
//!
//! ```
//! use carousel::{Scheduler, Target};
//! use core::ptr;
//!
//! let s = Scheduler::new();
//! let tid = s
//!     .spawn(|arg| assert!(arg.is_null()), ptr::null_mut())
//!     .unwrap();
//!
//! // Hand the execution stream over; the spawned thread runs, retires, and
//! // control comes back here with its id.
//! assert_eq!(s.yield_to(Target::Any), Ok(tid));
//! assert_eq!(s.live_count(), 1);
//! ```

extern crate alloc;

pub mod condvar;
pub mod mutex;
pub mod scheduler;
pub mod stack;
pub mod threads;
pub mod upcalls;
pub mod waitqueue;

mod arch;

pub use crate::condvar::CondVar;
pub use crate::mutex::Mutex;
pub use crate::scheduler::{Scheduler, Target};
pub use crate::threads::ThreadId;
pub use crate::upcalls::Upcalls;
pub use crate::waitqueue::WaitQueue;

use core::fmt;

/// Errors returned by the dispatch operations.
///
/// All of these are local, recoverable conditions reported to the caller.
/// Violations of scheduler invariants are not represented here; those panic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The thread population is already at [`Scheduler::MAX_THREADS`].
    NoMoreThreads,
    /// Stack allocation failed.
    OutOfMemory,
    /// No applicable thread exists (e.g. yielding with a single thread).
    NoTarget,
    /// The named thread does not exist or is not eligible.
    InvalidThread,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NoMoreThreads => write!(f, "thread population is at capacity"),
            Error::OutOfMemory => write!(f, "stack allocation failed"),
            Error::NoTarget => write!(f, "no applicable thread"),
            Error::InvalidThread => write!(f, "no such thread"),
        }
    }
}

impl std::error::Error for Error {}
