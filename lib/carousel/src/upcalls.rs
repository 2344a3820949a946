//! Upcalls from the runtime to its embedder.
//!
//! The asynchronous preemption source (timer signal, interrupt vector, ...)
//! lives outside this crate; the scheduler only needs a way to mask it while
//! mutating its queues. Embedders wire the real primitives in here; the
//! defaults track the mask in a thread-local and terminate via
//! `std::process::exit`, which is enough for purely voluntary scheduling.

use core::cell::Cell;
use core::fmt;

/// Toggles whether asynchronous preemption may interrupt the caller.
///
/// Returns the previous setting, so nested critical sections compose: each
/// section restores what it observed, not a fixed default.
pub type PreemptionMaskFn = fn(enabled: bool) -> bool;

/// Terminates the surrounding process once the last thread has exited.
pub type ExitProcessFn = fn(code: i32) -> !;

/// Table of embedder-provided primitives consumed by the scheduler.
#[derive(Clone, Copy)]
pub struct Upcalls {
    pub set_preemption: PreemptionMaskFn,
    pub exit_process: ExitProcessFn,
}

impl Default for Upcalls {
    fn default() -> Self {
        Upcalls {
            set_preemption: default_set_preemption,
            exit_process: default_exit_process,
        }
    }
}

impl fmt::Debug for Upcalls {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Upcalls {{}}")
    }
}

thread_local! {
    static PREEMPTION_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Default mask: no interrupt source attached, only the flag is tracked.
fn default_set_preemption(enabled: bool) -> bool {
    PREEMPTION_ENABLED.with(|flag| flag.replace(enabled))
}

fn default_exit_process(code: i32) -> ! {
    std::process::exit(code)
}
