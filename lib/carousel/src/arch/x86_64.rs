//! x86_64 System V context switching.

use core::arch::naked_asm;
use core::mem;

/// Saved execution state of a suspended thread.
///
/// Only the System V callee-saved registers need to survive a switch; the
/// compiler has already spilled everything else around the call site.
#[repr(C)]
#[derive(Clone, Debug, Default)]
pub(crate) struct Context {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// Saves the current execution state into `prev` and resumes `next`.
///
/// The call completes a second time, in the frame of the suspended caller,
/// when some later dispatch restores `prev`.
///
/// # Safety
/// `prev` must be valid for writes and `next` must hold a context that was
/// either captured by an earlier `switch_context` or seeded by
/// [`prepare_context`]. No lock may be held across the call.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch_context(_prev: *mut Context, _next: *const Context) {
    naked_asm!(
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "ret",
    )
}

/// Resumes `next` without capturing the current state.
///
/// Used by the self-exit path: the calling thread's stack is being retired,
/// so there is no context worth saving and no way back.
///
/// # Safety
/// Same requirements on `next` as [`switch_context`]. The caller's stack must
/// stay allocated until control has left it, which the destroy queue
/// guarantees.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn jump_context(_next: *const Context) -> ! {
    naked_asm!(
        "mov rsp, [rdi + 0x00]",
        "mov rbp, [rdi + 0x08]",
        "mov rbx, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov r13, [rdi + 0x20]",
        "mov r14, [rdi + 0x28]",
        "mov r15, [rdi + 0x30]",
        "ret",
    )
}

/// First instructions of every spawned thread.
///
/// [`prepare_context`] seeds r12 with the bootstrap payload and r13 with the
/// entry trampoline. On arrival rsp is 8 (mod 16) as after a `call`; the
/// `sub` re-establishes the alignment the trampoline expects.
#[unsafe(naked)]
extern "C" fn thread_start() -> ! {
    naked_asm!(
        "xor ebp, ebp",
        "mov rdi, r12",
        "sub rsp, 8",
        "call r13",
        "ud2",
    )
}

/// Seeds `ctx` so that the first restore enters `entry` through
/// [`thread_start`] with `payload` as its argument.
///
/// # Safety
/// `stack_top` must be the top of a stack region exclusively owned by the
/// thread `ctx` belongs to, with room for at least one frame below it.
pub(crate) unsafe fn prepare_context(
    ctx: &mut Context,
    stack_top: *mut u8,
    entry: extern "C" fn(*mut u8) -> !,
    payload: *mut u8,
) {
    // Leave one 16-byte slot so the `ret` in the restore path pops the shim
    // address off a 16-aligned rsp.
    let top = (stack_top as usize) & !0xf;
    let sp = top - 2 * mem::size_of::<usize>();
    (sp as *mut usize).write(thread_start as usize);

    ctx.rsp = sp as u64;
    ctx.rbp = 0;
    ctx.r12 = payload as u64;
    ctx.r13 = entry as usize as u64;
}
