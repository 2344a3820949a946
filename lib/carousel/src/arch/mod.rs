//! The raw execution-context primitive: capture the calling thread's machine
//! state and transfer control to another saved state.

#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "x86_64")]
pub(crate) use x86_64::{jump_context, prepare_context, switch_context, Context};

#[cfg(not(target_arch = "x86_64"))]
compile_error!("carousel only supports x86_64 targets");
