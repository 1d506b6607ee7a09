//! Control transfer between stacks.
//!
//! This is the only module that touches registers and stack pointers.
//! It provides two operations:
//!
//!  1. [`prepare`] writes an initial frame onto a fresh stack,
//!     such that switching to it calls an entry function on that stack.
//!  2. [`switch`] saves the running execution onto its own stack,
//!     and resumes an execution that was saved or prepared earlier.
//!
//! A saved execution is represented by the stack pointer at which its
//! callee-saved registers and its return address were pushed.
//! Resuming it pops them again and returns from the [`switch`] call
//! that saved it, or calls the entry function if it was prepared.
//!
//! Neither operation knows about fibers, tasks or panics.
//! Unwinding must never cross a switch; entry functions never return.

use std::{mem::size_of, ptr::{self, NonNull}};

#[cfg(all(unix, target_arch = "x86_64"))]
#[path = "x86_64.rs"]
mod arch;

#[cfg(all(unix, target_arch = "aarch64"))]
#[path = "aarch64.rs"]
mod arch;

#[cfg(not(all(unix, any(target_arch = "x86_64", target_arch = "aarch64"))))]
compile_error!("fiber-ctx supports x86_64 and aarch64 on Unix only");

/// Function called on a fresh stack by the first switch to it.
///
/// It receives the `arg` passed to that switch.
pub type Entry = extern "C" fn(arg: usize) -> !;

/// Stack pointer of a saved execution.
#[derive(Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct StackPointer(NonNull<u8>);

/// Number of bytes [`prepare`] writes below the top of the stack.
pub const INITIAL_FRAME_SIZE: usize = arch::INITIAL_FRAME_SIZE;

/// Alignment the stack pointer has at every saved execution.
pub const STACK_ALIGN: usize = 16;

/// Prepare a fresh stack for its first switch.
///
/// The returned stack pointer lies [`INITIAL_FRAME_SIZE`] bytes
/// below `top`, after rounding `top` down to [`STACK_ALIGN`].
///
/// # Safety
///
/// The memory from the returned stack pointer up to `top` must be writable
/// and must not be in use.
pub unsafe fn prepare(top: NonNull<u8>, entry: Entry) -> StackPointer
{
    let top = top.as_ptr() as usize & !(STACK_ALIGN - 1);
    let sp = (top - INITIAL_FRAME_SIZE) as *mut usize;

    // Zero registers make debuggers and unwinders stop at the frame.
    ptr::write_bytes(sp, 0, INITIAL_FRAME_SIZE / size_of::<usize>());
    arch::write_initial_frame(sp, entry);

    StackPointer(NonNull::new_unchecked(sp.cast()))
}

/// Switch to another execution.
///
/// The running execution is saved on its own stack
/// and its stack pointer is written to `*save_to`.
/// Then `to` is resumed, and on its side, `arg` is returned
/// (or passed to the entry function if `to` was prepared).
///
/// This function returns once some other execution switches back
/// to the stack pointer stored in `*save_to`,
/// returning the `arg` of that switch.
///
/// # Safety
///
/// `save_to` must be valid for writes.
/// `to` must have been produced by [`prepare`] or stored by a switch,
/// must not have been resumed since, and its stack must still be live.
#[inline(always)]
pub unsafe fn switch(
    save_to: *mut Option<StackPointer>,
    to:      StackPointer,
    arg:     usize,
) -> usize
{
    arch::switch(save_to, to, arg)
}
