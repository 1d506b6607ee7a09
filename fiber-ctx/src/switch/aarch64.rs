// AAPCS64.
//
// A saved execution looks like this, from the stack pointer upwards:
//
//     +0x00  x19, x20
//     +0x10  x21, x22
//     +0x20  x23, x24
//     +0x30  x25, x26
//     +0x40  x27, x28
//     +0x50  x29 (frame pointer), x30 (return address)
//     +0x60  d8 .. d15
//
// The stack pointer of a saved execution is 16-byte aligned.

use {super::{Entry, StackPointer}, std::arch::naked_asm};

pub const INITIAL_FRAME_SIZE: usize = 0xA0;

pub unsafe fn write_initial_frame(sp: *mut usize, entry: Entry)
{
    sp.write(entry as *const () as usize);              // x19
    sp.add(11).write(trampoline as *const () as usize); // x30
}

#[unsafe(naked)]
pub unsafe extern "C" fn switch(
    _save_to: *mut Option<StackPointer>,
    _to:      StackPointer,
    _arg:     usize,
) -> usize
{
    naked_asm!(
        "sub sp, sp, #0xA0",
        "stp x19, x20, [sp, #0x00]",
        "stp x21, x22, [sp, #0x10]",
        "stp x23, x24, [sp, #0x20]",
        "stp x25, x26, [sp, #0x30]",
        "stp x27, x28, [sp, #0x40]",
        "stp x29, x30, [sp, #0x50]",
        "stp d8,  d9,  [sp, #0x60]",
        "stp d10, d11, [sp, #0x70]",
        "stp d12, d13, [sp, #0x80]",
        "stp d14, d15, [sp, #0x90]",

        "mov x9, sp",
        "str x9, [x0]",
        "mov sp, x1",

        "ldp x19, x20, [sp, #0x00]",
        "ldp x21, x22, [sp, #0x10]",
        "ldp x23, x24, [sp, #0x20]",
        "ldp x25, x26, [sp, #0x30]",
        "ldp x27, x28, [sp, #0x40]",
        "ldp x29, x30, [sp, #0x50]",
        "ldp d8,  d9,  [sp, #0x60]",
        "ldp d10, d11, [sp, #0x70]",
        "ldp d12, d13, [sp, #0x80]",
        "ldp d14, d15, [sp, #0x90]",
        "add sp, sp, #0xA0",
        "mov x0, x2",
        "ret",
    )
}

/// First code to run on a prepared stack.
///
/// The switch left the entry function in x19 and the argument in x0.
#[unsafe(naked)]
unsafe extern "C" fn trampoline() -> !
{
    naked_asm!(
        "blr x19",
        "brk #1",
    )
}
