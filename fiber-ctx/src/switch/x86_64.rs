// System V AMD64 ABI.
//
// A saved execution looks like this, from the stack pointer upwards:
//
//     +0   MXCSR (4 bytes), x87 control word (2 bytes), padding
//     +8   r15
//     +16  r14
//     +24  r13
//     +32  r12
//     +40  rbx
//     +48  rbp
//     +56  return address
//
// The stack pointer of a saved execution is 16-byte aligned.

use {super::{Entry, StackPointer}, std::arch::naked_asm};

pub const INITIAL_FRAME_SIZE: usize = 80;

/// Default MXCSR in the low half, default x87 control word above it.
const INITIAL_FP_CONTROL: usize = 0x1F80 | (0x037F << 32);

pub unsafe fn write_initial_frame(sp: *mut usize, entry: Entry)
{
    sp.write(INITIAL_FP_CONTROL);
    sp.add(5).write(entry as *const () as usize);      // rbx
    sp.add(7).write(trampoline as *const () as usize); // return address
    // The remaining 16 bytes keep the entry call 16-byte aligned.
}

#[unsafe(naked)]
pub unsafe extern "C" fn switch(
    _save_to: *mut Option<StackPointer>,
    _to:      StackPointer,
    _arg:     usize,
) -> usize
{
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "sub rsp, 8",
        "stmxcsr dword ptr [rsp]",
        "fnstcw word ptr [rsp + 4]",

        "mov qword ptr [rdi], rsp",
        "mov rsp, rsi",

        "ldmxcsr dword ptr [rsp]",
        "fldcw word ptr [rsp + 4]",
        "add rsp, 8",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "mov rax, rdx",
        "ret",
    )
}

/// First code to run on a prepared stack.
///
/// The switch left the entry function in rbx and the argument in rax.
#[unsafe(naked)]
unsafe extern "C" fn trampoline() -> !
{
    naked_asm!(
        "mov rdi, rax",
        "call rbx",
        "ud2",
    )
}
