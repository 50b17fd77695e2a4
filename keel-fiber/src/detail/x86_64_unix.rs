//! Context switching for x86-64 System V.
//!
//! Register-save contract: `keel_fiber_switch` preserves the SysV
//! callee-saved set (`rbx`, `rbp`, `r12`-`r15`) by pushing it on the
//! outgoing stack; everything else is caller-saved and dead across the
//! call. There is no in-thread exception chain to maintain on this target
//! (unwinding is table-driven), so the register set is the whole story.
//!
//! The suspended-stack layout, ascending from the saved stack pointer:
//!
//! ```text
//! sp + 0x00  r15
//! sp + 0x08  r14
//! sp + 0x10  r13
//! sp + 0x18  r12
//! sp + 0x20  rbx
//! sp + 0x28  rbp
//! sp + 0x30  return address
//! ```

use std::arch::global_asm;

global_asm!(
    r#"
.globl keel_fiber_switch
keel_fiber_switch:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15

    mov [rsi], rsp
    mov rsp, rdi

    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret

// First entry into a new fiber. The fabricated frame left the environment
// pointer on the stack right above our return slot; move it into the
// argument register, realign and enter the trampoline proper.
.globl keel_fiber_entry
keel_fiber_entry:
    pop rdi
    and rsp, -16
    call keel_fiber_main
    ud2
"#
);

extern "C" {
    fn keel_fiber_entry();
}

/// Fabricates the initial save area on a fresh stack.
///
/// Returns the stack pointer to store in the fiber; the first switch to it
/// "returns" into `keel_fiber_entry` with `env` on the stack.
///
/// # Safety
///
/// `top` must be the high end of a writable stack with room for the frame.
pub unsafe fn init_frame(top: *mut u8, env: *mut u8) -> *mut usize {
    let mut sp = (top as usize & !15) as *mut usize;
    let mut push = |value: usize| {
        sp = sp.sub(1);
        sp.write(value);
    };

    push(0); // keeps the entry shim's alignment arithmetic simple
    push(env as usize);
    push(keel_fiber_entry as usize); // return slot of the first switch
    for _ in 0..6 {
        push(0); // rbp, rbx, r12..r15
    }
    sp
}
