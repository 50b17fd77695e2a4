//! Context switching for AArch64 (AAPCS64).
//!
//! Register-save contract: `keel_fiber_switch` preserves `x19`-`x28`, the
//! frame pointer `x29`, the link register `x30` and the callee-saved low
//! halves `d8`-`d15`, all pushed on the outgoing stack. The stack pointer
//! stays 16-byte aligned throughout, as the ABI demands.
//!
//! The suspended-stack layout, ascending from the saved stack pointer:
//!
//! ```text
//! sp + 0x00  d8  d9
//! sp + 0x10  d10 d11
//! sp + 0x20  d12 d13
//! sp + 0x30  d14 d15
//! sp + 0x40  x19 x20
//! sp + 0x50  x21 x22
//! sp + 0x60  x23 x24
//! sp + 0x70  x25 x26
//! sp + 0x80  x27 x28
//! sp + 0x90  x29 x30
//! ```

use std::arch::global_asm;

global_asm!(
    r#"
.globl keel_fiber_switch
keel_fiber_switch:
    stp x29, x30, [sp, #-16]!
    stp x27, x28, [sp, #-16]!
    stp x25, x26, [sp, #-16]!
    stp x23, x24, [sp, #-16]!
    stp x21, x22, [sp, #-16]!
    stp x19, x20, [sp, #-16]!
    stp d14, d15, [sp, #-16]!
    stp d12, d13, [sp, #-16]!
    stp d10, d11, [sp, #-16]!
    stp d8, d9, [sp, #-16]!

    mov x9, sp
    str x9, [x1]
    mov sp, x0

    ldp d8, d9, [sp], #16
    ldp d10, d11, [sp], #16
    ldp d12, d13, [sp], #16
    ldp d14, d15, [sp], #16
    ldp x19, x20, [sp], #16
    ldp x21, x22, [sp], #16
    ldp x23, x24, [sp], #16
    ldp x25, x26, [sp], #16
    ldp x27, x28, [sp], #16
    ldp x29, x30, [sp], #16
    ret

// First entry into a new fiber: the fabricated frame restored the
// environment pointer into x19 and pointed x30 here.
.globl keel_fiber_entry
keel_fiber_entry:
    mov x0, x19
    bl keel_fiber_main
    brk #1
"#
);

extern "C" {
    fn keel_fiber_entry();
}

/// Fabricates the initial save area on a fresh stack.
///
/// The environment pointer travels in the `x19` slot and the link-register
/// slot aims at `keel_fiber_entry`, so the first switch "returns" straight
/// into the shim.
///
/// # Safety
///
/// `top` must be the high end of a writable stack with room for the frame.
pub unsafe fn init_frame(top: *mut u8, env: *mut u8) -> *mut usize {
    const SAVE_WORDS: usize = 20;

    let top = (top as usize & !15) as *mut usize;
    let sp = top.sub(SAVE_WORDS);
    for at in 0..SAVE_WORDS {
        sp.add(at).write(0);
    }
    sp.add(8).write(env as usize); // x19
    sp.add(19).write(keel_fiber_entry as usize); // x30
    sp
}
