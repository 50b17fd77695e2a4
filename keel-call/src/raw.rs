//! The raw control transfer.
//!
//! Generated functions use one uniform convention: every argument lives in
//! the stack block, word-aligned, in declaration order; results come back
//! in the platform return registers or through a caller-supplied buffer for
//! anything larger than two words. `keel_call_raw` is the only piece that
//! knows the machine details: it carves the argument block out of the real
//! stack, copies the prepared words into it, makes the call and stores the
//! result according to the size class.

/// How a return value travels back to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum RetClass {
    /// No value.
    Void = 0,
    /// At most one machine word, in the first return register.
    Scalar = 1,
    /// Two machine words, in the return register pair.
    Pair = 2,
    /// A floating-point value, in the first float return register.
    Float = 3,
    /// Larger than two words: the callee writes through a pointer to the
    /// caller's buffer, passed per the platform ABI for indirect results.
    Indirect = 4,
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
std::arch::global_asm!(
    r#"
// keel_call_raw(fn: rdi, args: rsi, words: rdx, out: rcx, class: r8)
//
// Carves `words * 8` bytes (rounded to keep 16-byte alignment) off the
// stack, copies the argument block into it and calls `fn`. The result is
// stored to `out` according to `class` (see RetClass).
.globl keel_call_raw
keel_call_raw:
    push rbp
    mov rbp, rsp
    push rbx
    push r12
    push r13
    push r14

    mov rbx, rdi
    mov r12, rcx
    mov r13, r8

    mov rax, rdx
    shl rax, 3
    add rax, 15
    and rax, -16
    sub rsp, rax

    mov rcx, rdx
    mov rdi, rsp
    rep movsq

    cmp r13, 4
    jne 1f
    mov rdi, r12
1:
    call rbx

    cmp r13, 1
    jne 2f
    mov [r12], rax
    jmp 9f
2:
    cmp r13, 2
    jne 3f
    mov [r12], rax
    mov [r12 + 8], rdx
    jmp 9f
3:
    cmp r13, 3
    jne 9f
    movq [r12], xmm0
9:
    lea rsp, [rbp - 32]
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret
"#
);

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
std::arch::global_asm!(
    r#"
// keel_call_raw(fn: x0, args: x1, words: x2, out: x3, class: x4)
//
// Same contract as on x86-64; indirect results travel in x8 as the AAPCS
// prescribes.
.globl keel_call_raw
keel_call_raw:
    stp x29, x30, [sp, #-16]!
    mov x29, sp
    stp x19, x20, [sp, #-16]!
    stp x21, x22, [sp, #-16]!

    mov x19, x0
    mov x20, x3
    mov x21, x4

    lsl x9, x2, #3
    add x9, x9, #15
    and x9, x9, #-16
    sub sp, sp, x9

    mov x10, sp
    cbz x2, 2f
1:
    ldr x11, [x1], #8
    str x11, [x10], #8
    subs x2, x2, #1
    b.ne 1b
2:
    cmp x21, #4
    b.ne 3f
    mov x8, x20
3:
    blr x19

    cmp x21, #1
    b.ne 4f
    str x0, [x20]
    b 9f
4:
    cmp x21, #2
    b.ne 5f
    stp x0, x1, [x20]
    b 9f
5:
    cmp x21, #3
    b.ne 9f
    str d0, [x20]
9:
    sub sp, x29, #32
    ldp x21, x22, [sp], #16
    ldp x19, x20, [sp], #16
    ldp x29, x30, [sp], #16
    ret
"#
);

#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
extern "C" {
    /// Transfers control to `callee` with `words` argument words copied
    /// onto its frame; stores the result to `out` per `class`.
    pub fn keel_call_raw(
        callee: *const u8,
        args: *const u8,
        words: usize,
        out: *mut u8,
        class: u64,
    );
}
