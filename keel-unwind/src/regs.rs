//! Register numbers in the DWARF world.
//!
//! Not the same as the numbers used in instruction encodings, sadly.

/// DWARF register numbers for x86-64.
#[cfg(target_arch = "x86_64")]
pub mod dw {
    /// `%rax`.
    pub const RAX: i32 = 0;
    /// `%rdx`.
    pub const RDX: i32 = 1;
    /// `%rcx`.
    pub const RCX: i32 = 2;
    /// `%rbx`.
    pub const RBX: i32 = 3;
    /// `%rsi`.
    pub const RSI: i32 = 4;
    /// `%rdi`.
    pub const RDI: i32 = 5;
    /// `%rbp`.
    pub const RBP: i32 = 6;
    /// `%rsp`.
    pub const RSP: i32 = 7;
    /// The virtual return-address column.
    pub const RA: i32 = 16;

    /// The frame-base register the generated code maintains.
    pub const FRAME_BASE: i32 = RBP;
    /// First return-value register.
    pub const RETURN0: i32 = RAX;
    /// Second return-value register for two-word returns.
    pub const RETURN1: i32 = RDX;
}

/// DWARF register numbers for AArch64 (general registers map directly).
#[cfg(target_arch = "aarch64")]
pub mod dw {
    /// `x0`.
    pub const X0: i32 = 0;
    /// `x1`.
    pub const X1: i32 = 1;
    /// `x29`, the frame pointer.
    pub const X29: i32 = 29;
    /// `x30`, the link register.
    pub const X30: i32 = 30;

    /// The frame-base register the generated code maintains.
    pub const FRAME_BASE: i32 = X29;
    /// First return-value register.
    pub const RETURN0: i32 = X0;
    /// Second return-value register for two-word returns.
    pub const RETURN1: i32 = X1;
}
