//! Machine-specific context switching.
//!
//! One routine per target ABI, written in assembly: `keel_fiber_switch`
//! saves the callee-saved register set on the current stack, publishes the
//! stack pointer, adopts the target's stack pointer and restores the same
//! set from there. Both the leaving and the arriving control path exit
//! through the single `ret` at the end of the routine; on the arriving
//! side, execution resumes right after the `ret` of whichever switch put
//! that fiber to sleep.
//!
//! A brand-new fiber has never executed a switch, so `init_frame` fabricates
//! the save area a switch would have produced, with the return slot aimed
//! at a small entry shim that moves the environment pointer into the
//! argument register and tail-calls `keel_fiber_main`.

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod x86_64_unix;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use x86_64_unix::init_frame;

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
mod aarch64_unix;
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
pub use aarch64_unix::init_frame;

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
compile_error!("no context-switch implementation for this target");

extern "C" {
    /// Switches stacks: stores the current stack pointer through `old_sp`,
    /// installs `new_sp` and returns on the new stack.
    ///
    /// May not return until something switches back here.
    pub fn keel_fiber_switch(new_sp: *mut usize, old_sp: *mut *mut usize);
}
