//! Fiber stack allocation.
//!
//! Stacks come straight from the VM subsystem, page-aligned, with the
//! lowest page turned into a guard so an overflow traps instead of
//! silently corrupting a neighboring allocation. All platform-specific
//! bookkeeping around stacks (the guard page here; on systems with an
//! in-thread exception chain, those slots too) is isolated in this module
//! so the scheduler itself stays portable.

use std::io;
use std::ptr;

use thiserror::Error;

/// Tuning for newly spawned fibers.
#[derive(Clone, Debug)]
pub struct FiberConfig {
    /// Usable stack size in bytes; rounded up to whole pages. The guard
    /// page comes on top of this.
    pub stack_size: usize,
}

impl Default for FiberConfig {
    fn default() -> FiberConfig {
        FiberConfig {
            // Enough for formatted output with some headroom.
            stack_size: 40 * 1024,
        }
    }
}

/// Errors from the fiber runtime.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum FiberError {
    /// Reserving the stack from the VM failed.
    #[error("cannot allocate a {size} byte fiber stack: {source}")]
    StackAlloc {
        /// The requested size, including the guard page.
        size: usize,
        /// The reported OS error.
        source: io::Error,
    },

    /// Protecting the guard page failed.
    #[error("cannot protect the fiber guard page: {source}")]
    GuardProtect {
        /// The reported OS error.
        source: io::Error,
    },
}

fn page_size() -> usize {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static PAGE: AtomicUsize = AtomicUsize::new(0);

    let cached = PAGE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    PAGE.store(size, Ordering::Relaxed);
    size
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

/// A guarded region of VM serving as one fiber's stack.
///
/// The region is `round_up(stack_size, page) + page` bytes; the lowest page
/// is the guard. The usable range is `limit()..top()` and grows downwards
/// from `top()`.
#[derive(Debug)]
pub struct FiberStack {
    base: *mut u8,
    len: usize,
    guard: usize,
}

impl FiberStack {
    /// Reserves and commits a stack according to `config`.
    pub fn new(config: &FiberConfig) -> Result<FiberStack, FiberError> {
        let page = page_size();
        let len = round_up(config.stack_size.max(page), page) + page;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(FiberError::StackAlloc {
                size: len,
                source: io::Error::last_os_error(),
            });
        }
        let base = base as *mut u8;

        if unsafe { libc::mprotect(base as *mut libc::c_void, page, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(base as *mut libc::c_void, len) };
            return Err(FiberError::GuardProtect { source: err });
        }

        Ok(FiberStack {
            base,
            len,
            guard: page,
        })
    }

    /// The high end of the stack; execution starts here and grows down.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.len) }
    }

    /// The lowest usable address, directly above the guard page.
    pub fn limit(&self) -> *mut u8 {
        unsafe { self.base.add(self.guard) }
    }

    /// The usable size in bytes.
    pub fn usable(&self) -> usize {
        self.len - self.guard
    }

    /// Whether `ptr` lies in the usable region of this stack.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        (self.limit() as usize..self.top() as usize).contains(&addr)
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// Platform bookkeeping carried across a context switch.
///
/// Some platforms keep per-thread exception-handling state (an exception
/// chain anchor plus stack base/limit slots in the thread information
/// block) that must follow the active stack or unwinding breaks. The
/// scheduler calls [`save`](SwitchState::save) before a switch and
/// [`restore`](SwitchState::restore) after; the definitions below are for
/// targets where all of that lives in callee-saved registers already, so
/// there is nothing to do.
#[derive(Default)]
pub struct SwitchState;

impl SwitchState {
    /// Captures the platform per-thread state before leaving this context.
    pub fn save() -> SwitchState {
        SwitchState
    }

    /// Reinstates the platform per-thread state after arriving back.
    pub fn restore(self) {}
}
