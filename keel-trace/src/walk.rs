//! Frame-pointer stack walking.
//!
//! The calling conventions in use keep a frame-base register pointing at a
//! two-word record: the caller's frame base and the return address, with
//! the callee's stack-passed arguments directly above. Walking is then a
//! matter of chasing the frame-base links while they stay inside the
//! current stack region: the fiber's stack when called on a fiber, the
//! OS-provided stack otherwise.
//!
//! A platform-assisted walk through the unwind tables would serve builds
//! that omit frame pointers; the frame-pointer walk is the one variant
//! implemented here, and the cheap one, which matters because traces are
//! taken at throw time.

use std::mem;

use crate::{CapturedFrame, StackTrace, MAX_PARAMS};

const WORD: usize = mem::size_of::<usize>();

#[cfg(target_arch = "x86_64")]
fn frame_base() -> usize {
    let fp: usize;
    unsafe { std::arch::asm!("mov {}, rbp", out(reg) fp) };
    fp
}

#[cfg(target_arch = "aarch64")]
fn frame_base() -> usize {
    let fp: usize;
    unsafe { std::arch::asm!("mov {}, x29", out(reg) fp) };
    fp
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn frame_base() -> usize {
    0
}

/// The usable `(low, high)` range of the current stack.
fn stack_bounds() -> Option<(usize, usize)> {
    if let Some(bounds) = keel_fiber::current_stack_bounds() {
        return Some(bounds);
    }
    os_thread_bounds()
}

#[cfg(target_os = "linux")]
fn os_thread_bounds() -> Option<(usize, usize)> {
    unsafe {
        let mut attr: libc::pthread_attr_t = mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut base = std::ptr::null_mut();
        let mut size = 0usize;
        let rc = libc::pthread_attr_getstack(&mut attr, &mut base, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 {
            return None;
        }
        Some((base as usize, base as usize + size))
    }
}

#[cfg(not(target_os = "linux"))]
fn os_thread_bounds() -> Option<(usize, usize)> {
    None
}

/// Captures a stack trace from the calling point, skipping the first
/// `skip` frames (0 keeps the caller of `capture` on top).
///
/// Builds without frame-pointer chains produce short or empty traces;
/// every read stays inside the current stack region either way.
pub fn capture(skip: usize) -> StackTrace {
    let Some((low, high)) = stack_bounds() else {
        return StackTrace::new();
    };

    // A frame record must fit below the top: link, return address and the
    // captured argument slots.
    let fits = |base: usize| {
        base >= low && base % WORD == 0 && base + (2 + MAX_PARAMS) * WORD <= high
    };

    let mut trace = StackTrace::new();
    let mut base = frame_base();
    let mut skipped = 0;

    while fits(base) {
        let link = unsafe { *(base as *const usize) };
        let code = unsafe { *((base + WORD) as *const usize) };
        if code == 0 {
            break;
        }

        if skipped < skip {
            skipped += 1;
        } else {
            let mut params = [0usize; MAX_PARAMS];
            for (at, slot) in params.iter_mut().enumerate() {
                *slot = unsafe { *((base + (2 + at) * WORD) as *const usize) };
            }
            trace.push(CapturedFrame {
                code: code as *const u8,
                params,
            });
        }

        // Frames grow strictly downwards; anything else is not a chain.
        if link <= base {
            break;
        }
        base = link;
    }

    tracing::trace!(frames = trace.count(), "captured a stack trace");
    trace
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn nested(depth: usize) -> StackTrace {
        if depth == 0 {
            capture(0)
        } else {
            let trace = nested(depth - 1);
            // Keep the frame alive past the recursive call so it is not
            // tail-call optimized away.
            std::hint::black_box(trace)
        }
    }

    #[test]
    fn capture_never_leaves_the_stack() {
        // The walk is bounds-checked, so this must not crash whatever the
        // build did to frame pointers.
        let trace = capture(0);
        let _ = trace.count();
    }

    #[test]
    fn deeper_stacks_give_longer_traces() {
        let shallow = nested(0);
        if shallow.is_empty() {
            // No frame-pointer chain in this build; nothing to compare.
            return;
        }
        let deep = nested(10);
        assert_eq!(deep.count(), shallow.count() + 10);
    }

    #[test]
    fn skip_drops_leading_frames() {
        let full = capture(0);
        if full.count() < 3 {
            return;
        }
        let trimmed = capture(2);
        assert_eq!(trimmed.count(), full.count() - 2);
    }
}
