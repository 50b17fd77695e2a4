//! Calling arbitrary function pointers with run-time argument lists.
//!
//! The code generator, the reflection layer and thunks all need to call a
//! function whose signature is only known at run time. [`FnCall`] collects
//! parameter descriptors (size, value pointer, copy and destroy functions)
//! and [`FnCall::invoke`] marshals them into a word-aligned argument block,
//! transfers control and places the result by size class.
//!
//! The destroy functions are the load-bearing part: every parameter that
//! was copied is destroyed exactly once, whether the call returns, the
//! callee unwinds, or a later parameter's copy function fails. Cleanup
//! runs in reverse construction order.
//!
//! # Examples
//!
//! ```
//! use keel_call::FnCall;
//!
//! let a = 20u64;
//! let b = 22u64;
//! let mut call = FnCall::new();
//! call.param_scalar(&a).param_scalar(&b);
//! assert_eq!(call.params_size(), 16);
//! ```

#![warn(missing_docs)]

use std::mem;

use thiserror::Error;

use keel_common::ValType;

mod raw;

pub use crate::raw::RetClass;
#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
pub use crate::raw::keel_call_raw;

const WORD: usize = mem::size_of::<usize>();

fn round_word(size: usize) -> usize {
    (size + WORD - 1) / WORD * WORD
}

/// Errors from the call marshaller.
#[non_exhaustive]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallError {
    /// The caller's result buffer cannot hold the declared return value.
    #[error("result buffer holds {len} bytes but the return value needs {needed}")]
    ResultTooSmall {
        /// Bytes required for this return class.
        needed: usize,
        /// Bytes supplied.
        len: usize,
    },
}

/// Something that can be entered with a marshalled argument block.
///
/// The production implementation is [`JitFn`]; host-side implementations
/// exist so marshalling (in particular the destroy guarantees) can be
/// exercised without generated code.
pub trait Callee {
    /// Transfers control, handing over `words` words starting at `args`.
    ///
    /// On return the result has been placed into `out` per `class`.
    ///
    /// # Safety
    ///
    /// `args` must hold `words` initialized words; `out` must satisfy the
    /// size demanded by `class`.
    unsafe fn call(&self, args: *const u8, words: usize, class: RetClass, out: *mut u8);
}

/// A function pointer using the runtime's uniform calling convention.
#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
#[derive(Clone, Copy, Debug)]
pub struct JitFn(pub *const u8);

#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
impl Callee for JitFn {
    unsafe fn call(&self, args: *const u8, words: usize, class: RetClass, out: *mut u8) {
        keel_call_raw(self.0, args, words, out, class as u64);
    }
}

/// One parameter of a pending call.
struct Param {
    size: usize,
    value: *const u8,
    copy: unsafe fn(*const u8, *mut u8),
    destroy: Option<unsafe fn(*mut u8)>,
}

/// A call being assembled: a sequence of parameter descriptors.
///
/// The lifetime ties the descriptor to the argument values it points at;
/// the call must happen while they are all still alive.
pub struct FnCall<'a> {
    params: Vec<Param>,
    _values: std::marker::PhantomData<&'a ()>,
}

unsafe fn copy_bits<T>(src: *const u8, dst: *mut u8) {
    dst.cast::<T>().write_unaligned(src.cast::<T>().read_unaligned());
}

unsafe fn copy_clone<T: Clone>(src: *const u8, dst: *mut u8) {
    let value = (*src.cast::<T>()).clone();
    dst.cast::<T>().write_unaligned(value);
}

unsafe fn drop_slot<T>(slot: *mut u8) {
    std::ptr::drop_in_place(slot.cast::<T>());
}

impl<'a> FnCall<'a> {
    /// Creates an empty call.
    pub fn new() -> FnCall<'a> {
        FnCall {
            params: Vec::new(),
            _values: std::marker::PhantomData,
        }
    }

    /// Appends a raw parameter descriptor.
    ///
    /// `copy` writes the argument into the frame slot; `destroy`, if any,
    /// tears the copied slot down again.
    ///
    /// # Safety
    ///
    /// `value` must stay valid until the call, and `copy`/`destroy` must
    /// agree with it on the value's actual type and `size`.
    pub unsafe fn param_raw(
        &mut self,
        size: usize,
        value: *const u8,
        copy: unsafe fn(*const u8, *mut u8),
        destroy: Option<unsafe fn(*mut u8)>,
    ) -> &mut Self {
        self.params.push(Param {
            size,
            value,
            copy,
            destroy,
        });
        self
    }

    /// Appends a plain-bits parameter; copied bitwise, nothing to destroy.
    pub fn param_scalar<T: Copy>(&mut self, value: &'a T) -> &mut Self {
        unsafe {
            self.param_raw(
                mem::size_of::<T>(),
                value as *const T as *const u8,
                copy_bits::<T>,
                None,
            )
        }
    }

    /// Appends a parameter with value semantics: cloned into the frame,
    /// dropped when the call ends.
    pub fn param<T: Clone>(&mut self, value: &'a T) -> &mut Self {
        unsafe {
            self.param_raw(
                mem::size_of::<T>(),
                value as *const T as *const u8,
                copy_clone::<T>,
                Some(drop_slot::<T>),
            )
        }
    }

    /// The number of parameters added so far.
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// The size of the argument block: every parameter rounded up to a
    /// whole word.
    pub fn params_size(&self) -> usize {
        self.params.iter().map(|p| round_word(p.size)).sum()
    }

    /// Marshals the arguments and enters `callee`.
    ///
    /// The return value is placed into `out` according to its size class:
    /// one word and floats need 8 bytes, two words need 16, larger values
    /// need their word-rounded size (the callee writes them through a
    /// pointer). `ret.is_float` routes the result through the float return
    /// register on ABIs that separate them.
    ///
    /// Every successfully copied parameter is destroyed exactly once, in
    /// reverse order, no matter how the call ends.
    ///
    /// # Safety
    ///
    /// The callee must follow the uniform calling convention and match the
    /// declared parameter list and return type.
    pub unsafe fn invoke(
        &self,
        callee: &dyn Callee,
        ret: ValType,
        out: &mut [u8],
    ) -> Result<(), CallError> {
        let (class, needed) = classify(ret);
        if out.len() < needed {
            return Err(CallError::ResultTooSmall {
                needed,
                len: out.len(),
            });
        }

        let size = self.params_size();
        let words = size / WORD;
        tracing::trace!(params = self.params.len(), words, ?class, "marshalling a call");

        // The staging block is word-aligned; the raw transfer moves it
        // onto the callee frame in one go.
        let mut block: Vec<usize> = vec![0; words];
        let base = block.as_mut_ptr() as *mut u8;

        // From here on, every copied slot must be destroyed exactly once,
        // also when a copy function or the callee unwinds.
        let mut guard = DestroyGuard {
            params: &self.params,
            base,
            copied: 0,
        };

        let mut offset = 0;
        for param in &self.params {
            (param.copy)(param.value, base.add(offset));
            guard.copied += 1;
            offset += round_word(param.size);
        }

        callee.call(base, words, class, out.as_mut_ptr());
        Ok(())
    }
}

impl Default for FnCall<'_> {
    fn default() -> Self {
        FnCall::new()
    }
}

fn classify(ret: ValType) -> (RetClass, usize) {
    let bytes = ret.size.current() as usize;
    if bytes == 0 {
        (RetClass::Void, 0)
    } else if ret.is_float {
        (RetClass::Float, WORD)
    } else if bytes <= WORD {
        (RetClass::Scalar, WORD)
    } else if bytes <= 2 * WORD {
        (RetClass::Pair, 2 * WORD)
    } else {
        (RetClass::Indirect, round_word(bytes))
    }
}

/// Destroys the copied prefix of the argument block, in reverse order.
struct DestroyGuard<'a> {
    params: &'a [Param],
    base: *mut u8,
    copied: usize,
}

impl Drop for DestroyGuard<'_> {
    fn drop(&mut self) {
        let mut offsets = Vec::with_capacity(self.copied);
        let mut offset = 0;
        for param in &self.params[..self.copied] {
            offsets.push(offset);
            offset += round_word(param.size);
        }
        for (param, offset) in self.params[..self.copied].iter().zip(offsets).rev() {
            if let Some(destroy) = param.destroy {
                unsafe { destroy(self.base.add(offset)) };
            }
        }
    }
}
