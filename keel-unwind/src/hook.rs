//! The platform FDE-lookup hook.
//!
//! When the unwinder processes a frame it calls `_Unwind_Find_FDE` to find
//! the unwind data covering a program counter. The system implementation
//! only knows about statically registered `.eh_frame` sections, so this
//! crate exports its own version of the symbol, shadowing the one in
//! libgcc: it delegates to the previous implementation first (resolved via
//! `dlsym(RTLD_NEXT)`) and falls back to the process [`DwarfTable`] for
//! JIT code.
//!
//! The hook is necessarily process-global (there is exactly one
//! `_Unwind_Find_FDE`), which is why the table behind it is a singleton as
//! well, shared across every dynamically loaded module.

use std::ffi::c_void;

use once_cell::sync::Lazy;

use keel_common::fatal;

use crate::raw::Fde;
use crate::table::DwarfTable;

/// The reply structure filled by `_Unwind_Find_FDE`.
#[repr(C)]
pub struct DwarfEhBases {
    /// Text base; unused for our absolute-pointer records.
    pub tbase: *mut c_void,
    /// Data base; unused for our absolute-pointer records.
    pub dbase: *mut c_void,
    /// Start of the function covering the queried pc.
    pub func: *mut c_void,
}

type FindFdeFn = unsafe extern "C" fn(*mut c_void, *mut DwarfEhBases) -> *mut Fde;

/// The implementation this library shadows, resolved once. Failing to find
/// it means the platform does not use DWARF unwinding at all, and no
/// generated exception can ever be handled; better to die loudly up front.
static PREV_FIND_FDE: Lazy<FindFdeFn> = Lazy::new(|| unsafe {
    let sym = libc::dlsym(libc::RTLD_NEXT, c"_Unwind_Find_FDE".as_ptr());
    if sym.is_null() {
        fatal!("no system _Unwind_Find_FDE found; DWARF2 unwind information is required");
    }
    std::mem::transmute::<*mut c_void, FindFdeFn>(sym)
});

/// Finds the FDE covering `pc`, consulting the system tables first and the
/// JIT table second.
///
/// # Safety
///
/// Called by the platform unwinder; `bases`, when non-null, must point at a
/// writable reply structure.
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn _Unwind_Find_FDE(pc: *mut c_void, bases: *mut DwarfEhBases) -> *mut Fde {
    let found = (*PREV_FIND_FDE)(pc, bases);
    if !found.is_null() {
        return found;
    }

    match DwarfTable::global().find(pc as *const u8) {
        Some(fde) => {
            if !bases.is_null() {
                (*bases).tbase = std::ptr::null_mut();
                (*bases).dbase = std::ptr::null_mut();
                (*bases).func = fde.as_ref().code_start() as *mut c_void;
            }
            fde.as_ptr()
        }
        None => std::ptr::null_mut(),
    }
}
