//! Attach/detach bookkeeping for the forward tables.
//!
//! The first library to attach adopts the shared table for the whole
//! process; every later attach must present an identical one, which traps
//! the case of two hosts (or two revisions of one host) meeting in a
//! single address space. Unique tables are kept per engine id in a lazily
//! grown array, and the whole registry is reference-counted so the unique
//! array can be dropped when the last library detaches.

use std::ffi::c_void;
use std::mem;

use parking_lot::Mutex;
use thiserror::Error;

use keel_common::fatal;

use crate::fwd::{EngineFwdShared, EngineFwdUnique, EngineHandle};

/// Errors from the attach path.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum AttachError {
    /// The host's shared table has a different size than this library's.
    #[error("shared forward table is {got} bytes, this library expects {expected}")]
    SharedSizeMismatch {
        /// Size this library was built against.
        expected: usize,
        /// Size the host presented.
        got: usize,
    },

    /// The host's unique table has a different size than this library's.
    #[error("unique forward table is {got} bytes, this library expects {expected}")]
    UniqueSizeMismatch {
        /// Size this library was built against.
        expected: usize,
        /// Size the host presented.
        got: usize,
    },

    /// A second host presented a different shared table.
    #[error("two different runtime implementations attached to one shared library")]
    SharedTableConflict,
}

struct Registry {
    shared: Option<EngineFwdShared>,
    /// Unique tables indexed by engine id.
    unique: Vec<Option<EngineFwdUnique>>,
    attached: usize,
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    shared: None,
    unique: Vec::new(),
    attached: 0,
});

/// Adopts (or verifies) the shared table and stores `unique` under
/// `engine_id`.
pub fn attach(
    engine_id: usize,
    shared: &EngineFwdShared,
    unique: &EngineFwdUnique,
) -> Result<(), AttachError> {
    if shared.struct_size != mem::size_of::<EngineFwdShared>() {
        return Err(AttachError::SharedSizeMismatch {
            expected: mem::size_of::<EngineFwdShared>(),
            got: shared.struct_size,
        });
    }
    if unique.struct_size != mem::size_of::<EngineFwdUnique>() {
        return Err(AttachError::UniqueSizeMismatch {
            expected: mem::size_of::<EngineFwdUnique>(),
            got: unique.struct_size,
        });
    }

    let mut registry = REGISTRY.lock();
    match &registry.shared {
        None => registry.shared = Some(*shared),
        Some(adopted) if adopted == shared => {}
        Some(_) => return Err(AttachError::SharedTableConflict),
    }

    if registry.unique.len() <= engine_id {
        registry.unique.resize(engine_id + 1, None);
    }
    registry.unique[engine_id] = Some(*unique);
    registry.attached += 1;

    tracing::debug!(engine_id, attached = registry.attached, "engine attached");
    Ok(())
}

/// Drops one attach reference; the unique array is freed with the last
/// one.
pub fn detach() {
    let mut registry = REGISTRY.lock();
    registry.attached = registry.attached.saturating_sub(1);
    if registry.attached == 0 {
        registry.unique = Vec::new();
    }
}

/// The adopted shared table. Calling before any attach is a usage error
/// and fatal.
pub fn shared() -> EngineFwdShared {
    match REGISTRY.lock().shared {
        Some(shared) => shared,
        None => fatal!("the runtime forward table is used before any engine attached"),
    }
}

/// The unique table of `engine_id`, if that engine is attached.
pub fn unique(engine_id: usize) -> Option<EngineFwdUnique> {
    REGISTRY.lock().unique.get(engine_id).copied().flatten()
}

/// Number of currently attached libraries.
pub fn attached() -> usize {
    REGISTRY.lock().attached
}

/// Convenience forwarders over the adopted shared table.
pub mod runtime {
    use super::shared;
    use crate::fwd::EngineHandle;

    /// The length of the code allocation at `code`.
    pub fn code_size(code: *const u8) -> usize {
        unsafe { (shared().code_size)(code) }
    }

    /// Whether `ptr` points into collector-managed code memory.
    pub fn is_code(ptr: *const u8) -> bool {
        unsafe { (shared().is_code)(ptr) }
    }

    /// Allocates a code block through the host.
    ///
    /// # Safety
    ///
    /// `engine` must be a live engine handle from the host.
    pub unsafe fn alloc_code(engine: *mut EngineHandle, code: usize, refs: usize) -> *mut u8 {
        (shared().alloc_code)(engine, code, refs)
    }

    /// Registers the calling OS thread with the engine's collector.
    ///
    /// # Safety
    ///
    /// `engine` must be a live engine handle from the host.
    pub unsafe fn attach_thread(engine: *mut EngineHandle) {
        (shared().attach_thread)(engine)
    }

    /// Unregisters the calling OS thread.
    ///
    /// # Safety
    ///
    /// `engine` must be a live engine handle from the host.
    pub unsafe fn detach_thread(engine: *mut EngineHandle) {
        (shared().detach_thread)(engine)
    }
}

/// Parameters a host passes into a library's entry point.
#[repr(C)]
pub struct LibStart {
    /// Size of this structure as the host built it.
    pub start_size: usize,
    /// Size of [`LibInfo`] as the host built it.
    pub info_size: usize,
    /// The engine loading the library.
    pub engine: *mut EngineHandle,
    /// The engine's process-wide id.
    pub engine_id: usize,
    /// The host's shared entry points.
    pub shared: *const EngineFwdShared,
    /// The host's per-engine entry points.
    pub unique: *const EngineFwdUnique,
}

/// What a library reports back from its entry point.
#[repr(C)]
pub struct LibInfo {
    /// Library-private data the host hands back on shutdown.
    pub lib_data: *mut c_void,
    /// Called when the host unloads the library.
    pub shutdown: Option<unsafe extern "C" fn(*mut LibInfo)>,
}

/// The library-side entry point body: size checks, then attach.
///
/// A shared library exports a C symbol that forwards here; `false` means
/// the versions do not line up and the host must not use the library.
///
/// # Safety
///
/// `params` and `info` must point at live, correctly sized structures.
pub unsafe fn lib_entry(params: *const LibStart, info: *mut LibInfo) -> bool {
    let params = &*params;
    if params.start_size != mem::size_of::<LibStart>()
        || params.info_size != mem::size_of::<LibInfo>()
    {
        tracing::error!(
            "library/runtime version skew: entry structures have unexpected sizes"
        );
        return false;
    }

    match attach(params.engine_id, &*params.shared, &*params.unique) {
        Ok(()) => {
            (*info).lib_data = std::ptr::null_mut();
            (*info).shutdown = Some(lib_shutdown);
            true
        }
        Err(err) => {
            tracing::error!("cannot attach engine: {err}");
            false
        }
    }
}

unsafe extern "C" fn lib_shutdown(_info: *mut LibInfo) {
    detach();
}
