//! The forward-table structures.
//!
//! A dynamically loaded module cannot link against the host runtime's
//! internals; it receives a table of C-ABI function pointers at attach
//! time instead and calls the host through them. The table is split in
//! two: [`EngineFwdShared`] carries entries whose implementation is the
//! same whichever engine instantiated the library, and [`EngineFwdUnique`]
//! carries entries that resolve identifiers inside one engine's namespace
//! and therefore differ per engine instance.
//!
//! Both structures start with their own size. The host fills it in and the
//! attach path verifies it, which catches a library built against a
//! different table revision before a stray pointer does.

use keel_common::{CodeHost, RelocationWatch};

/// Opaque handle of a host engine instance.
#[repr(C)]
pub struct EngineHandle {
    _opaque: [u8; 0],
}

/// Opaque handle of a host type object.
#[repr(C)]
pub struct TypeHandle {
    _opaque: [u8; 0],
}

/// Opaque handle of a host relocation watch.
#[repr(C)]
pub struct RawWatch {
    _opaque: [u8; 0],
}

/// Engine-independent host entry points.
#[repr(C)]
#[derive(Clone, Copy, PartialEq)]
pub struct EngineFwdShared {
    /// `size_of::<EngineFwdShared>()` as the host built it.
    pub struct_size: usize,

    /// Allocates an executable code block of `code` bytes with room for
    /// `refs` relocation fixups in the trailer.
    pub alloc_code: unsafe extern "C" fn(*mut EngineHandle, usize, usize) -> *mut u8,
    /// The length of the code allocation at the given base address.
    pub code_size: unsafe extern "C" fn(*const u8) -> usize,
    /// Whether the pointer lies in collector-managed code memory.
    pub is_code: unsafe extern "C" fn(*const u8) -> bool,

    /// Creates a relocation watch.
    pub create_watch: unsafe extern "C" fn(*mut EngineHandle) -> *mut RawWatch,
    /// Adds an address to a watch.
    pub watch_add: unsafe extern "C" fn(*mut RawWatch, *const u8),
    /// Removes an address from a watch.
    pub watch_remove: unsafe extern "C" fn(*mut RawWatch, *const u8),
    /// Clears a watch.
    pub watch_clear: unsafe extern "C" fn(*mut RawWatch),
    /// Whether anything watched may have moved since the last clear.
    pub watch_moved: unsafe extern "C" fn(*mut RawWatch) -> bool,
    /// Destroys a watch.
    pub destroy_watch: unsafe extern "C" fn(*mut RawWatch),

    /// Registers the calling OS thread with the engine's collector.
    pub attach_thread: unsafe extern "C" fn(*mut EngineHandle),
    /// Unregisters the calling OS thread.
    pub detach_thread: unsafe extern "C" fn(*mut EngineHandle),
    /// Re-registers a thread after a fork or a moved engine.
    pub reattach_thread: unsafe extern "C" fn(*mut EngineHandle),

    /// Yields the calling fiber; see `keel_fiber::yield_now`.
    pub fiber_yield: unsafe extern "C" fn(),
    /// Whether a fiber is ready on this thread.
    pub fiber_any_ready: unsafe extern "C" fn() -> bool,
    /// The id of the running fiber on this thread.
    pub fiber_current: unsafe extern "C" fn() -> u64,
}

/// Per-engine host entry points.
///
/// Identifiers here are namespaced by the engine that loaded the library,
/// so every engine instance supplies its own copy.
#[repr(C)]
#[derive(Clone, Copy, PartialEq)]
pub struct EngineFwdUnique {
    /// `size_of::<EngineFwdUnique>()` as the host built it.
    pub struct_size: usize,

    /// Resolves a library-local type id to the engine's type object.
    pub type_by_id: unsafe extern "C" fn(*mut EngineHandle, u32) -> *mut TypeHandle,
    /// Resolves a library-local template id instantiated with the given
    /// parameter ids.
    pub template_by_id:
        unsafe extern "C" fn(*mut EngineHandle, u32, *const u32, usize) -> *mut TypeHandle,
    /// Resolves a library-local thread declaration to the engine thread id.
    pub thread_by_id: unsafe extern "C" fn(*mut EngineHandle, u32) -> u64,
}

/// Ready-made fiber entries for hosts assembling an [`EngineFwdShared`]:
/// thin C-ABI wrappers over this process's scheduler.
pub mod fiber_entries {
    /// See [`keel_fiber::yield_now`].
    pub unsafe extern "C" fn fiber_yield() {
        keel_fiber::yield_now();
    }

    /// See [`keel_fiber::any_ready`].
    pub unsafe extern "C" fn fiber_any_ready() -> bool {
        keel_fiber::any_ready()
    }

    /// See [`keel_fiber::current_id`].
    pub unsafe extern "C" fn fiber_current() -> u64 {
        keel_fiber::current_id()
    }
}

/// A [`CodeHost`] implemented on top of the forward table, used on the
/// library side of the boundary where the collector itself is out of
/// reach.
pub struct ForwardHost {
    shared: EngineFwdShared,
    engine: *mut EngineHandle,
}

// The handle is a process-global engine; the table entries are required to
// be callable from any attached thread.
unsafe impl Send for ForwardHost {}
unsafe impl Sync for ForwardHost {}

impl ForwardHost {
    /// Wraps the adopted table for `engine`.
    ///
    /// # Safety
    ///
    /// `engine` must stay valid for the host's lifetime, and the table's
    /// entries must be callable from every thread that uses this host.
    pub unsafe fn new(shared: EngineFwdShared, engine: *mut EngineHandle) -> ForwardHost {
        ForwardHost { shared, engine }
    }
}

impl CodeHost for ForwardHost {
    fn code_size(&self, code: *const u8) -> usize {
        unsafe { (self.shared.code_size)(code) }
    }

    fn is_code(&self, ptr: *const u8) -> bool {
        unsafe { (self.shared.is_code)(ptr) }
    }

    fn create_watch(&self) -> Box<dyn RelocationWatch> {
        let raw = unsafe { (self.shared.create_watch)(self.engine) };
        Box::new(ForwardWatch {
            shared: self.shared,
            raw,
        })
    }
}

struct ForwardWatch {
    shared: EngineFwdShared,
    raw: *mut RawWatch,
}

unsafe impl Send for ForwardWatch {}

impl RelocationWatch for ForwardWatch {
    fn add(&mut self, addr: *const u8) {
        unsafe { (self.shared.watch_add)(self.raw, addr) }
    }

    fn remove(&mut self, addr: *const u8) {
        unsafe { (self.shared.watch_remove)(self.raw, addr) }
    }

    fn clear(&mut self) {
        unsafe { (self.shared.watch_clear)(self.raw) }
    }

    fn moved(&self) -> bool {
        unsafe { (self.shared.watch_moved)(self.raw) }
    }
}

impl Drop for ForwardWatch {
    fn drop(&mut self) {
        unsafe { (self.shared.destroy_watch)(self.raw) }
    }
}
