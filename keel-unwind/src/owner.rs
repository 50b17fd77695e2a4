//! The owner-object interface.
//!
//! Each compiled function is owned by a managed object that knows the
//! function's catch and cleanup descriptors. The code trailer can only
//! store a thin pointer (the layout is fixed, see [`crate::FnData`]), so
//! dynamic dispatch goes through a manual vtable: the owner object starts
//! with an [`OwnerHeader`] whose first field points at a static
//! [`OwnerOps`] table, in the style of `RawWakerVTable`.
//!
//! The collector strongly owns the owner through the code trailer; the
//! runtime core never retains owner pointers beyond a single unwind step.

use crate::frame::{PartId, StackFrame};

/// Where execution resumes after a successful catch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resume {
    /// The instruction to resume at, inside the catching function.
    pub ip: *const u8,
    /// The part the catch clause lives in.
    pub part: PartId,
}

/// The operations an owner object supports.
///
/// All functions receive the pointer stored in the code trailer. They are
/// called during unwinding and must not unwind themselves.
pub struct OwnerOps {
    /// Whether the function declares any catch handler at all. Cheap; used
    /// to bail out of the search phase early.
    pub has_catch: unsafe fn(owner: *const OwnerHeader) -> bool,

    /// Whether the scope `part` catches the thrown `object`. On success the
    /// owner returns where to resume.
    pub find_catch:
        unsafe fn(owner: *const OwnerHeader, part: PartId, object: *mut u8) -> Option<Resume>,

    /// Runs the scope destructors for `frame`. With `until` set, cleanup
    /// stops at (and excludes) that part, the handler-frame case, where
    /// the catch clause takes over. Without it, the whole frame is being
    /// abandoned. Destructors run in reverse declaration order.
    pub cleanup: unsafe fn(owner: *const OwnerHeader, frame: &StackFrame, until: Option<PartId>),

    /// The human-readable name of the function, for stack traces.
    pub name: unsafe fn(owner: *const OwnerHeader) -> Option<String>,
}

/// The leading field of every owner object.
///
/// Concrete owners embed this as their first field (`#[repr(C)]`) and
/// recover themselves from the pointer inside their [`OwnerOps`] callbacks.
#[repr(C)]
pub struct OwnerHeader {
    /// The operations of this owner.
    pub ops: &'static OwnerOps,
}

impl OwnerHeader {
    /// Creates a header referring to `ops`.
    pub const fn new(ops: &'static OwnerOps) -> OwnerHeader {
        OwnerHeader { ops }
    }
}

/// Convenience wrappers hiding the vtable indirection.
impl OwnerHeader {
    /// See [`OwnerOps::has_catch`].
    ///
    /// # Safety
    ///
    /// `this` must point at a live owner object.
    pub unsafe fn has_catch(this: *const OwnerHeader) -> bool {
        ((*this).ops.has_catch)(this)
    }

    /// See [`OwnerOps::find_catch`].
    ///
    /// # Safety
    ///
    /// `this` must point at a live owner object; `object` at the thrown
    /// managed object.
    pub unsafe fn find_catch(
        this: *const OwnerHeader,
        part: PartId,
        object: *mut u8,
    ) -> Option<Resume> {
        ((*this).ops.find_catch)(this, part, object)
    }

    /// See [`OwnerOps::cleanup`].
    ///
    /// # Safety
    ///
    /// `this` must point at a live owner object; `frame` must describe a
    /// frame of a function this owner compiled.
    pub unsafe fn cleanup(this: *const OwnerHeader, frame: &StackFrame, until: Option<PartId>) {
        ((*this).ops.cleanup)(this, frame, until)
    }

    /// See [`OwnerOps::name`].
    ///
    /// # Safety
    ///
    /// `this` must point at a live owner object.
    pub unsafe fn name(this: *const OwnerHeader) -> Option<String> {
        ((*this).ops.name)(this)
    }
}
