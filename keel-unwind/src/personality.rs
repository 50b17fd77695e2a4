//! The managed-exception personality.
//!
//! The unwinder calls a *personality function* once per frame, in two
//! phases: a search phase that asks "does this frame want the exception?"
//! and a cleanup phase that runs destructors (and, for the catching frame,
//! installs the resume context). This module implements that policy for
//! JIT-compiled frames.
//!
//! The policy itself is platform-free and driven through the
//! [`UnwindContext`] capability, so it can be exercised without a live
//! unwinder; the thin [`keel_eh_personality`] export adapts the real
//! `_Unwind_Context` to it.
//!
//! Phase-1 results are carried to phase 2 inside the foreign exception
//! header, reusing the same three slots the host C++ runtime uses for its
//! own handlers (see [`ExceptionSlots`]). That way `__cxa_begin_catch` /
//! `__cxa_end_catch` work unchanged on exceptions we catch.

use std::ffi::c_int;
use std::mem;
use std::ptr::NonNull;

use once_cell::sync::OnceCell;

use keel_common::fatal;

use crate::frame::{FnMeta, PartId, StackFrame};
use crate::owner::OwnerHeader;

/// The exception class of GCC C++ exceptions, `"GNUCC++\0"`.
pub const GCC_CXX_CLASS: u64 = 0x474e_5543_432b_2b00;

/// Action flags passed to a personality routine.
pub mod actions {
    use std::ffi::c_int;

    /// Phase 1: searching for a handler.
    pub const SEARCH_PHASE: c_int = 1;
    /// Phase 2: unwinding and running cleanup.
    pub const CLEANUP_PHASE: c_int = 2;
    /// Set together with `CLEANUP_PHASE` on the frame that reported a
    /// handler during the search.
    pub const HANDLER_FRAME: c_int = 4;
    /// Forced unwinding (thread cancellation and friends).
    pub const FORCE_UNWIND: c_int = 8;
}

/// Reason codes a personality routine reports back to the unwinder.
pub mod reason {
    use std::ffi::c_int;

    /// This frame has a handler for the exception.
    pub const HANDLER_FOUND: c_int = 6;
    /// The context was modified; resume execution there.
    pub const INSTALL_CONTEXT: c_int = 7;
    /// Nothing to do in this frame; keep unwinding.
    pub const CONTINUE_UNWIND: c_int = 8;
}

/// The language-independent exception header, as defined by the Itanium
/// ABI. The C++ runtime embeds this at the end of its own record.
#[repr(C, align(16))]
pub struct UnwindException {
    /// Identifies the throwing language and runtime.
    pub class: u64,
    /// Destructor invoked if a foreign runtime takes over the exception.
    pub cleanup: Option<unsafe extern "C" fn(c_int, *mut UnwindException)>,
    /// Unwinder-private state.
    pub private1: usize,
    /// Unwinder-private state.
    pub private2: usize,
}

/// The host C++ runtime's per-exception record (`__cxa_exception`).
///
/// This struct is the single source of truth for the slot layout the
/// personality reuses; if the host compiler's layout ever changes, this
/// view is the only thing to revisit. The personality touches exactly three
/// fields, exposed through [`ExceptionSlots`]; everything else is listed
/// only to get the offsets right.
#[repr(C)]
struct CxaException {
    exception_type: *const std::ffi::c_void,
    exception_destructor: *const std::ffi::c_void,
    unexpected_handler: *const std::ffi::c_void,
    terminate_handler: *const std::ffi::c_void,
    next_exception: *const std::ffi::c_void,
    handler_count: c_int,
    handler_switch_value: c_int,
    action_record: *const u8,
    language_specific_data: *const u8,
    catch_temp: *mut std::ffi::c_void,
    adjusted_ptr: *mut std::ffi::c_void,
    header: UnwindException,
}

/// Typed access to the three `__cxa_exception` slots the personality
/// reuses to carry phase-1 results into phase 2:
///
/// - `adjusted_ptr` holds the extracted object pointer, which doubles as
///   the value `__cxa_begin_catch` returns;
/// - `catch_temp` holds the resume instruction pointer;
/// - `handler_switch_value` holds the part whose handler catches.
///
/// Storing a collector-managed pointer in a malloc'd record is tolerable
/// here: while it is stored, a pointer into the same code allocation is
/// pinned on the execution stack anyway.
pub struct ExceptionSlots {
    cxa: *mut CxaException,
}

impl ExceptionSlots {
    /// Recovers the C++ exception record wrapped around `exception`.
    ///
    /// # Safety
    ///
    /// `exception` must be the header embedded in a live `__cxa_exception`
    /// allocation (true for every exception whose class is
    /// [`GCC_CXX_CLASS`]).
    pub unsafe fn from_exception(exception: *mut UnwindException) -> ExceptionSlots {
        let offset = mem::offset_of!(CxaException, header);
        ExceptionSlots {
            cxa: (exception as *mut u8).sub(offset) as *mut CxaException,
        }
    }

    /// The extracted object pointer.
    pub fn object(&self) -> *mut u8 {
        unsafe { (*self.cxa).adjusted_ptr as *mut u8 }
    }

    /// Stores the extracted object pointer.
    pub fn set_object(&mut self, object: *mut u8) {
        unsafe { (*self.cxa).adjusted_ptr = object as *mut std::ffi::c_void }
    }

    /// The instruction pointer to resume at.
    pub fn resume_ip(&self) -> *const u8 {
        unsafe { (*self.cxa).catch_temp as *const u8 }
    }

    /// Stores the instruction pointer to resume at.
    pub fn set_resume_ip(&mut self, ip: *const u8) {
        unsafe { (*self.cxa).catch_temp = ip as *mut std::ffi::c_void }
    }

    /// The part whose handler catches the exception.
    pub fn part(&self) -> PartId {
        PartId(unsafe { (*self.cxa).handler_switch_value } as u32)
    }

    /// Stores the part whose handler catches the exception.
    pub fn set_part(&mut self, part: PartId) {
        unsafe { (*self.cxa).handler_switch_value = part.0 as c_int }
    }
}

/// Extracts the thrown managed object from a foreign exception, or reports
/// that the exception is not one of ours.
///
/// The check depends on the language front-end's notion of type identity,
/// so the front-end registers its extractor at startup via
/// [`install_exception_extractor`]. Until one is registered, every
/// exception is foreign and unwinds straight through managed frames.
pub type ExceptionExtractor =
    unsafe fn(class: u64, exception: *mut UnwindException) -> Option<NonNull<u8>>;

static EXTRACTOR: OnceCell<ExceptionExtractor> = OnceCell::new();

/// Registers the process-wide exception extractor. The first registration
/// wins; later ones are ignored and reported as `false`.
pub fn install_exception_extractor(extractor: ExceptionExtractor) -> bool {
    EXTRACTOR.set(extractor).is_ok()
}

/// What the personality decided for one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing to do here; keep unwinding.
    ContinueUnwind,
    /// This frame catches the exception (search phase only).
    HandlerFound,
    /// The context was rewritten to enter the catch clause.
    InstallContext,
}

/// The slice of unwinder state the policy needs: program counter, function
/// extent, the frame base, and the ability to redirect execution.
///
/// The production implementation wraps `_Unwind_Context`; tests substitute
/// a mock.
pub trait UnwindContext {
    /// The program counter in the frame being unwound.
    fn ip(&self) -> *const u8;

    /// The start of the function's code.
    fn region_start(&self) -> *const u8;

    /// The length of the function's code allocation.
    fn code_len(&self) -> usize;

    /// The frame-base register of the frame being unwound.
    fn frame_base(&self) -> *mut u8;

    /// Sets the return-value register for the resumed frame.
    fn set_return_value(&mut self, value: *mut u8);

    /// Sets the instruction pointer for the resumed frame.
    fn set_ip(&mut self, ip: *const u8);
}

/// Consumes the exception with the host C++ runtime and returns the object
/// pointer to hand to the catch clause.
///
/// Split out so the platform-free policy tests can substitute the
/// `__cxa_begin_catch`/`__cxa_end_catch` pair.
pub trait ExceptionConsumer {
    /// Takes ownership of `exception` and returns the catchable object.
    ///
    /// # Safety
    ///
    /// `exception` must be a live exception the search phase accepted.
    unsafe fn consume(&mut self, exception: *mut UnwindException) -> *mut u8;
}

/// The two-phase policy for one frame. See the module docs.
///
/// # Safety
///
/// `exception` must point at a live exception header; the context must
/// describe a frame of JIT code carrying trailer metadata.
pub unsafe fn personality(
    ctx: &mut impl UnwindContext,
    consumer: &mut impl ExceptionConsumer,
    exception_actions: c_int,
    class: u64,
    exception: *mut UnwindException,
) -> Disposition {
    let region = ctx.region_start();
    let meta = match FnMeta::from_code(region, ctx.code_len()) {
        Ok(meta) => meta,
        Err(err) => fatal!("cannot unwind at {region:p}: {err}"),
    };
    let owner = meta.owner();
    if owner.is_null() {
        fatal!("function at {region:p} has no owner");
    }

    if exception_actions & actions::SEARCH_PHASE != 0 {
        // Phase 1: search for a handler.
        if !OwnerHeader::has_catch(owner) {
            return Disposition::ContinueUnwind;
        }

        // Is this an exception we can represent? Somewhat expensive, so it
        // comes after the cheap handler check.
        let Some(extractor) = EXTRACTOR.get() else {
            return Disposition::ContinueUnwind;
        };
        let Some(object) = extractor(class, exception) else {
            return Disposition::ContinueUnwind;
        };

        let part = meta.find_part(region, ctx.ip());
        if !part.is_valid() {
            return Disposition::ContinueUnwind;
        }

        let Some(resume) = OwnerHeader::find_catch(owner, part, object.as_ptr()) else {
            return Disposition::ContinueUnwind;
        };

        // Carry the results over to phase 2 in the reused host slots. The
        // object pointer must go to `adjusted_ptr`, or `__cxa_begin_catch`
        // would return the wrong value later.
        let mut slots = ExceptionSlots::from_exception(exception);
        slots.set_object(object.as_ptr());
        slots.set_resume_ip(resume.ip);
        slots.set_part(resume.part);

        Disposition::HandlerFound
    } else if exception_actions & actions::CLEANUP_PHASE != 0
        && exception_actions & actions::HANDLER_FRAME != 0
    {
        // Phase 2, in the frame that reported the handler. Read back what
        // the search phase stashed.
        let slots = ExceptionSlots::from_exception(exception);
        let catch_part = slots.part();
        let resume_ip = slots.resume_ip();

        // Run the destructors between the throw site and the catch scope.
        let throw_part = meta.find_part(region, ctx.ip());
        let frame = StackFrame::new(throw_part, ctx.frame_base());
        OwnerHeader::cleanup(owner, &frame, Some(catch_part));

        // The object is a pointer, so the host record can be released
        // immediately; the dereferenced pointer was stored in the slot and
        // comes back from the consumer.
        let object = consumer.consume(exception);

        // The frame itself was already unwound for us; redirecting the
        // return-value register and the instruction pointer is all that is
        // left.
        ctx.set_return_value(object);
        ctx.set_ip(resume_ip);
        Disposition::InstallContext
    } else if exception_actions & actions::CLEANUP_PHASE != 0 {
        // Phase 2, in a frame that is simply being abandoned.
        let part = meta.find_part(region, ctx.ip());
        if part.is_valid() {
            let frame = StackFrame::new(part, ctx.frame_base());
            OwnerHeader::cleanup(owner, &frame, None);
        }
        Disposition::ContinueUnwind
    } else {
        tracing::warn!(
            actions = exception_actions,
            "personality function called with an unknown action"
        );
        Disposition::ContinueUnwind
    }
}

#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
mod native {
    use super::*;
    use crate::regs::dw;
    use crate::table::DwarfTable;
    use std::ffi::c_void;

    /// Opaque unwinder state.
    #[repr(C)]
    pub struct RawUnwindContext {
        _opaque: [u8; 0],
    }

    extern "C" {
        fn _Unwind_GetIP(ctx: *mut RawUnwindContext) -> usize;
        fn _Unwind_SetIP(ctx: *mut RawUnwindContext, ip: usize);
        fn _Unwind_GetGR(ctx: *mut RawUnwindContext, reg: c_int) -> usize;
        fn _Unwind_SetGR(ctx: *mut RawUnwindContext, reg: c_int, value: usize);
        fn _Unwind_GetRegionStart(ctx: *mut RawUnwindContext) -> usize;
    }

    #[link(name = "stdc++")]
    extern "C" {
        fn __cxa_begin_catch(exception: *mut c_void) -> *mut c_void;
        fn __cxa_end_catch();
    }

    /// [`UnwindContext`] over a live `_Unwind_Context`.
    pub struct NativeContext {
        raw: *mut RawUnwindContext,
    }

    impl NativeContext {
        /// Wraps the unwinder state passed to a personality routine.
        ///
        /// # Safety
        ///
        /// `raw` must be the context of the personality invocation this
        /// wrapper is used within.
        pub unsafe fn new(raw: *mut RawUnwindContext) -> NativeContext {
            NativeContext { raw }
        }
    }

    impl UnwindContext for NativeContext {
        fn ip(&self) -> *const u8 {
            unsafe { _Unwind_GetIP(self.raw) as *const u8 }
        }

        fn region_start(&self) -> *const u8 {
            unsafe { _Unwind_GetRegionStart(self.raw) as *const u8 }
        }

        fn code_len(&self) -> usize {
            // The region is JIT code, so its FDE is in the process table
            // and carries the allocation length.
            match DwarfTable::global().find(self.region_start()) {
                Some(fde) => unsafe { fde.as_ref() }.code_size(),
                None => 0,
            }
        }

        fn frame_base(&self) -> *mut u8 {
            unsafe { _Unwind_GetGR(self.raw, dw::FRAME_BASE) as *mut u8 }
        }

        fn set_return_value(&mut self, value: *mut u8) {
            // Note: of the integer registers, the unwinder only lets us
            // set the return pair here.
            unsafe { _Unwind_SetGR(self.raw, dw::RETURN0, value as usize) }
        }

        fn set_ip(&mut self, ip: *const u8) {
            unsafe { _Unwind_SetIP(self.raw, ip as usize) }
        }
    }

    /// [`ExceptionConsumer`] backed by the host C++ runtime.
    pub struct CxaConsumer;

    impl ExceptionConsumer for CxaConsumer {
        unsafe fn consume(&mut self, exception: *mut UnwindException) -> *mut u8 {
            // The dereferenced pointer was stored in `adjusted_ptr`, so no
            // further adjustment happens here.
            let object = __cxa_begin_catch(exception as *mut c_void);
            // Nothing keeps the host record alive beyond this point.
            __cxa_end_catch();
            object as *mut u8
        }
    }

    /// The personality routine referenced by generated CIEs.
    ///
    /// # Safety
    ///
    /// Called by the platform unwinder with a live exception and context.
    #[no_mangle]
    pub unsafe extern "C" fn keel_eh_personality(
        version: c_int,
        exception_actions: c_int,
        class: u64,
        exception: *mut UnwindException,
        context: *mut RawUnwindContext,
    ) -> c_int {
        if version != 1 {
            tracing::warn!(version, "unsupported unwinder version");
            return reason::CONTINUE_UNWIND;
        }

        let mut ctx = NativeContext::new(context);
        match personality(&mut ctx, &mut CxaConsumer, exception_actions, class, exception) {
            Disposition::ContinueUnwind => reason::CONTINUE_UNWIND,
            Disposition::HandlerFound => reason::HANDLER_FOUND,
            Disposition::InstallContext => reason::INSTALL_CONTEXT,
        }
    }
}

#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
pub use native::{keel_eh_personality, CxaConsumer, NativeContext, RawUnwindContext};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{write_trailer, FnPart, PartId};
    use crate::owner::{OwnerOps, Resume};
    use std::cell::RefCell;

    /// A synthetic exception class for the test extractor.
    const TEST_CLASS: u64 = GCC_CXX_CLASS;
    const FOREIGN_CLASS: u64 = 0x1122_3344_5566_7788;

    unsafe fn test_extractor(class: u64, exception: *mut UnwindException) -> Option<NonNull<u8>> {
        if class == TEST_CLASS {
            // Treat the exception header itself as the managed object.
            NonNull::new(exception as *mut u8)
        } else {
            None
        }
    }

    fn ensure_extractor() {
        install_exception_extractor(test_extractor);
    }

    /// Owner with parts nested p1 ⊂ p2 ⊂ p3 and a catch in p1.
    #[repr(C)]
    struct NestedOwner {
        header: OwnerHeader,
        /// (part, enclosing part), innermost first.
        nesting: Vec<(PartId, PartId)>,
        catch_part: PartId,
        resume_ip: *const u8,
        log: RefCell<Vec<String>>,
    }

    unsafe fn nested_has_catch(owner: *const OwnerHeader) -> bool {
        (*(owner as *const NestedOwner)).catch_part.is_valid()
    }

    unsafe fn nested_find_catch(
        owner: *const OwnerHeader,
        part: PartId,
        _object: *mut u8,
    ) -> Option<Resume> {
        let owner = &*(owner as *const NestedOwner);
        // The catch applies when the throw-site part is nested inside the
        // catching part.
        let mut at = part;
        while at.is_valid() {
            if at == owner.catch_part {
                return Some(Resume {
                    ip: owner.resume_ip,
                    part: owner.catch_part,
                });
            }
            at = owner.enclosing(at);
        }
        None
    }

    unsafe fn nested_cleanup(
        owner: *const OwnerHeader,
        frame: &crate::frame::StackFrame,
        until: Option<PartId>,
    ) {
        let owner = &*(owner as *const NestedOwner);
        let mut at = frame.part;
        while at.is_valid() && Some(at) != until {
            owner.log.borrow_mut().push(format!("~p{}", at.0));
            at = owner.enclosing(at);
        }
    }

    unsafe fn nested_name(_owner: *const OwnerHeader) -> Option<String> {
        Some("nested".into())
    }

    static NESTED_OPS: OwnerOps = OwnerOps {
        has_catch: nested_has_catch,
        find_catch: nested_find_catch,
        cleanup: nested_cleanup,
        name: nested_name,
    };

    impl NestedOwner {
        fn enclosing(&self, part: PartId) -> PartId {
            self.nesting
                .iter()
                .find(|(p, _)| *p == part)
                .map(|(_, up)| *up)
                .unwrap_or(PartId::INVALID)
        }
    }

    struct MockContext {
        code: Vec<u8>,
        ip_offset: usize,
        frame: Vec<u8>,
        set_ip: Option<*const u8>,
        set_return: Option<*mut u8>,
    }

    impl MockContext {
        fn new(code: Vec<u8>, ip_offset: usize) -> MockContext {
            MockContext {
                code,
                ip_offset,
                frame: vec![0; 64],
                set_ip: None,
                set_return: None,
            }
        }
    }

    impl UnwindContext for MockContext {
        fn ip(&self) -> *const u8 {
            self.code[self.ip_offset..].as_ptr()
        }

        fn region_start(&self) -> *const u8 {
            self.code.as_ptr()
        }

        fn code_len(&self) -> usize {
            self.code.len()
        }

        fn frame_base(&self) -> *mut u8 {
            self.frame.as_ptr() as *mut u8
        }

        fn set_return_value(&mut self, value: *mut u8) {
            self.set_return = Some(value);
        }

        fn set_ip(&mut self, ip: *const u8) {
            self.set_ip = Some(ip);
        }
    }

    struct MockConsumer {
        consumed: usize,
    }

    impl ExceptionConsumer for MockConsumer {
        unsafe fn consume(&mut self, exception: *mut UnwindException) -> *mut u8 {
            self.consumed += 1;
            ExceptionSlots::from_exception(exception).object()
        }
    }

    fn new_exception(class: u64) -> Box<CxaException> {
        let mut cxa: Box<CxaException> = unsafe { Box::new(mem::zeroed()) };
        cxa.header.class = class;
        cxa
    }

    fn nested_code(owner: &NestedOwner) -> Vec<u8> {
        let mut code = vec![0u8; 256];
        write_trailer(
            &mut code,
            &[
                FnPart { offset: 0x10, part: 1 },
                FnPart { offset: 0x20, part: 2 },
                FnPart { offset: 0x30, part: 3 },
            ],
            &owner.header,
            std::ptr::null(),
        );
        code
    }

    fn nested_owner(resume_ip: *const u8) -> NestedOwner {
        NestedOwner {
            header: OwnerHeader::new(&NESTED_OPS),
            nesting: vec![
                (PartId(3), PartId(2)),
                (PartId(2), PartId(1)),
                (PartId(1), PartId::INVALID),
            ],
            catch_part: PartId(1),
            resume_ip,
            log: RefCell::new(Vec::new()),
        }
    }

    #[test]
    fn slot_layout_matches_the_host_abi() {
        // Eleven fields before the header: nine pointers and two ints.
        assert_eq!(mem::offset_of!(CxaException, header), 80);
        assert_eq!(mem::align_of::<UnwindException>(), 16);
        assert_eq!(mem::offset_of!(CxaException, handler_switch_value), 44);
        assert_eq!(mem::offset_of!(CxaException, catch_temp), 64);
        assert_eq!(mem::offset_of!(CxaException, adjusted_ptr), 72);
    }

    #[test]
    fn slots_round_trip() {
        let mut cxa = new_exception(TEST_CLASS);
        let header = &mut cxa.header as *mut UnwindException;
        let mut slots = unsafe { ExceptionSlots::from_exception(header) };

        slots.set_object(0x1234 as *mut u8);
        slots.set_resume_ip(0x5678 as *const u8);
        slots.set_part(PartId(7));

        assert_eq!(cxa.adjusted_ptr as usize, 0x1234);
        assert_eq!(cxa.catch_temp as usize, 0x5678);
        assert_eq!(cxa.handler_switch_value, 7);

        let slots = unsafe { ExceptionSlots::from_exception(header) };
        assert_eq!(slots.object() as usize, 0x1234);
        assert_eq!(slots.resume_ip() as usize, 0x5678);
        assert_eq!(slots.part(), PartId(7));
    }

    #[test]
    fn catch_runs_intermediate_cleanup() {
        ensure_extractor();

        let resume_marker = 0xbeef as *const u8;
        let owner = nested_owner(resume_marker);
        let code = nested_code(&owner);

        // Throw site inside p3 (offset 0x35), catch in p1.
        let mut ctx = MockContext::new(code, 0x35);
        let mut cxa = new_exception(TEST_CLASS);
        let exception = &mut cxa.header as *mut UnwindException;
        let mut consumer = MockConsumer { consumed: 0 };

        let disposition = unsafe {
            personality(
                &mut ctx,
                &mut consumer,
                actions::SEARCH_PHASE,
                TEST_CLASS,
                exception,
            )
        };
        assert_eq!(disposition, Disposition::HandlerFound);
        assert!(owner.log.borrow().is_empty());

        let disposition = unsafe {
            personality(
                &mut ctx,
                &mut consumer,
                actions::CLEANUP_PHASE | actions::HANDLER_FRAME,
                TEST_CLASS,
                exception,
            )
        };
        assert_eq!(disposition, Disposition::InstallContext);

        // Destructors of p3 and p2 ran, in that order; p1 survives to run
        // its catch clause.
        assert_eq!(*owner.log.borrow(), vec!["~p3", "~p2"]);
        assert_eq!(consumer.consumed, 1);
        assert_eq!(ctx.set_ip, Some(resume_marker));
        assert_eq!(ctx.set_return, Some(exception as *mut u8));
    }

    #[test]
    fn non_handler_frames_clean_everything() {
        ensure_extractor();

        let owner = nested_owner(std::ptr::null());
        let code = nested_code(&owner);
        let mut ctx = MockContext::new(code, 0x25); // inside p2
        let mut cxa = new_exception(TEST_CLASS);
        let exception = &mut cxa.header as *mut UnwindException;
        let mut consumer = MockConsumer { consumed: 0 };

        let disposition = unsafe {
            personality(
                &mut ctx,
                &mut consumer,
                actions::CLEANUP_PHASE,
                TEST_CLASS,
                exception,
            )
        };
        assert_eq!(disposition, Disposition::ContinueUnwind);
        assert_eq!(*owner.log.borrow(), vec!["~p2", "~p1"]);
        assert_eq!(consumer.consumed, 0);
    }

    #[test]
    fn foreign_exceptions_continue_unwinding() {
        ensure_extractor();

        let owner = nested_owner(std::ptr::null());
        let code = nested_code(&owner);
        let mut ctx = MockContext::new(code, 0x35);
        let mut cxa = new_exception(FOREIGN_CLASS);
        let exception = &mut cxa.header as *mut UnwindException;
        let mut consumer = MockConsumer { consumed: 0 };

        let disposition = unsafe {
            personality(
                &mut ctx,
                &mut consumer,
                actions::SEARCH_PHASE,
                FOREIGN_CLASS,
                exception,
            )
        };
        assert_eq!(disposition, Disposition::ContinueUnwind);

        // Cleanup still runs for foreign exceptions.
        let disposition = unsafe {
            personality(
                &mut ctx,
                &mut consumer,
                actions::CLEANUP_PHASE,
                FOREIGN_CLASS,
                exception,
            )
        };
        assert_eq!(disposition, Disposition::ContinueUnwind);
        assert_eq!(*owner.log.borrow(), vec!["~p3", "~p2", "~p1"]);
    }

    #[test]
    fn prologue_frames_do_nothing() {
        ensure_extractor();

        let owner = nested_owner(std::ptr::null());
        let code = nested_code(&owner);
        // Before the first part boundary: nothing is active yet.
        let mut ctx = MockContext::new(code, 0x08);
        let mut cxa = new_exception(TEST_CLASS);
        let exception = &mut cxa.header as *mut UnwindException;
        let mut consumer = MockConsumer { consumed: 0 };

        let disposition = unsafe {
            personality(
                &mut ctx,
                &mut consumer,
                actions::SEARCH_PHASE,
                TEST_CLASS,
                exception,
            )
        };
        assert_eq!(disposition, Disposition::ContinueUnwind);

        let disposition = unsafe {
            personality(
                &mut ctx,
                &mut consumer,
                actions::CLEANUP_PHASE,
                TEST_CLASS,
                exception,
            )
        };
        assert_eq!(disposition, Disposition::ContinueUnwind);
        assert!(owner.log.borrow().is_empty());
    }

    #[test]
    fn unknown_actions_are_tolerated() {
        ensure_extractor();

        let owner = nested_owner(std::ptr::null());
        let code = nested_code(&owner);
        let mut ctx = MockContext::new(code, 0x35);
        let mut cxa = new_exception(TEST_CLASS);
        let exception = &mut cxa.header as *mut UnwindException;
        let mut consumer = MockConsumer { consumed: 0 };

        let disposition = unsafe {
            personality(&mut ctx, &mut consumer, 0, TEST_CLASS, exception)
        };
        assert_eq!(disposition, Disposition::ContinueUnwind);
    }
}
