//! Symbolic lookup of captured frames.
//!
//! A [`FrameFormatter`] turns one captured frame into a human-readable
//! name, or declines. The useful instances:
//!
//!  - [`SymbolLookup`]: native symbols via the dynamic linker's debug
//!    information, for runtime and host frames.
//!  - [`RuntimeLookup`]: JIT frames, resolved through the unwind table to
//!    the owning function object and its recorded name.
//!  - [`Composite`]: tries a list of formatters in order.

use std::ffi::CStr;

use keel_unwind::{DwarfTable, FnMeta, OwnerHeader};

use crate::CapturedFrame;

/// Resolves a captured frame into a display name.
pub trait FrameFormatter {
    /// Formats `frame`, or returns `None` when this lookup does not know
    /// the address.
    fn format(&self, frame: &CapturedFrame) -> Option<String>;
}

/// Lookup through the dynamic linker: resolves addresses in the host
/// binary and loaded libraries to their nearest exported symbol.
#[derive(Default)]
pub struct SymbolLookup;

impl SymbolLookup {
    /// Creates the lookup.
    pub fn new() -> SymbolLookup {
        SymbolLookup
    }
}

impl FrameFormatter for SymbolLookup {
    #[cfg(unix)]
    fn format(&self, frame: &CapturedFrame) -> Option<String> {
        unsafe {
            let mut info: libc::Dl_info = std::mem::zeroed();
            if libc::dladdr(frame.code as *const libc::c_void, &mut info) == 0 {
                return None;
            }
            if info.dli_sname.is_null() {
                return None;
            }
            let name = CStr::from_ptr(info.dli_sname).to_string_lossy();
            let offset = (frame.code as usize).wrapping_sub(info.dli_saddr as usize);
            if offset == 0 {
                Some(name.into_owned())
            } else {
                Some(format!("{name}+{offset:#x}"))
            }
        }
    }

    #[cfg(not(unix))]
    fn format(&self, _frame: &CapturedFrame) -> Option<String> {
        None
    }
}

/// Lookup for JIT frames: walks from the address to its unwind record,
/// from there to the function trailer, and asks the owner for its name.
pub struct RuntimeLookup<'a> {
    table: &'a DwarfTable,
}

impl<'a> RuntimeLookup<'a> {
    /// A lookup over the process-wide unwind table.
    pub fn new() -> RuntimeLookup<'static> {
        RuntimeLookup {
            table: DwarfTable::global(),
        }
    }

    /// A lookup over a specific table.
    pub fn with_table(table: &'a DwarfTable) -> RuntimeLookup<'a> {
        RuntimeLookup { table }
    }
}

impl Default for RuntimeLookup<'static> {
    fn default() -> Self {
        RuntimeLookup::new()
    }
}

impl FrameFormatter for RuntimeLookup<'_> {
    fn format(&self, frame: &CapturedFrame) -> Option<String> {
        let fde = self.table.find(frame.code)?;
        let fde = unsafe { fde.as_ref() };

        // The trailer is only trustworthy on the formatting path if it
        // parses cleanly; a trace must never take the process down.
        let meta = unsafe { FnMeta::from_code(fde.code_start(), fde.code_size()) }.ok()?;
        let owner = meta.owner();
        if owner.is_null() {
            return None;
        }
        match unsafe { OwnerHeader::name(owner) } {
            Some(name) => Some(name),
            None => Some("<unnamed function>".into()),
        }
    }
}

/// Tries a sequence of lookups; the first answer wins.
#[derive(Default)]
pub struct Composite<'a> {
    lookups: Vec<&'a dyn FrameFormatter>,
}

impl<'a> Composite<'a> {
    /// Creates an empty chain.
    pub fn new() -> Composite<'a> {
        Composite {
            lookups: Vec::new(),
        }
    }

    /// Appends a lookup to the chain.
    pub fn push(&mut self, lookup: &'a dyn FrameFormatter) -> &mut Self {
        self.lookups.push(lookup);
        self
    }
}

impl FrameFormatter for Composite<'_> {
    fn format(&self, frame: &CapturedFrame) -> Option<String> {
        self.lookups.iter().find_map(|lookup| lookup.format(frame))
    }
}
