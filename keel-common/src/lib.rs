//! Common functionality for `keel`.
//!
//! This crate exposes a set of key types used throughout the runtime core:
//!
//!  - [`Size`] and [`Offset`]: two-width (32/64-bit) aligned size arithmetic,
//!    so a single declaration describes the data layout for both ABIs.
//!  - [`ValType`]: a minimal description of values passed to and from
//!    functions, tagging floats for ABIs that route them separately.
//!  - [`InlineFifo`], [`InlinePriorityList`] and [`InlineSet`]: intrusive
//!    list primitives whose link fields live inside the member elements.
//!  - [`CodeHost`] and [`RelocationWatch`]: the contract between the runtime
//!    core and the (external) relocating garbage collector.
//!
//! This module is part of the `keel` crate.

#![warn(missing_docs)]

#[macro_use]
mod macros;

mod host;
mod list;
mod size;
mod value;

pub use crate::host::*;
pub use crate::list::*;
pub use crate::size::*;
pub use crate::value::*;
