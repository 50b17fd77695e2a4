//! The shared-runtime forward table.
//!
//! A dynamically loaded module sees its own engine handle but must call
//! back into the host runtime (allocation, type queries, thread
//! attachment, fiber scheduling) through the host's function pointers.
//! This crate defines the two table structures ([`EngineFwdShared`],
//! [`EngineFwdUnique`]), the process-wide attach/detach registry with its
//! version-skew traps, and [`ForwardHost`], which adapts the shared table
//! back into the [`CodeHost`](keel_common::CodeHost) contract the rest of
//! the runtime core consumes.
//!
//! This module is part of the `keel` crate.

#![warn(missing_docs)]

mod fwd;
mod registry;

pub use crate::fwd::*;
pub use crate::registry::*;
