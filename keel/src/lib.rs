//! Keel is the runtime core of a managed, multi-language compiler and
//! runtime system. It consists of multiple largely independent crates
//! bundled together behind this facade, covering the plumbing between
//! JIT-compiled code, the platform unwinder and a relocating garbage
//! collector.
//!
//! # What's in the package
//!
//! - Two-width size/offset arithmetic and intrusive list primitives
//!   (`keel-common`, always available)
//! - A concurrent instruction-pointer index over relocatable code blocks
//!   (`codemap`)
//! - DWARF unwind records for JIT code, the platform FDE-lookup hook and
//!   the managed-exception personality (`unwind`)
//! - Cooperative user-space threads with guarded stacks (`fiber`)
//! - A dynamic function-call marshaller with guaranteed argument teardown
//!   (`call`)
//! - Stack-trace capture with pluggable symbolic formatting (`trace`)
//! - The forward table for dynamically loaded runtime modules (`engine`)
//!
//! # Usage
//!
//! Add `keel` as a dependency to your `Cargo.toml`. Every component above
//! is behind a feature of the same name; all of them are enabled by
//! default, so trim the feature list to what you actually link.

#![warn(missing_docs)]

pub use keel_common as common;

#[cfg(feature = "call")]
pub use keel_call as call;
#[cfg(feature = "codemap")]
pub use keel_codemap as codemap;
#[cfg(feature = "engine")]
pub use keel_engine as engine;
#[cfg(feature = "fiber")]
pub use keel_fiber as fiber;
#[cfg(feature = "trace")]
pub use keel_trace as trace;
#[cfg(feature = "unwind")]
pub use keel_unwind as unwind;
