//! # Chord Native
//!
//! The plugin ABI for Chord native libraries, plus the registry that loads
//! plugin binaries and owns their descriptors.
//!
//! A native library is a bundle of native modules (signal-processing
//! operations) exported from a dynamically loaded binary through a single C
//! entry point. All types crossing that boundary live in [`api`] and are
//! `#[repr(C)]`.

pub mod api;
pub mod registry;

pub use api::*;
pub use registry::NativeLibraryRegistry;
