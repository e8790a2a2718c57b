#![forbid(unsafe_code)]
//! LSFS public API facade.
//!
//! Re-exports core functionality from `lsfs-core` through a stable external
//! interface. Downstream consumers depend on this crate rather than on the
//! individual `lsfs-*` crates.

pub use lsfs_core::*;
