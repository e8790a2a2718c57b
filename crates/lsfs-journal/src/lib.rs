#![forbid(unsafe_code)]
//! Flash devices, log heads and recovery scanning.
//!
//! The journal is append-only: nodes are written once into the LEB owned
//! by a head and are never rewritten in place. The index is derived from
//! the log and rebuilt from a [`scan`] on mount.

pub mod device;
pub mod journal;
pub mod scan;
pub mod state;

pub use device::{ERASED, FileFlash, FlashDevice, MemFlash};
pub use journal::{HeadWriter, Journal, SpaceStats};
pub use scan::{CorruptTail, LebUsage, ScanReport, ScannedNode, corruption, scan};
pub use state::{FsState, StateSwitch};
