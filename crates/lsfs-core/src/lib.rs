#![forbid(unsafe_code)]
//! Filesystem operations over the LSFS log.
//!
//! ```text
//!  Filesystem ── rename(EXCHANGE) ──> exchange ──> lock (ordered inode locks)
//!      │                                 │
//!      │                                 ├──> lsfs-node   (node group)
//!      │                                 ├──> lsfs-journal (reserve, write)
//!      │                                 └──> lsfs-index   (key -> location)
//!      └── format / mount (scan + replay) / lookup / readdir / create / fsync
//! ```

mod exchange;
mod fs;
pub mod inode;
pub mod lock;
mod options;

pub use fs::{Filesystem, RenameFlags};
pub use inode::{DirEntry, Inode, InodeAttr, InodeMeta};
pub use options::MountOptions;

pub use lsfs_error::{ErrorClass, LsfsError, Result};
pub use lsfs_index::{NodeIndex, Tnc};
pub use lsfs_journal::{FileFlash, FlashDevice, FsState, MemFlash, SpaceStats};
pub use lsfs_node::Key;
pub use lsfs_types::{FileType, InodeNumber, NodeLocation, Timespec};
