//! In-memory inodes.
//!
//! Mutable metadata sits behind the inode's own lock; the only way to read
//! or change it is through the guard returned by [`Inode::lock`] (or an
//! exchange guard holding several of them).

use lsfs_node::InodeNode;
use lsfs_types::{FileType, InodeNumber, ParseError, SeqNum, Timespec};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

/// Metadata protected by the inode lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeMeta {
    pub creat_sqnum: SeqNum,
    pub size: u64,
    pub atime: Timespec,
    pub ctime: Timespec,
    pub mtime: Timespec,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub flags: u32,
    pub xattr_cnt: u32,
    pub xattr_size: u32,
    pub xattr_names: u32,
    /// Inline payload (symlink target). Always empty for directories.
    pub data: Vec<u8>,
    /// The in-memory metadata is newer than the last inode node in the log.
    pub dirty: bool,
}

impl InodeMeta {
    /// Projection written to the log.
    #[must_use]
    pub fn to_node(&self, ino: InodeNumber) -> InodeNode {
        InodeNode {
            ino,
            creat_sqnum: self.creat_sqnum,
            size: self.size,
            atime: self.atime,
            ctime: self.ctime,
            mtime: self.mtime,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            mode: self.mode,
            flags: self.flags,
            xattr_cnt: self.xattr_cnt,
            xattr_size: self.xattr_size,
            xattr_names: self.xattr_names,
            data: self.data.clone(),
        }
    }

    fn from_node(node: InodeNode) -> Self {
        Self {
            creat_sqnum: node.creat_sqnum,
            size: node.size,
            atime: node.atime,
            ctime: node.ctime,
            mtime: node.mtime,
            nlink: node.nlink,
            uid: node.uid,
            gid: node.gid,
            mode: node.mode,
            flags: node.flags,
            xattr_cnt: node.xattr_cnt,
            xattr_size: node.xattr_size,
            xattr_names: node.xattr_names,
            data: node.data,
            dirty: false,
        }
    }
}

/// A cached inode.
#[derive(Debug)]
pub struct Inode {
    ino: InodeNumber,
    kind: FileType,
    meta: Mutex<InodeMeta>,
}

impl Inode {
    pub(crate) fn new(ino: InodeNumber, kind: FileType, meta: InodeMeta) -> Self {
        Self {
            ino,
            kind,
            meta: Mutex::new(meta),
        }
    }

    /// Rebuild an inode from its latest node in the log.
    pub(crate) fn from_node(node: InodeNode) -> Result<Self, ParseError> {
        let kind = FileType::from_mode(node.mode)?;
        let ino = node.ino;
        Ok(Self::new(ino, kind, InodeMeta::from_node(node)))
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    #[must_use]
    pub fn kind(&self) -> FileType {
        self.kind
    }

    /// Exclusive access to the metadata.
    pub fn lock(&self) -> MutexGuard<'_, InodeMeta> {
        self.meta.lock()
    }

    /// Consistent snapshot of the attributes.
    #[must_use]
    pub fn attr(&self) -> InodeAttr {
        InodeAttr::new(self.ino, self.kind, &self.meta.lock())
    }
}

/// Inode attributes, analogous to POSIX `struct stat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    pub ino: InodeNumber,
    pub size: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub kind: FileType,
    /// POSIX permission bits (lower 12 bits of mode).
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub flags: u32,
}

impl InodeAttr {
    pub(crate) fn new(ino: InodeNumber, kind: FileType, meta: &InodeMeta) -> Self {
        Self {
            ino,
            size: meta.size,
            atime: meta.atime,
            mtime: meta.mtime,
            ctime: meta.ctime,
            kind,
            perm: u16::try_from(meta.mode & 0o7777).unwrap_or(0),
            nlink: meta.nlink,
            uid: meta.uid,
            gid: meta.gid,
            flags: meta.flags,
        }
    }
}

/// One name in a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub ino: InodeNumber,
    pub kind: FileType,
    pub name: Vec<u8>,
}

impl DirEntry {
    /// Name as UTF-8 (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_projection_keeps_metadata() {
        let meta = InodeMeta {
            creat_sqnum: SeqNum(5),
            size: 160,
            atime: Timespec { sec: 1, nsec: 0 },
            ctime: Timespec { sec: 2, nsec: 0 },
            mtime: Timespec { sec: 3, nsec: 0 },
            nlink: 2,
            uid: 7,
            gid: 8,
            mode: FileType::Directory.mode_bits() | 0o750,
            flags: 0,
            xattr_cnt: 0,
            xattr_size: 0,
            xattr_names: 0,
            data: Vec::new(),
            dirty: true,
        };
        let node = meta.to_node(InodeNumber(4));
        let inode = Inode::from_node(node).expect("inode");
        assert_eq!(inode.kind(), FileType::Directory);
        let attr = inode.attr();
        assert_eq!(attr.perm, 0o750);
        assert_eq!(attr.mtime, Timespec { sec: 3, nsec: 0 });
        assert!(!inode.lock().dirty, "inodes loaded from the log are clean");
    }
}
