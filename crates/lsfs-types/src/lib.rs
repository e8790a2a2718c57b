#![forbid(unsafe_code)]
//! Strong newtypes and byte helpers shared by every LSFS crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Alignment of every node in the log.
pub const NODE_ALIGN: usize = 8;

/// Longest directory-entry name the on-flash format can carry.
pub const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

impl InodeNumber {
    pub const ROOT: Self = Self(1);
}

/// Global sequence number stamped into each node header.
///
/// Replay orders nodes by sequence number, so a later node for the same key
/// always supersedes an earlier one.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SeqNum(pub u64);

/// Journal head identifier (one write cursor per head).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HeadId(pub u8);

impl HeadId {
    /// Head used for directory entries and inode metadata.
    pub const BASE: Self = Self(0);
}

/// Physical location of a node in the log: LEB number, byte offset, length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeLocation {
    pub lnum: u32,
    pub offs: u32,
    pub len: u32,
}

/// Filesystem-agnostic file type carried by inodes and directory entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileType {
    /// On-flash directory-entry type byte.
    #[must_use]
    pub fn to_dent_type(self) -> u8 {
        match self {
            Self::RegularFile => 0,
            Self::Directory => 1,
            Self::Symlink => 2,
            Self::BlockDevice => 3,
            Self::CharDevice => 4,
            Self::Fifo => 5,
            Self::Socket => 6,
        }
    }

    pub fn from_dent_type(raw: u8) -> Result<Self, ParseError> {
        Ok(match raw {
            0 => Self::RegularFile,
            1 => Self::Directory,
            2 => Self::Symlink,
            3 => Self::BlockDevice,
            4 => Self::CharDevice,
            5 => Self::Fifo,
            6 => Self::Socket,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "dent_type",
                    reason: "unknown inode type",
                });
            }
        })
    }

    /// File-type bits for `mode`.
    #[must_use]
    pub fn mode_bits(self) -> u32 {
        u32::from(match self {
            Self::RegularFile => S_IFREG,
            Self::Directory => S_IFDIR,
            Self::Symlink => S_IFLNK,
            Self::BlockDevice => S_IFBLK,
            Self::CharDevice => S_IFCHR,
            Self::Fifo => S_IFIFO,
            Self::Socket => S_IFSOCK,
        })
    }

    pub fn from_mode(mode: u32) -> Result<Self, ParseError> {
        let bits = u16::try_from(mode & u32::from(S_IFMT))
            .map_err(|_| ParseError::IntegerConversion { field: "mode" })?;
        Ok(match bits {
            S_IFREG => Self::RegularFile,
            S_IFDIR => Self::Directory,
            S_IFLNK => Self::Symlink,
            S_IFBLK => Self::BlockDevice,
            S_IFCHR => Self::CharDevice,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Socket,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "mode",
                    reason: "unknown file type bits",
                });
            }
        })
    }

    #[must_use]
    pub fn is_dir(self) -> bool {
        self == Self::Directory
    }
}

/// Seconds and nanoseconds since the Unix epoch, as stored in inode nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

impl Timespec {
    pub const ZERO: Self = Self { sec: 0, nsec: 0 };

    /// Sample the wall clock once.
    #[must_use]
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }
}

impl From<SystemTime> for Timespec {
    fn from(value: SystemTime) -> Self {
        match value.duration_since(UNIX_EPOCH) {
            Ok(since) => Self {
                sec: i64::try_from(since.as_secs()).unwrap_or(i64::MAX),
                nsec: since.subsec_nanos(),
            },
            Err(before) => {
                let back = before.duration();
                let sec = i64::try_from(back.as_secs()).unwrap_or(i64::MAX);
                if back.subsec_nanos() == 0 {
                    Self { sec: -sec, nsec: 0 }
                } else {
                    Self {
                        sec: -sec - 1,
                        nsec: 1_000_000_000 - back.subsec_nanos(),
                    }
                }
            }
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

/// Round `len` up to the node alignment.
#[inline]
#[must_use]
pub const fn align8(len: usize) -> usize {
    (len + (NODE_ALIGN - 1)) & !(NODE_ALIGN - 1)
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    read_le_u64(data, offset).map(|v| i64::from_le_bytes(v.to_le_bytes()))
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for HeadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}+{}", self.lnum, self.offs, self.len)
    }
}

// ── POSIX file mode constants ────────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u16 = 0o170_000;
/// Named pipe (FIFO).
pub const S_IFIFO: u16 = 0o010_000;
/// Character device.
pub const S_IFCHR: u16 = 0o020_000;
/// Directory.
pub const S_IFDIR: u16 = 0o040_000;
/// Block device.
pub const S_IFBLK: u16 = 0o060_000;
/// Regular file.
pub const S_IFREG: u16 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u16 = 0o120_000;
/// Socket.
pub const S_IFSOCK: u16 = 0o140_000;

// ── Inode flags ─────────────────────────────────────────────────────────────

/// Directory updates are written synchronously.
pub const INODE_FL_DIRSYNC: u32 = 0x0000_0010;
