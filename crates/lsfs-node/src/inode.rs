//! Inode nodes.
//!
//! An inode node is a snapshot of one inode's metadata. Directories carry no
//! payload (`data_len == 0`), so their node is exactly [`INO_NODE_SIZE`]
//! bytes; symlinks and inodes with inline data append `data_len` bytes.
//!
//! ```text
//! offset  field
//!      0  common header (24)
//!     24  key (16)
//!     40  creat_sqnum   u64
//!     48  size          u64
//!     56  atime_sec     i64
//!     64  ctime_sec     i64
//!     72  mtime_sec     i64
//!     80  atime_nsec    u32
//!     84  ctime_nsec    u32
//!     88  mtime_nsec    u32
//!     92  nlink         u32
//!     96  uid           u32
//!    100  gid           u32
//!    104  mode          u32
//!    108  flags         u32
//!    112  data_len      u32
//!    116  xattr_cnt     u32
//!    120  xattr_size    u32
//!    124  xattr_names   u32
//!    128  reserved (32 bytes of zero)
//!    160  data
//! ```

use crate::key::{KEY_SIZE, Key, KeyType, decode_raw_key};
use crate::{CH_SIZE, MAX_NODE_SIZE, NodeType, init_common_header};
use lsfs_error::{LsfsError, Result};
use lsfs_types::{
    InodeNumber, ParseError, SeqNum, Timespec, ensure_slice, read_le_i64, read_le_u32,
    read_le_u64,
};

/// Inode node size without payload.
pub const INO_NODE_SIZE: usize = 160;

/// Largest inline payload that still fits a node.
pub const MAX_INO_DATA: usize = MAX_NODE_SIZE - INO_NODE_SIZE;

const KEY_OFFSET: usize = CH_SIZE;
const BODY_OFFSET: usize = CH_SIZE + KEY_SIZE;
const RESERVED_OFFSET: usize = 128;

/// Metadata snapshot of one inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeNode {
    pub ino: InodeNumber,
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
    pub data: Vec<u8>,
}

impl InodeNode {
    /// Encoded length of an inode node with `data_len` payload bytes.
    #[must_use]
    pub const fn len_for_data(data_len: usize) -> usize {
        INO_NODE_SIZE + data_len
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        Self::len_for_data(self.data.len())
    }

    /// Encode into `out`, which must be exactly [`encoded_len`](Self::encoded_len) bytes.
    pub fn encode_into(&self, out: &mut [u8]) -> Result<()> {
        if self.data.len() > MAX_INO_DATA {
            return Err(LsfsError::InvalidState(format!(
                "inode {} carries {} bytes of inline data, limit is {MAX_INO_DATA}",
                self.ino,
                self.data.len()
            )));
        }
        let len = self.encoded_len();
        if out.len() != len {
            return Err(LsfsError::InvalidState(format!(
                "inode buffer is {} bytes, node needs {len}",
                out.len()
            )));
        }
        let len_u32 = u32::try_from(len)
            .map_err(|_| LsfsError::Format("inode node length exceeds u32".to_owned()))?;
        let data_len = u32::try_from(self.data.len())
            .map_err(|_| LsfsError::Format("inode data length exceeds u32".to_owned()))?;

        init_common_header(out, NodeType::Inode, len_u32);
        Key::inode(self.ino).encode_into(&mut out[KEY_OFFSET..KEY_OFFSET + KEY_SIZE]);

        let mut w = FieldWriter {
            buf: out,
            offset: BODY_OFFSET,
        };
        w.put_u64(self.creat_sqnum.0);
        w.put_u64(self.size);
        w.put_i64(self.atime.sec);
        w.put_i64(self.ctime.sec);
        w.put_i64(self.mtime.sec);
        w.put_u32(self.atime.nsec);
        w.put_u32(self.ctime.nsec);
        w.put_u32(self.mtime.nsec);
        w.put_u32(self.nlink);
        w.put_u32(self.uid);
        w.put_u32(self.gid);
        w.put_u32(self.mode);
        w.put_u32(self.flags);
        w.put_u32(data_len);
        w.put_u32(self.xattr_cnt);
        w.put_u32(self.xattr_size);
        w.put_u32(self.xattr_names);
        debug_assert_eq!(w.offset, RESERVED_OFFSET);

        out[RESERVED_OFFSET..INO_NODE_SIZE].fill(0);
        out[INO_NODE_SIZE..].copy_from_slice(&self.data);
        Ok(())
    }

    /// Decode an inode node whose header has already been verified.
    pub fn decode(node: &[u8]) -> std::result::Result<Self, ParseError> {
        let raw = decode_raw_key(node, KEY_OFFSET)?;
        if raw.key_type != KeyType::Inode {
            return Err(ParseError::InvalidField {
                field: "key_type",
                reason: "inode node carries a non-inode key",
            });
        }
        if raw.ino.0 == 0 {
            return Err(ParseError::InvalidField {
                field: "ino",
                reason: "inode number 0 is invalid",
            });
        }
        let data_len = usize::try_from(read_le_u32(node, 112)?)
            .map_err(|_| ParseError::IntegerConversion { field: "data_len" })?;
        if node.len() != Self::len_for_data(data_len) {
            return Err(ParseError::InvalidField {
                field: "len",
                reason: "node length disagrees with data_len",
            });
        }
        let data = ensure_slice(node, INO_NODE_SIZE, data_len)?.to_vec();

        Ok(Self {
            ino: raw.ino,
            creat_sqnum: SeqNum(read_le_u64(node, 40)?),
            size: read_le_u64(node, 48)?,
            atime: Timespec {
                sec: read_le_i64(node, 56)?,
                nsec: read_le_u32(node, 80)?,
            },
            ctime: Timespec {
                sec: read_le_i64(node, 64)?,
                nsec: read_le_u32(node, 84)?,
            },
            mtime: Timespec {
                sec: read_le_i64(node, 72)?,
                nsec: read_le_u32(node, 88)?,
            },
            nlink: read_le_u32(node, 92)?,
            uid: read_le_u32(node, 96)?,
            gid: read_le_u32(node, 100)?,
            mode: read_le_u32(node, 104)?,
            flags: read_le_u32(node, 108)?,
            xattr_cnt: read_le_u32(node, 116)?,
            xattr_size: read_le_u32(node, 120)?,
            xattr_names: read_le_u32(node, 124)?,
            data,
        })
    }
}

struct FieldWriter<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl FieldWriter<'_> {
    fn put_u32(&mut self, value: u32) {
        self.buf[self.offset..self.offset + 4].copy_from_slice(&value.to_le_bytes());
        self.offset += 4;
    }

    fn put_u64(&mut self, value: u64) {
        self.buf[self.offset..self.offset + 8].copy_from_slice(&value.to_le_bytes());
        self.offset += 8;
    }

    fn put_i64(&mut self, value: i64) {
        self.buf[self.offset..self.offset + 8].copy_from_slice(&value.to_le_bytes());
        self.offset += 8;
    }
}
