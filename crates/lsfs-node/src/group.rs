//! Packing several nodes into one contiguous, pre-sized write buffer.
//!
//! The caller computes the total length first (sum of `align8(node_len)`),
//! allocates once, then appends typed records. Each push returns the offset
//! of the record inside the buffer so the caller can later turn
//! `(lnum, offs + record.offset)` into an index location.
//!
//! ```text
//! offset 0                 align8(d1)          align8(d1)+align8(d2)
//! +--------------+---------+--------------+----+------------------+
//! | dent 1       | pad     | dent 2       |pad | parent inode ... |
//! +--------------+---------+--------------+----+------------------+
//! ```
//!
//! Sealing stamps sequence numbers in record order and marks the records as
//! one commit group: every record but the last is `IN_GROUP`, the last one
//! is `LAST_OF_GROUP`. A builder holding a single record seals it as
//! `NO_GROUP`.

use crate::{DentNode, GroupType, InodeNode, Key, prepare_node};
use lsfs_error::{LsfsError, Result};
use lsfs_types::{SeqNum, align8};

/// One node inside a [`NodeGroup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub key: Key,
    /// Byte offset of the node inside the group buffer.
    pub offset: usize,
    /// Unpadded node length.
    pub len: usize,
    /// Zero until the group is sealed.
    pub sqnum: SeqNum,
}

/// Append-only builder over a buffer allocated once up front.
#[derive(Debug)]
pub struct NodeGroupBuilder {
    buf: Vec<u8>,
    capacity: usize,
    records: Vec<NodeRecord>,
}

impl NodeGroupBuilder {
    /// Allocate a buffer of exactly `total` bytes.
    ///
    /// Allocation failure is reported as [`LsfsError::OutOfMemory`] instead of
    /// aborting.
    pub fn with_capacity(total: usize) -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(total)
            .map_err(|_| LsfsError::OutOfMemory)?;
        Ok(Self {
            buf,
            capacity: total,
            records: Vec::with_capacity(4),
        })
    }

    /// Append a directory-entry node; returns its offset.
    pub fn push_dent(&mut self, dent: &DentNode) -> Result<usize> {
        self.push_with(dent.encoded_len(), dent.key(), |out| dent.encode_into(out))
    }

    /// Append an inode node; returns its offset.
    pub fn push_inode(&mut self, inode: &InodeNode) -> Result<usize> {
        self.push_with(inode.encoded_len(), Key::inode(inode.ino), |out| {
            inode.encode_into(out)
        })
    }

    fn push_with(
        &mut self,
        len: usize,
        key: Key,
        encode: impl FnOnce(&mut [u8]) -> Result<()>,
    ) -> Result<usize> {
        let offset = self.buf.len();
        let end = offset
            .checked_add(align8(len))
            .filter(|end| *end <= self.capacity)
            .ok_or_else(|| {
                LsfsError::InvalidState(format!(
                    "node of {len} bytes at offset {offset} overflows group buffer of {} bytes",
                    self.capacity
                ))
            })?;
        self.buf.resize(offset + len, 0);
        if let Err(err) = encode(&mut self.buf[offset..offset + len]) {
            self.buf.truncate(offset);
            return Err(err);
        }
        self.buf.resize(end, 0);
        self.records.push(NodeRecord {
            key,
            offset,
            len,
            sqnum: SeqNum(0),
        });
        Ok(offset)
    }

    /// Bytes appended so far, padding included.
    #[must_use]
    pub fn filled(&self) -> usize {
        self.buf.len()
    }

    /// Stamp group types and sequence numbers, then compute every CRC.
    ///
    /// The buffer must be filled to exactly the capacity it was created with,
    /// so the sealed group always matches the space reserved for it.
    pub fn seal(mut self, mut next_sqnum: impl FnMut() -> SeqNum) -> Result<NodeGroup> {
        if self.records.is_empty() {
            return Err(LsfsError::InvalidState("empty node group".to_owned()));
        }
        if self.buf.len() != self.capacity {
            return Err(LsfsError::InvalidState(format!(
                "node group filled {} of {} bytes",
                self.buf.len(),
                self.capacity
            )));
        }
        let last = self.records.len() - 1;
        for (idx, record) in self.records.iter_mut().enumerate() {
            let group = if last == 0 {
                GroupType::NoGroup
            } else if idx == last {
                GroupType::LastOfGroup
            } else {
                GroupType::InGroup
            };
            record.sqnum = next_sqnum();
            prepare_node(
                &mut self.buf[record.offset..record.offset + record.len],
                record.sqnum,
                group,
            );
        }

        tracing::trace!(
            target: "lsfs::node",
            nodes = self.records.len(),
            bytes = self.buf.len(),
            first_sqnum = self.records[0].sqnum.0,
            "node_group_sealed"
        );

        Ok(NodeGroup {
            bytes: self.buf,
            records: self.records,
        })
    }
}

/// Sealed group, ready to be written in one device write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeGroup {
    bytes: Vec<u8>,
    records: Vec<NodeRecord>,
}

impl NodeGroup {
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn records(&self) -> &[NodeRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
