#![forbid(unsafe_code)]
//! On-flash node layout.
//!
//! Every record in the log is a *node*: a 24-byte common header followed by a
//! type-specific body. Nodes are placed at 8-byte aligned offsets.
//!
//! ```text
//! Common header:
//! +------------------+--------+
//! | magic            | 4 bytes| = 0x0610_1831
//! | crc              | 4 bytes| CRC32c of bytes 8..len
//! | sqnum            | 8 bytes| global sequence number
//! | len              | 4 bytes| node length including this header
//! | node_type        | 1 byte | 0 = inode, 2 = directory entry
//! | group_type       | 1 byte | 0 = none, 1 = in group, 2 = last of group
//! | padding          | 2 bytes| = 0
//! +------------------+--------+
//! ```
//!
//! Nodes written as one group share commit atomicity: replay keeps a group
//! only when its `LAST_OF_GROUP` node is intact.

pub mod dent;
pub mod group;
pub mod inode;
pub mod key;

pub use dent::{DENT_NODE_SIZE, DentNode};
pub use group::{NodeGroup, NodeGroupBuilder, NodeRecord};
pub use inode::{INO_NODE_SIZE, InodeNode};
pub use key::{KEY_SIZE, Key, KeyType, name_hash};

use lsfs_types::{ParseError, SeqNum, ensure_slice, read_le_u32, read_le_u64};

/// Node magic number.
pub const NODE_MAGIC: u32 = 0x0610_1831;

/// Common header size in bytes.
pub const CH_SIZE: usize = 24;

/// Largest node the format accepts (header length field sanity bound).
pub const MAX_NODE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Inode,
    Dent,
}

impl NodeType {
    fn raw(self) -> u8 {
        match self {
            Self::Inode => 0,
            Self::Dent => 2,
        }
    }

    fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::Inode),
            2 => Ok(Self::Dent),
            _ => Err(ParseError::InvalidField {
                field: "node_type",
                reason: "unknown node type",
            }),
        }
    }
}

/// Commit-group membership of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupType {
    /// Standalone node, committed on its own.
    NoGroup,
    /// Member of a group whose last node has not been seen yet.
    InGroup,
    /// Closes the group; the whole group is committed with it.
    LastOfGroup,
}

impl GroupType {
    fn raw(self) -> u8 {
        match self {
            Self::NoGroup => 0,
            Self::InGroup => 1,
            Self::LastOfGroup => 2,
        }
    }

    fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::NoGroup),
            1 => Ok(Self::InGroup),
            2 => Ok(Self::LastOfGroup),
            _ => Err(ParseError::InvalidField {
                field: "group_type",
                reason: "unknown group type",
            }),
        }
    }
}

/// Parsed common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub sqnum: SeqNum,
    pub len: u32,
    pub node_type: NodeType,
    pub group_type: GroupType,
}

/// Write magic, length and node type; sqnum, group type and crc stay zero
/// until [`prepare_node`] seals the node.
pub(crate) fn init_common_header(out: &mut [u8], node_type: NodeType, len: u32) {
    out[0..4].copy_from_slice(&NODE_MAGIC.to_le_bytes());
    out[4..16].fill(0);
    out[16..20].copy_from_slice(&len.to_le_bytes());
    out[20] = node_type.raw();
    out[21] = GroupType::NoGroup.raw();
    out[22..24].fill(0);
}

/// Stamp sequence number and group type, then compute the CRC.
///
/// `node` must be exactly one encoded node (`len` bytes, no padding).
pub fn prepare_node(node: &mut [u8], sqnum: SeqNum, group: GroupType) {
    node[8..16].copy_from_slice(&sqnum.0.to_le_bytes());
    node[21] = group.raw();
    let crc = crc32c::crc32c(&node[8..]);
    node[4..8].copy_from_slice(&crc.to_le_bytes());
}

/// Parse and verify the common header of the node starting at `bytes[0]`.
///
/// Checks magic, length bounds and the CRC over the full node.
pub fn parse_common_header(bytes: &[u8]) -> Result<CommonHeader, ParseError> {
    let magic = read_le_u32(bytes, 0)?;
    if magic != NODE_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(NODE_MAGIC),
            actual: u64::from(magic),
        });
    }
    let len = read_le_u32(bytes, 16)?;
    let len_usize =
        usize::try_from(len).map_err(|_| ParseError::IntegerConversion { field: "len" })?;
    if !(CH_SIZE..=MAX_NODE_SIZE).contains(&len_usize) {
        return Err(ParseError::InvalidField {
            field: "len",
            reason: "node length out of range",
        });
    }
    let node = ensure_slice(bytes, 0, len_usize)?;
    let stored = read_le_u32(node, 4)?;
    let computed = crc32c::crc32c(&node[8..]);
    if stored != computed {
        return Err(ParseError::ChecksumMismatch { stored, computed });
    }

    Ok(CommonHeader {
        sqnum: SeqNum(read_le_u64(node, 8)?),
        len,
        node_type: NodeType::from_raw(node[20])?,
        group_type: GroupType::from_raw(node[21])?,
    })
}

/// A decoded node body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Dent(DentNode),
    Inode(InodeNode),
}

impl Node {
    /// Index key under which this node is stored.
    #[must_use]
    pub fn key(&self) -> Key {
        match self {
            Self::Dent(dent) => dent.key(),
            Self::Inode(inode) => Key::inode(inode.ino),
        }
    }
}

/// A verified node: header plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedNode {
    pub header: CommonHeader,
    pub node: Node,
}

/// Decode and verify the node starting at `bytes[0]`.
pub fn decode_node(bytes: &[u8]) -> Result<DecodedNode, ParseError> {
    let header = parse_common_header(bytes)?;
    let node_bytes = &bytes[..header.len as usize];
    let node = match header.node_type {
        NodeType::Dent => Node::Dent(DentNode::decode(node_bytes)?),
        NodeType::Inode => Node::Inode(InodeNode::decode(node_bytes)?),
    };
    Ok(DecodedNode { header, node })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsfs_types::{FileType, InodeNumber};

    fn sealed_dent() -> Vec<u8> {
        let dent = DentNode {
            parent: InodeNumber(1),
            name: b"a".to_vec(),
            target: InodeNumber(10),
            kind: FileType::RegularFile,
        };
        let mut buf = vec![0_u8; dent.encoded_len()];
        dent.encode_into(&mut buf).expect("encode");
        prepare_node(&mut buf, SeqNum(9), GroupType::NoGroup);
        buf
    }

    #[test]
    fn header_round_trips_through_prepare() {
        let buf = sealed_dent();
        let header = parse_common_header(&buf).expect("header");
        assert_eq!(header.sqnum, SeqNum(9));
        assert_eq!(header.node_type, NodeType::Dent);
        assert_eq!(header.group_type, GroupType::NoGroup);
        assert_eq!(header.len as usize, buf.len());
    }

    #[test]
    fn crc_covers_name_bytes() {
        let mut buf = sealed_dent();
        let last = buf.len() - 2;
        buf[last] ^= 0x01;
        assert!(matches!(
            parse_common_header(&buf),
            Err(ParseError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn erased_flash_is_not_a_node() {
        let erased = [0xFF_u8; 64];
        assert!(matches!(
            parse_common_header(&erased),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn truncated_node_is_insufficient_data() {
        let buf = sealed_dent();
        assert!(matches!(
            parse_common_header(&buf[..buf.len() - 1]),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn decode_node_dispatches_on_type() {
        let buf = sealed_dent();
        let decoded = decode_node(&buf).expect("decode");
        assert_eq!(decoded.node.key(), Key::dent(InodeNumber(1), b"a"));
    }
}
