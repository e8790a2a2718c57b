//! Directory-entry nodes.
//!
//! ```text
//! +------------------+--------+
//! | common header    |24 bytes|
//! | key              |16 bytes| (parent ino, dent type, name hash)
//! | target ino       | 8 bytes|
//! | padding          | 1 byte | = 0
//! | type             | 1 byte | on-flash file type
//! | name_len         | 2 bytes|
//! | reserved         | 4 bytes| = 0
//! | name             | N bytes|
//! | NUL              | 1 byte |
//! +------------------+--------+
//! ```

use crate::key::{KEY_SIZE, Key, KeyType, decode_raw_key, name_hash};
use crate::{CH_SIZE, NodeType, init_common_header};
use lsfs_error::{LsfsError, Result};
use lsfs_types::{
    FileType, InodeNumber, MAX_NAME_LEN, ParseError, ensure_slice, read_le_u16, read_le_u64,
};

/// Directory-entry node size without the name and terminator.
pub const DENT_NODE_SIZE: usize = CH_SIZE + KEY_SIZE + 16;

const KEY_OFFSET: usize = CH_SIZE;
const TARGET_OFFSET: usize = KEY_OFFSET + KEY_SIZE;
const TYPE_OFFSET: usize = TARGET_OFFSET + 9;
const NLEN_OFFSET: usize = TARGET_OFFSET + 10;
const NAME_OFFSET: usize = DENT_NODE_SIZE;

/// Directory entry: `(parent, name) -> (target, kind)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DentNode {
    pub parent: InodeNumber,
    pub name: Vec<u8>,
    pub target: InodeNumber,
    pub kind: FileType,
}

impl DentNode {
    /// Encoded length of a directory-entry node with a `name_len`-byte name.
    #[must_use]
    pub const fn len_for_name(name_len: usize) -> usize {
        DENT_NODE_SIZE + name_len + 1
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        Self::len_for_name(self.name.len())
    }

    #[must_use]
    pub fn key(&self) -> Key {
        Key::dent(self.parent, &self.name)
    }

    /// Encode into `out`, which must be exactly [`encoded_len`](Self::encoded_len) bytes.
    pub fn encode_into(&self, out: &mut [u8]) -> Result<()> {
        validate_name(&self.name)?;
        if self.target.0 == 0 {
            return Err(LsfsError::InvalidState(
                "directory entry target cannot be inode 0".to_owned(),
            ));
        }
        let len = self.encoded_len();
        if out.len() != len {
            return Err(LsfsError::InvalidState(format!(
                "dent buffer is {} bytes, node needs {len}",
                out.len()
            )));
        }
        let len_u32 = u32::try_from(len)
            .map_err(|_| LsfsError::Format("dent node length exceeds u32".to_owned()))?;
        let nlen = u16::try_from(self.name.len())
            .map_err(|_| LsfsError::Format("dent name length exceeds u16".to_owned()))?;

        init_common_header(out, NodeType::Dent, len_u32);
        self.key().encode_into(&mut out[KEY_OFFSET..KEY_OFFSET + KEY_SIZE]);
        out[TARGET_OFFSET..TARGET_OFFSET + 8].copy_from_slice(&self.target.0.to_le_bytes());
        out[TARGET_OFFSET + 8] = 0;
        out[TYPE_OFFSET] = self.kind.to_dent_type();
        out[NLEN_OFFSET..NLEN_OFFSET + 2].copy_from_slice(&nlen.to_le_bytes());
        out[NLEN_OFFSET + 2..NAME_OFFSET].fill(0);
        out[NAME_OFFSET..NAME_OFFSET + self.name.len()].copy_from_slice(&self.name);
        out[len - 1] = 0;
        Ok(())
    }

    /// Decode a directory-entry node whose header has already been verified.
    pub fn decode(node: &[u8]) -> std::result::Result<Self, ParseError> {
        let raw = decode_raw_key(node, KEY_OFFSET)?;
        if raw.key_type != KeyType::Dent {
            return Err(ParseError::InvalidField {
                field: "key_type",
                reason: "dent node carries a non-dent key",
            });
        }
        let target = InodeNumber(read_le_u64(node, TARGET_OFFSET)?);
        if target.0 == 0 {
            return Err(ParseError::InvalidField {
                field: "inum",
                reason: "directory entry points at inode 0",
            });
        }
        let kind = FileType::from_dent_type(node[TYPE_OFFSET])?;
        let nlen = usize::from(read_le_u16(node, NLEN_OFFSET)?);
        if nlen == 0 || nlen > MAX_NAME_LEN {
            return Err(ParseError::InvalidField {
                field: "nlen",
                reason: "name length out of range",
            });
        }
        if node.len() != Self::len_for_name(nlen) {
            return Err(ParseError::InvalidField {
                field: "len",
                reason: "node length disagrees with name length",
            });
        }
        let with_nul = ensure_slice(node, NAME_OFFSET, nlen + 1)?;
        let (name, nul) = with_nul.split_at(nlen);
        if nul != [0] || name.contains(&0) {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "name is not NUL-terminated",
            });
        }
        if name_hash(name) != raw.hash {
            return Err(ParseError::InvalidField {
                field: "key",
                reason: "name hash mismatch",
            });
        }

        Ok(Self {
            parent: raw.ino,
            name: name.to_vec(),
            target,
            kind,
        })
    }
}

/// Reject names the on-flash format cannot carry.
pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(LsfsError::InvalidArgument(
            "directory entry name cannot be empty".to_owned(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(LsfsError::NameTooLong);
    }
    if name.contains(&0) || name.contains(&b'/') {
        return Err(LsfsError::InvalidArgument(
            "directory entry name contains NUL or '/'".to_owned(),
        ));
    }
    Ok(())
}
