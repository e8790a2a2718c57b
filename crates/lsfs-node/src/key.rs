//! Index keys and their 16-byte on-flash encoding.
//!
//! ```text
//! +------------------+--------+
//! | ino              | 8 bytes|
//! | type<<29 | hash  | 4 bytes|
//! | reserved         | 4 bytes| = 0
//! +------------------+--------+
//! ```
//!
//! Directory-entry keys keep the full name in memory so the index never has
//! to resolve hash collisions by reading nodes back from flash. Only the
//! 29-bit name hash reaches the flash key; the name itself lives in the node.

use lsfs_types::{InodeNumber, ParseError, read_le_u32, read_le_u64};

/// Encoded key size in bytes.
pub const KEY_SIZE: usize = 16;

const KEY_HASH_BITS: u32 = 29;
const KEY_HASH_MASK: u32 = (1 << KEY_HASH_BITS) - 1;

/// Hash values 0..=2 are reserved for lookup cursors.
const KEY_HASH_RESERVED: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyType {
    Inode,
    Dent,
}

impl KeyType {
    fn raw(self) -> u32 {
        match self {
            Self::Inode => 0,
            Self::Dent => 2,
        }
    }

    fn from_raw(raw: u32) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::Inode),
            2 => Ok(Self::Dent),
            _ => Err(ParseError::InvalidField {
                field: "key_type",
                reason: "unknown key type",
            }),
        }
    }
}

/// Typed, totally ordered index key.
///
/// Ordering is `(ino, type, hash, name)`, so all entries of one directory are
/// contiguous and sort after that directory's own inode key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    ino: InodeNumber,
    key_type: KeyType,
    hash: u32,
    name: Vec<u8>,
}

impl Key {
    #[must_use]
    pub fn inode(ino: InodeNumber) -> Self {
        Self {
            ino,
            key_type: KeyType::Inode,
            hash: 0,
            name: Vec::new(),
        }
    }

    #[must_use]
    pub fn dent(parent: InodeNumber, name: &[u8]) -> Self {
        Self {
            ino: parent,
            key_type: KeyType::Dent,
            hash: name_hash(name),
            name: name.to_vec(),
        }
    }

    /// Smallest possible directory-entry key under `parent`.
    #[must_use]
    pub fn dent_range_start(parent: InodeNumber) -> Self {
        Self {
            ino: parent,
            key_type: KeyType::Dent,
            hash: 0,
            name: Vec::new(),
        }
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    #[must_use]
    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    #[must_use]
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Entry name for directory-entry keys, empty for inode keys.
    #[must_use]
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Write the 16-byte flash form into `out[..KEY_SIZE]`.
    pub(crate) fn encode_into(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.ino.0.to_le_bytes());
        let word = (self.key_type.raw() << KEY_HASH_BITS) | (self.hash & KEY_HASH_MASK);
        out[8..12].copy_from_slice(&word.to_le_bytes());
        out[12..16].fill(0);
    }
}

/// Raw fields of an encoded key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawKey {
    pub ino: InodeNumber,
    pub key_type: KeyType,
    pub hash: u32,
}

pub(crate) fn decode_raw_key(bytes: &[u8], offset: usize) -> Result<RawKey, ParseError> {
    let ino = InodeNumber(read_le_u64(bytes, offset)?);
    let word = read_le_u32(bytes, offset + 8)?;
    Ok(RawKey {
        ino,
        key_type: KeyType::from_raw(word >> KEY_HASH_BITS)?,
        hash: word & KEY_HASH_MASK,
    })
}

/// r5 string hash folded into the 29-bit key hash space.
#[must_use]
pub fn name_hash(name: &[u8]) -> u32 {
    let mut a: u32 = 0;
    for &byte in name {
        // Sign-extend like a C `signed char`.
        let c = u32::from_le_bytes(i32::from(i8::from_le_bytes([byte])).to_le_bytes());
        a = a.wrapping_add(c << 4);
        a = a.wrapping_add(c >> 4);
        a = a.wrapping_mul(11);
    }
    let hash = a & KEY_HASH_MASK;
    if hash < KEY_HASH_RESERVED {
        hash + KEY_HASH_RESERVED
    } else {
        hash
    }
}
