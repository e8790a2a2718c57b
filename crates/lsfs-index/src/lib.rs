#![forbid(unsafe_code)]
//! Ordered index from keys to flash locations.
//!
//! The index is derived state. It is rebuilt from the log on mount and
//! updated after each successful log write; an entry never points at bytes
//! that did not reach flash.
//!
//! Directory entries of one parent are contiguous in key order:
//!
//! ```text
//! (1, INODE)            -> 0:0+160
//! (1, DENT, h("a"), a)  -> 2:64+58
//! (1, DENT, h("b"), b)  -> 2:128+58
//! (2, INODE)            -> 2:192+160
//! ```

use lsfs_error::Result;
use lsfs_node::{Key, KeyType};
use lsfs_types::{InodeNumber, NodeLocation};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Key to location map shared by every filesystem operation.
///
/// Implementations are internally synchronized.
pub trait NodeIndex: Send + Sync {
    /// Point `key` at `loc`, replacing any previous location.
    fn add(&self, key: Key, loc: NodeLocation) -> Result<()>;

    fn lookup(&self, key: &Key) -> Option<NodeLocation>;

    /// All directory entries of `parent` in key order.
    fn dents(&self, parent: InodeNumber) -> Vec<(Key, NodeLocation)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory tree node cache: a `BTreeMap` behind a reader-writer lock.
#[derive(Debug, Default)]
pub struct Tnc {
    map: RwLock<BTreeMap<Key, NodeLocation>>,
}

impl Tnc {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeIndex for Tnc {
    fn add(&self, key: Key, loc: NodeLocation) -> Result<()> {
        trace!(
            target: "lsfs::index",
            ino = key.ino().0,
            key_type = ?key.key_type(),
            hash = key.hash(),
            %loc,
            "tnc_add"
        );
        let previous = self.map.write().insert(key, loc);
        if let Some(previous) = previous {
            debug!(target: "lsfs::index", %previous, %loc, "tnc_replace");
        }
        Ok(())
    }

    fn lookup(&self, key: &Key) -> Option<NodeLocation> {
        self.map.read().get(key).copied()
    }

    fn dents(&self, parent: InodeNumber) -> Vec<(Key, NodeLocation)> {
        let map = self.map.read();
        map.range(Key::dent_range_start(parent)..)
            .take_while(|(key, _)| key.ino() == parent && key.key_type() == KeyType::Dent)
            .map(|(key, loc)| (key.clone(), *loc))
            .collect()
    }

    fn len(&self) -> usize {
        self.map.read().len()
    }
}
