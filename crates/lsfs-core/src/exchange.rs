//! Atomic exchange of two directory entries (`RENAME_EXCHANGE`).
//!
//! The exchange writes one node group to the base head:
//!
//! ```text
//! +---------------------+---------------------+-------------+-------------+
//! | dent (new_dir,      | dent (old_dir,      | inode       | inode       |
//! |   new_name) ->      |   old_name) ->      | old_dir     | new_dir     |
//! |   old target        |   new target        |             | (if other)  |
//! +---------------------+---------------------+-------------+-------------+
//!   IN_GROUP              IN_GROUP              IN_GROUP      LAST_OF_GROUP
//! ```
//!
//! Replay commits the group only when its last node is present, so after a
//! crash either both names point at their new targets or neither does.
//! The target inodes are not in the group: only their ctime changes, and
//! they stay dirty until written back by `fsync` or `sync`.

use crate::fs::Filesystem;
use crate::inode::{DirEntry, Inode};
use crate::lock::{ExchangeGuard, Role, prepare_exchange};
use lsfs_error::{LsfsError, Result};
use lsfs_node::{DentNode, NodeGroupBuilder};
use lsfs_types::{HeadId, INODE_FL_DIRSYNC, align8};
use tracing::debug;

/// Resolve both names, lock everything and exchange.
///
/// The caller holds the filesystem rename lock, so neither name can be
/// moved between resolution and locking.
pub(crate) fn rename_exchange(
    fs: &Filesystem,
    old_parent: &Inode,
    old_name: &[u8],
    new_parent: &Inode,
    new_name: &[u8],
) -> Result<()> {
    let old_entry = resolve(fs, old_parent, old_name)?;
    let new_entry = resolve(fs, new_parent, new_name)?;
    if old_entry.ino == new_entry.ino {
        debug!(
            target: "lsfs::exchange",
            ino = old_entry.ino.0,
            "exchange_same_inode"
        );
        return Ok(());
    }
    for entry in [&old_entry, &new_entry] {
        if entry.ino == old_parent.ino() || entry.ino == new_parent.ino() {
            return Err(LsfsError::InvalidArgument(format!(
                "entry {} is one of the directories being modified",
                entry.name_str()
            )));
        }
    }

    let old_target = fs.inode(old_entry.ino)?;
    let new_target = fs.inode(new_entry.ino)?;
    let guard = prepare_exchange(old_parent, &old_target, new_parent, &new_target);
    let durable = fs.options().dirsync
        || [Role::OldParent, Role::NewParent]
            .into_iter()
            .any(|role| guard.meta(role).flags & INODE_FL_DIRSYNC != 0);
    exchange(fs, guard, &old_entry, &new_entry, durable)
}

fn resolve(fs: &Filesystem, parent: &Inode, name: &[u8]) -> Result<DirEntry> {
    fs.lookup_dent(parent.ino(), name)?.ok_or_else(|| {
        LsfsError::NotFound(format!(
            "{} in directory {}",
            String::from_utf8_lossy(name),
            parent.ino()
        ))
    })
}

/// Journal an exchange whose participants are locked by `guard`.
///
/// Nothing reaches the log or the index unless every step up to the write
/// succeeds. The guard is disarmed only once the write (and the sync of a
/// durable exchange) has landed; any earlier error drops it armed and the
/// in-memory metadata is restored.
pub(crate) fn exchange(
    fs: &Filesystem,
    mut guard: ExchangeGuard<'_>,
    old_entry: &DirEntry,
    new_entry: &DirEntry,
    durable: bool,
) -> Result<()> {
    let journal = fs.journal();
    let two_parents = guard.two_parents();
    let old_dir = guard.ino(Role::OldParent);
    let new_dir = guard.ino(Role::NewParent);

    for role in [Role::OldParent, Role::NewParent] {
        let data_len = guard.meta(role).data.len();
        if data_len != 0 {
            return Err(LsfsError::InvalidState(format!(
                "directory {} carries {data_len} bytes of inline data",
                guard.ino(role)
            )));
        }
    }

    let moved_old = DentNode {
        parent: new_dir,
        name: new_entry.name.clone(),
        target: guard.ino(Role::OldTarget),
        kind: guard.inode(Role::OldTarget).kind(),
    };
    let moved_new = DentNode {
        parent: old_dir,
        name: old_entry.name.clone(),
        target: guard.ino(Role::NewTarget),
        kind: guard.inode(Role::NewTarget).kind(),
    };
    let mut parents = vec![guard.meta(Role::OldParent).to_node(old_dir)];
    if two_parents {
        parents.push(guard.meta(Role::NewParent).to_node(new_dir));
    }

    let total = align8(moved_old.encoded_len())
        + align8(moved_new.encoded_len())
        + parents
            .iter()
            .map(|node| align8(node.encoded_len()))
            .sum::<usize>();
    let mut builder = NodeGroupBuilder::with_capacity(total)?;
    let mut writer = journal.reserve_space(HeadId::BASE, total)?;
    builder.push_dent(&moved_old)?;
    builder.push_dent(&moved_new)?;
    for node in &parents {
        builder.push_inode(node)?;
    }
    let group = builder.seal(|| journal.next_sqnum())?;

    let (lnum, offs) = writer.write(group.bytes(), durable)?;
    guard.disarm();
    if !durable {
        writer.add_dirty_inode(old_dir);
        if two_parents {
            writer.add_dirty_inode(new_dir);
        }
    }
    writer.release();

    fs.index_group(&group, lnum, offs)?;

    guard.meta_mut(Role::OldParent).dirty = false;
    guard.meta_mut(Role::NewParent).dirty = false;
    debug!(
        target: "lsfs::exchange",
        old_dir = old_dir.0,
        old_name = %old_entry.name_str(),
        new_dir = new_dir.0,
        new_name = %new_entry.name_str(),
        two_parents,
        durable,
        lnum,
        offs,
        len = total,
        "exchange_committed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::fs::{Filesystem, RenameFlags};
    use crate::options::MountOptions;
    use lsfs_error::LsfsError;
    use lsfs_journal::MemFlash;
    use lsfs_types::{FileType, InodeNumber};
    use std::sync::Arc;

    fn tree() -> (Filesystem, InodeNumber, InodeNumber) {
        let flash = Arc::new(MemFlash::new(4096, 16).expect("flash"));
        let fs = Filesystem::format(flash, MountOptions::default()).expect("format");
        let d1 = fs
            .create(InodeNumber::ROOT, b"d1", FileType::Directory, 0o755)
            .expect("d1")
            .ino;
        let d2 = fs
            .create(InodeNumber::ROOT, b"d2", FileType::Directory, 0o755)
            .expect("d2")
            .ino;
        fs.create(d1, b"a", FileType::RegularFile, 0o644).expect("a");
        fs.create(d2, b"b", FileType::Directory, 0o755).expect("b");
        (fs, d1, d2)
    }

    #[test]
    fn parent_with_inline_data_is_refused_without_side_effects() {
        let (fs, d1, d2) = tree();
        fs.inode(d1).expect("d1").lock().data = b"x".to_vec();
        let before_d1 = fs.getattr(d1).expect("d1");
        let before_d2 = fs.getattr(d2).expect("d2");
        let used = fs.space_stats().used_bytes;

        assert!(matches!(
            fs.rename(d1, b"a", d2, b"b", RenameFlags::EXCHANGE),
            Err(LsfsError::InvalidState(_))
        ));
        assert_eq!(fs.getattr(d1).expect("d1"), before_d1);
        assert_eq!(fs.getattr(d2).expect("d2"), before_d2);
        assert_eq!(fs.space_stats().used_bytes, used);
        assert!(!fs.inode(d1).expect("d1").lock().dirty);
    }

    #[test]
    fn exchanging_a_parent_is_rejected() {
        let (fs, d1, _d2) = tree();
        assert!(matches!(
            fs.rename(InodeNumber::ROOT, b"d1", d1, b"a", RenameFlags::EXCHANGE),
            Err(LsfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn parents_are_clean_and_targets_dirty_after_exchange() {
        let (fs, d1, d2) = tree();
        let a = fs.lookup(d1, b"a").expect("a").ino;
        fs.rename(d1, b"a", d2, b"b", RenameFlags::EXCHANGE)
            .expect("exchange");
        assert!(!fs.inode(d1).expect("d1").lock().dirty);
        assert!(!fs.inode(d2).expect("d2").lock().dirty);
        assert!(fs.inode(a).expect("a").lock().dirty);
        assert!(fs.journal().is_inode_dirty(d1));
    }
}
