//! Locking and timestamp policy of the exchange.
//!
//! Every distinct participant (both parents, both targets) is locked in
//! ascending inode-number order, so two exchanges over overlapping inodes
//! can never wait on each other in a cycle. A parent shared by both entries
//! is locked once.
//!
//! Under the locks one clock sample `now` becomes the ctime of both targets
//! and the mtime and ctime of both parents. When a directory trades places
//! with a non-directory across two parents, the parent receiving the
//! directory gains a link (its `..`) and the other parent loses one.
//!
//! The guard saves every participant's metadata before touching it. Until
//! [`ExchangeGuard::disarm`] is called, dropping the guard puts the saved
//! metadata back while the locks are still held, so an exchange that fails
//! before reaching the log leaves no trace in memory.

use crate::inode::{Inode, InodeMeta};
use lsfs_types::{InodeNumber, Timespec};
use parking_lot::MutexGuard;

/// Participant of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    OldParent,
    NewParent,
    OldTarget,
    NewTarget,
}

impl Role {
    const ALL: [Self; 4] = [
        Self::OldParent,
        Self::NewParent,
        Self::OldTarget,
        Self::NewTarget,
    ];

    fn idx(self) -> usize {
        match self {
            Self::OldParent => 0,
            Self::NewParent => 1,
            Self::OldTarget => 2,
            Self::NewTarget => 3,
        }
    }
}

struct Locked<'a> {
    meta: MutexGuard<'a, InodeMeta>,
    saved: InodeMeta,
}

/// Locks on every participant of one exchange.
pub struct ExchangeGuard<'a> {
    inodes: [&'a Inode; 4],
    /// Role index -> position in `locked`.
    slots: [usize; 4],
    locked: Vec<Locked<'a>>,
    now: Timespec,
    armed: bool,
}

impl std::fmt::Debug for ExchangeGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeGuard")
            .field(
                "inodes",
                &self.inodes.iter().map(|i| i.ino().0).collect::<Vec<_>>(),
            )
            .field("locks", &self.locked.len())
            .field("now", &self.now)
            .field("armed", &self.armed)
            .finish()
    }
}

/// Lock the participants and apply the timestamp and link-count policy.
pub fn prepare_exchange<'a>(
    old_parent: &'a Inode,
    old_target: &'a Inode,
    new_parent: &'a Inode,
    new_target: &'a Inode,
) -> ExchangeGuard<'a> {
    let inodes = [old_parent, new_parent, old_target, new_target];
    let mut order: Vec<(InodeNumber, usize)> = inodes
        .iter()
        .enumerate()
        .map(|(role, inode)| (inode.ino(), role))
        .collect();
    order.sort_unstable();

    let mut slots = [0_usize; 4];
    let mut locked: Vec<Locked<'a>> = Vec::with_capacity(4);
    let mut last = None;
    for (ino, role) in order {
        if last != Some(ino) {
            let meta = inodes[role].lock();
            locked.push(Locked {
                saved: meta.clone(),
                meta,
            });
            last = Some(ino);
        }
        slots[role] = locked.len() - 1;
    }

    let mut guard = ExchangeGuard {
        inodes,
        slots,
        locked,
        now: Timespec::now(),
        armed: true,
    };
    guard.apply_policy();

    tracing::trace!(
        target: "lsfs::exchange",
        locks = guard.locked.len(),
        parent_locks = guard.parent_lock_count(),
        "exchange_locked"
    );
    guard
}

impl ExchangeGuard<'_> {
    fn apply_policy(&mut self) {
        let now = self.now;
        for role in [Role::OldTarget, Role::NewTarget] {
            let meta = self.meta_mut(role);
            meta.ctime = now;
            meta.dirty = true;
        }
        for role in [Role::OldParent, Role::NewParent] {
            let meta = self.meta_mut(role);
            meta.mtime = now;
            meta.ctime = now;
            meta.dirty = true;
        }

        if !self.two_parents() {
            return;
        }
        let old_is_dir = self.inode(Role::OldTarget).kind().is_dir();
        let new_is_dir = self.inode(Role::NewTarget).kind().is_dir();
        let (gains, loses) = match (old_is_dir, new_is_dir) {
            (true, false) => (Role::NewParent, Role::OldParent),
            (false, true) => (Role::OldParent, Role::NewParent),
            _ => return,
        };
        let meta = self.meta_mut(gains);
        meta.nlink = meta.nlink.saturating_add(1);
        let meta = self.meta_mut(loses);
        meta.nlink = meta.nlink.saturating_sub(1);
    }

    #[must_use]
    pub fn inode(&self, role: Role) -> &Inode {
        self.inodes[role.idx()]
    }

    #[must_use]
    pub fn ino(&self, role: Role) -> InodeNumber {
        self.inode(role).ino()
    }

    #[must_use]
    pub fn meta(&self, role: Role) -> &InodeMeta {
        &self.locked[self.slots[role.idx()]].meta
    }

    pub fn meta_mut(&mut self, role: Role) -> &mut InodeMeta {
        let slot = self.slots[role.idx()];
        &mut self.locked[slot].meta
    }

    /// Whether the two entries live in different directories.
    #[must_use]
    pub fn two_parents(&self) -> bool {
        self.slots[Role::OldParent.idx()] != self.slots[Role::NewParent.idx()]
    }

    /// Number of distinct inodes locked.
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.locked.len()
    }

    /// Number of distinct parent directories locked (1 or 2).
    #[must_use]
    pub fn parent_lock_count(&self) -> usize {
        if self.two_parents() { 2 } else { 1 }
    }

    /// The single timestamp applied to every participant.
    #[must_use]
    pub fn now(&self) -> Timespec {
        self.now
    }

    /// Keep the in-memory changes even if the exchange later fails.
    ///
    /// Called once the log write has been attempted: from then on memory
    /// follows the log, not the saved snapshot.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for locked in &mut self.locked {
            std::mem::swap(&mut *locked.meta, &mut locked.saved);
        }
        tracing::debug!(
            target: "lsfs::exchange",
            inodes = ?Role::ALL.map(|role| self.inodes[role.idx()].ino().0),
            "exchange_metadata_restored"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsfs_types::{FileType, SeqNum};
    use std::sync::Arc;

    fn inode(ino: u64, kind: FileType, nlink: u32) -> Inode {
        Inode::new(
            InodeNumber(ino),
            kind,
            InodeMeta {
                creat_sqnum: SeqNum(ino),
                size: 0,
                atime: Timespec::ZERO,
                ctime: Timespec::ZERO,
                mtime: Timespec::ZERO,
                nlink,
                uid: 0,
                gid: 0,
                mode: kind.mode_bits() | 0o755,
                flags: 0,
                xattr_cnt: 0,
                xattr_size: 0,
                xattr_names: 0,
                data: Vec::new(),
                dirty: false,
            },
        )
    }

    #[test]
    fn shared_parent_is_locked_once() {
        let dir = inode(1, FileType::Directory, 3);
        let a = inode(10, FileType::RegularFile, 1);
        let b = inode(20, FileType::Directory, 2);
        let guard = prepare_exchange(&dir, &a, &dir, &b);
        assert!(!guard.two_parents());
        assert_eq!(guard.parent_lock_count(), 1);
        assert_eq!(guard.lock_count(), 3);
        assert_eq!(guard.meta(Role::OldParent).nlink, 3, "same parent keeps nlink");
    }

    #[test]
    fn one_timestamp_for_every_participant() {
        let d1 = inode(2, FileType::Directory, 2);
        let d2 = inode(3, FileType::Directory, 2);
        let a = inode(10, FileType::RegularFile, 1);
        let b = inode(20, FileType::RegularFile, 1);
        let guard = prepare_exchange(&d1, &a, &d2, &b);
        let now = guard.now();
        assert_eq!(guard.meta(Role::OldTarget).ctime, now);
        assert_eq!(guard.meta(Role::NewTarget).ctime, now);
        for parent in [Role::OldParent, Role::NewParent] {
            assert_eq!(guard.meta(parent).mtime, now);
            assert_eq!(guard.meta(parent).ctime, now);
        }
        assert_eq!(guard.meta(Role::OldTarget).mtime, Timespec::ZERO);
    }

    #[test]
    fn directory_moving_into_new_parent_adds_a_link_there() {
        let d1 = inode(2, FileType::Directory, 2);
        let d2 = inode(3, FileType::Directory, 3);
        let sub = inode(10, FileType::Directory, 2);
        let file = inode(20, FileType::RegularFile, 1);
        let guard = prepare_exchange(&d1, &sub, &d2, &file);
        assert_eq!(guard.meta(Role::OldParent).nlink, 1);
        assert_eq!(guard.meta(Role::NewParent).nlink, 4);
    }

    #[test]
    fn same_kinds_leave_links_alone() {
        let d1 = inode(2, FileType::Directory, 3);
        let d2 = inode(3, FileType::Directory, 3);
        let x = inode(10, FileType::Directory, 2);
        let y = inode(20, FileType::Directory, 2);
        let guard = prepare_exchange(&d1, &x, &d2, &y);
        assert_eq!(guard.meta(Role::OldParent).nlink, 3);
        assert_eq!(guard.meta(Role::NewParent).nlink, 3);
    }

    #[test]
    fn armed_guard_restores_on_drop() {
        let d1 = inode(2, FileType::Directory, 2);
        let d2 = inode(3, FileType::Directory, 3);
        let file = inode(10, FileType::RegularFile, 1);
        let sub = inode(20, FileType::Directory, 2);
        drop(prepare_exchange(&d1, &file, &d2, &sub));
        assert_eq!(d1.lock().nlink, 2);
        assert_eq!(d2.lock().nlink, 3);
        assert_eq!(file.lock().ctime, Timespec::ZERO);
        assert!(!d1.lock().dirty);

        let mut guard = prepare_exchange(&d1, &file, &d2, &sub);
        guard.disarm();
        drop(guard);
        assert_eq!(d1.lock().nlink, 3);
        assert_eq!(d2.lock().nlink, 2);
        assert!(file.lock().dirty);
    }

    #[test]
    fn opposite_exchanges_do_not_deadlock() {
        let d1 = Arc::new(inode(2, FileType::Directory, 2));
        let d2 = Arc::new(inode(3, FileType::Directory, 2));
        let a = Arc::new(inode(10, FileType::RegularFile, 1));
        let b = Arc::new(inode(20, FileType::RegularFile, 1));

        let handles: Vec<_> = (0..2)
            .map(|n| {
                let (d1, d2, a, b) = (d1.clone(), d2.clone(), a.clone(), b.clone());
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let mut guard = if n == 0 {
                            prepare_exchange(&d1, &a, &d2, &b)
                        } else {
                            prepare_exchange(&d2, &b, &d1, &a)
                        };
                        guard.disarm();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        assert_eq!(d1.lock().nlink, 2);
    }
}
