//! Mounted filesystem: format, mount/replay, namespace operations.

use crate::exchange;
use crate::inode::{DirEntry, Inode, InodeAttr, InodeMeta};
use crate::options::MountOptions;
use bitflags::bitflags;
use lsfs_error::{LsfsError, Result};
use lsfs_index::{NodeIndex, Tnc};
use lsfs_journal::{
    FlashDevice, FsState, Journal, SpaceStats, StateSwitch, corruption, scan,
};
use lsfs_node::{
    DentNode, INO_NODE_SIZE, InodeNode, Key, Node, NodeGroup, NodeGroupBuilder, decode_node,
    dent::validate_name,
};
use lsfs_types::{
    FileType, HeadId, INODE_FL_DIRSYNC, InodeNumber, NodeLocation, Timespec, align8,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

bitflags! {
    /// `renameat2` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RenameFlags: u32 {
        /// Fail if the destination exists.
        const NOREPLACE = 1 << 0;
        /// Atomically swap source and destination.
        const EXCHANGE = 1 << 1;
        /// Leave a whiteout at the source.
        const WHITEOUT = 1 << 2;
    }
}

/// A mounted filesystem.
pub struct Filesystem {
    journal: Journal,
    index: Arc<dyn NodeIndex>,
    inodes: Mutex<HashMap<InodeNumber, Arc<Inode>>>,
    next_ino: AtomicU64,
    /// Serializes namespace moves, like the VFS rename mutex.
    rename_lock: Mutex<()>,
    options: MountOptions,
}

impl fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filesystem")
            .field("journal", &self.journal)
            .field("indexed", &self.index.len())
            .field("cached_inodes", &self.inodes.lock().len())
            .field("next_ino", &self.next_ino.load(Ordering::Relaxed))
            .field("options", &self.options)
            .finish()
    }
}

impl Filesystem {
    fn assemble(
        journal: Journal,
        index: Arc<dyn NodeIndex>,
        options: MountOptions,
        next_ino: InodeNumber,
    ) -> Self {
        Self {
            journal,
            index,
            inodes: Mutex::new(HashMap::new()),
            next_ino: AtomicU64::new(next_ino.0),
            rename_lock: Mutex::new(()),
            options,
        }
    }

    /// Erase `device` and write an empty root directory.
    pub fn format(device: Arc<dyn FlashDevice>, options: MountOptions) -> Result<Self> {
        options.validate()?;
        if options.read_only {
            return Err(LsfsError::ReadOnly);
        }
        for lnum in 0..device.leb_count() {
            device.erase(lnum)?;
        }
        let (leb_size, leb_count) = (device.leb_size(), device.leb_count());
        let journal = Journal::new(
            device,
            Arc::new(StateSwitch::new(false)),
            options.journal_heads,
        )?;
        let fs = Self::assemble(
            journal,
            Arc::new(Tnc::new()),
            options,
            InodeNumber(InodeNumber::ROOT.0 + 1),
        );

        let now = Timespec::now();
        let root = Arc::new(Inode::new(
            InodeNumber::ROOT,
            FileType::Directory,
            InodeMeta {
                creat_sqnum: fs.journal.next_sqnum(),
                size: INO_NODE_SIZE as u64,
                atime: now,
                ctime: now,
                mtime: now,
                nlink: 2,
                uid: 0,
                gid: 0,
                mode: FileType::Directory.mode_bits() | 0o755,
                flags: 0,
                xattr_cnt: 0,
                xattr_size: 0,
                xattr_names: 0,
                data: Vec::new(),
                dirty: false,
            },
        ));
        let node = root.lock().to_node(InodeNumber::ROOT);
        fs.commit_group(&[], &[node], true, &[])?;
        fs.inodes.lock().insert(InodeNumber::ROOT, root);

        info!(
            target: "lsfs::mount",
            leb_size,
            leb_count,
            heads = fs.options.journal_heads,
            "format_complete"
        );
        Ok(fs)
    }

    /// Mount by replaying the log into a fresh in-memory index.
    pub fn mount(device: Arc<dyn FlashDevice>, options: MountOptions) -> Result<Self> {
        Self::mount_with_index(device, options, Arc::new(Tnc::new()))
    }

    /// Mount by replaying the log into `index`, which must be empty.
    pub fn mount_with_index(
        device: Arc<dyn FlashDevice>,
        options: MountOptions,
        index: Arc<dyn NodeIndex>,
    ) -> Result<Self> {
        options.validate()?;
        let report = scan(device.as_ref())?;
        let state = Arc::new(StateSwitch::new(options.read_only));
        let journal = Journal::open(device, state, options.journal_heads, &report)?;

        let mut max_ino = InodeNumber::ROOT;
        for scanned in &report.nodes {
            index.add(scanned.node.key(), scanned.location)?;
            let ino = match &scanned.node {
                Node::Inode(inode) => inode.ino,
                Node::Dent(dent) => dent.target,
            };
            max_ino = max_ino.max(ino);
        }
        if index.lookup(&Key::inode(InodeNumber::ROOT)).is_none() {
            return Err(LsfsError::Format("log holds no root inode".to_owned()));
        }
        for tail in &report.corrupt {
            warn!(
                target: "lsfs::mount",
                lnum = tail.lnum,
                offs = tail.offs,
                detail = %tail.detail,
                "corrupt_leb_tail"
            );
        }

        info!(
            target: "lsfs::mount",
            nodes = report.nodes.len(),
            discarded = report.discarded,
            corrupt = report.corrupt.len(),
            max_sqnum = report.max_sqnum.0,
            next_ino = max_ino.0 + 1,
            read_only = options.read_only,
            "mount_complete"
        );
        Ok(Self::assemble(
            journal,
            index,
            options,
            InodeNumber(max_ino.0 + 1),
        ))
    }

    #[must_use]
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    #[must_use]
    pub fn state(&self) -> FsState {
        self.journal.state().get()
    }

    /// Why the filesystem went read-only, if it did.
    #[must_use]
    pub fn read_only_reason(&self) -> Option<String> {
        self.journal.state().reason()
    }

    #[must_use]
    pub fn space_stats(&self) -> SpaceStats {
        self.journal.space_stats()
    }

    pub(crate) fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Cached inode, loaded from its latest node on a miss.
    pub fn inode(&self, ino: InodeNumber) -> Result<Arc<Inode>> {
        if let Some(inode) = self.inodes.lock().get(&ino) {
            return Ok(inode.clone());
        }
        let loc = self
            .index
            .lookup(&Key::inode(ino))
            .ok_or_else(|| LsfsError::NotFound(format!("inode {ino}")))?;
        let Node::Inode(node) = self.read_node(loc)? else {
            return Err(LsfsError::Corruption {
                lnum: loc.lnum,
                offs: loc.offs,
                detail: format!("index entry for inode {ino} points at a directory entry"),
            });
        };
        if node.ino != ino {
            return Err(LsfsError::Corruption {
                lnum: loc.lnum,
                offs: loc.offs,
                detail: format!("expected inode {ino}, found {}", node.ino),
            });
        }
        let inode =
            Arc::new(Inode::from_node(node).map_err(|err| corruption(loc.lnum, loc.offs, &err))?);
        Ok(self.inodes.lock().entry(ino).or_insert(inode).clone())
    }

    pub fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr> {
        Ok(self.inode(ino)?.attr())
    }

    /// Resolve `name` inside directory `parent`.
    pub fn lookup(&self, parent: InodeNumber, name: &[u8]) -> Result<DirEntry> {
        self.check_name(name)?;
        self.dir_inode(parent)?;
        self.lookup_dent(parent, name)?.ok_or_else(|| {
            LsfsError::NotFound(format!(
                "{} in directory {parent}",
                String::from_utf8_lossy(name)
            ))
        })
    }

    /// Every entry of directory `dir`, in index order.
    pub fn readdir(&self, dir: InodeNumber) -> Result<Vec<DirEntry>> {
        self.dir_inode(dir)?;
        self.index
            .dents(dir)
            .into_iter()
            .map(|(_, loc)| self.read_dent(loc))
            .collect()
    }

    /// Create `name` in `parent` as one node group: the new entry, the new
    /// inode and the updated parent.
    pub fn create(
        &self,
        parent: InodeNumber,
        name: &[u8],
        kind: FileType,
        perm: u16,
    ) -> Result<InodeAttr> {
        self.journal.state().ensure_writable()?;
        self.check_name(name)?;
        let dir = self.dir_inode(parent)?;
        let mut dir_meta = dir.lock();
        if self.index.lookup(&Key::dent(parent, name)).is_some() {
            return Err(LsfsError::Exists);
        }

        let ino = InodeNumber(self.next_ino.fetch_add(1, Ordering::AcqRel));
        let now = Timespec::now();
        let meta = InodeMeta {
            creat_sqnum: self.journal.next_sqnum(),
            size: if kind.is_dir() { INO_NODE_SIZE as u64 } else { 0 },
            atime: now,
            ctime: now,
            mtime: now,
            nlink: if kind.is_dir() { 2 } else { 1 },
            uid: 0,
            gid: 0,
            mode: kind.mode_bits() | u32::from(perm & 0o7777),
            flags: 0,
            xattr_cnt: 0,
            xattr_size: 0,
            xattr_names: 0,
            data: Vec::new(),
            dirty: false,
        };
        let mut updated_dir = dir_meta.clone();
        updated_dir.size += align8(DentNode::len_for_name(name.len())) as u64;
        updated_dir.mtime = now;
        updated_dir.ctime = now;
        if kind.is_dir() {
            updated_dir.nlink += 1;
        }
        updated_dir.dirty = false;

        let dent = DentNode {
            parent,
            name: name.to_vec(),
            target: ino,
            kind,
        };
        let sync = self.options.dirsync || dir_meta.flags & INODE_FL_DIRSYNC != 0;
        let dirty: &[InodeNumber] = if sync { &[] } else { &[ino, parent] };
        self.commit_group(
            &[dent],
            &[meta.to_node(ino), updated_dir.to_node(parent)],
            sync,
            dirty,
        )?;
        *dir_meta = updated_dir;
        drop(dir_meta);

        let inode = Arc::new(Inode::new(ino, kind, meta));
        let attr = inode.attr();
        self.inodes.lock().insert(ino, inode);
        debug!(
            target: "lsfs::namespace",
            parent = parent.0,
            ino = ino.0,
            kind = ?kind,
            sync,
            "create"
        );
        Ok(attr)
    }

    /// `renameat2`. Only `RENAME_EXCHANGE` is implemented.
    pub fn rename(
        &self,
        old_dir: InodeNumber,
        old_name: &[u8],
        new_dir: InodeNumber,
        new_name: &[u8],
        flags: RenameFlags,
    ) -> Result<()> {
        if flags.contains(RenameFlags::EXCHANGE)
            && flags.intersects(RenameFlags::NOREPLACE | RenameFlags::WHITEOUT)
        {
            return Err(LsfsError::InvalidArgument(
                "RENAME_EXCHANGE cannot be combined with NOREPLACE or WHITEOUT".to_owned(),
            ));
        }
        if !flags.contains(RenameFlags::EXCHANGE) {
            return Err(LsfsError::Unsupported(format!(
                "rename with flags {flags:?}"
            )));
        }
        self.journal.state().ensure_writable()?;
        self.check_name(old_name)?;
        self.check_name(new_name)?;
        let old_parent = self.dir_inode(old_dir)?;
        let new_parent = self.dir_inode(new_dir)?;
        let _moves = self.rename_lock.lock();
        exchange::rename_exchange(self, &old_parent, old_name, &new_parent, new_name)
    }

    /// Make `ino` durable: write its metadata if memory is ahead of the log,
    /// otherwise flush the head whose write-buffer holds it.
    pub fn fsync(&self, ino: InodeNumber) -> Result<()> {
        let inode = self.inode(ino)?;
        {
            let mut meta = inode.lock();
            if meta.dirty {
                return self.write_inode(ino, &mut meta, true);
            }
        }
        self.journal.sync_inode(ino)?;
        Ok(())
    }

    /// Write back every dirty inode and flush every head.
    pub fn sync(&self) -> Result<()> {
        let cached: Vec<Arc<Inode>> = self.inodes.lock().values().cloned().collect();
        for inode in cached {
            let mut meta = inode.lock();
            if meta.dirty {
                self.write_inode(inode.ino(), &mut meta, false)?;
            }
        }
        self.journal.sync_all()
    }

    fn write_inode(&self, ino: InodeNumber, meta: &mut InodeMeta, sync: bool) -> Result<()> {
        let dirty: &[InodeNumber] = if sync { &[] } else { &[ino] };
        self.commit_group(&[], &[meta.to_node(ino)], sync, dirty)?;
        meta.dirty = false;
        Ok(())
    }

    /// Pack, reserve, write and index one node group.
    fn commit_group(
        &self,
        dents: &[DentNode],
        inodes: &[InodeNode],
        sync: bool,
        dirty: &[InodeNumber],
    ) -> Result<()> {
        let total = dents.iter().map(|d| align8(d.encoded_len())).sum::<usize>()
            + inodes.iter().map(|i| align8(i.encoded_len())).sum::<usize>();
        let mut builder = NodeGroupBuilder::with_capacity(total)?;
        for dent in dents {
            builder.push_dent(dent)?;
        }
        for inode in inodes {
            builder.push_inode(inode)?;
        }
        let mut writer = self.journal.reserve_space(HeadId::BASE, total)?;
        let group = builder.seal(|| self.journal.next_sqnum())?;
        let (lnum, offs) = writer.write(group.bytes(), sync)?;
        for ino in dirty {
            writer.add_dirty_inode(*ino);
        }
        writer.release();
        self.index_group(&group, lnum, offs)
    }

    /// Point the index at every node of a group written at `(lnum, offs)`.
    ///
    /// The group is already in the log, so a failure here leaves the index
    /// behind the log and switches the filesystem to read-only.
    pub(crate) fn index_group(&self, group: &NodeGroup, lnum: u32, offs: u32) -> Result<()> {
        for record in group.records() {
            let loc = NodeLocation {
                lnum,
                offs: offs
                    + u32::try_from(record.offset)
                        .map_err(|_| LsfsError::Format("record offset overflows u32".to_owned()))?,
                len: u32::try_from(record.len)
                    .map_err(|_| LsfsError::Format("record length overflows u32".to_owned()))?,
            };
            if let Err(err) = self.index.add(record.key.clone(), loc) {
                self.journal
                    .state()
                    .degrade(&format!("index update for node at {loc} failed: {err}"));
                return Err(match err {
                    LsfsError::IndexUpdate(_) => err,
                    other => LsfsError::IndexUpdate(other.to_string()),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn dir_inode(&self, ino: InodeNumber) -> Result<Arc<Inode>> {
        let inode = self.inode(ino)?;
        if !inode.kind().is_dir() {
            return Err(LsfsError::NotDirectory);
        }
        Ok(inode)
    }

    pub(crate) fn lookup_dent(&self, parent: InodeNumber, name: &[u8]) -> Result<Option<DirEntry>> {
        self.index
            .lookup(&Key::dent(parent, name))
            .map(|loc| self.read_dent(loc))
            .transpose()
    }

    fn check_name(&self, name: &[u8]) -> Result<()> {
        validate_name(name)?;
        if name.len() > self.options.max_name_len {
            return Err(LsfsError::NameTooLong);
        }
        Ok(())
    }

    fn read_node(&self, loc: NodeLocation) -> Result<Node> {
        let bytes = self.journal.read_node(loc)?;
        decode_node(&bytes)
            .map(|decoded| decoded.node)
            .map_err(|err| corruption(loc.lnum, loc.offs, &err))
    }

    fn read_dent(&self, loc: NodeLocation) -> Result<DirEntry> {
        match self.read_node(loc)? {
            Node::Dent(dent) => Ok(DirEntry {
                ino: dent.target,
                kind: dent.kind,
                name: dent.name,
            }),
            Node::Inode(inode) => Err(LsfsError::Corruption {
                lnum: loc.lnum,
                offs: loc.offs,
                detail: format!("expected a directory entry, found inode {}", inode.ino),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsfs_journal::MemFlash;

    fn fresh() -> (Arc<MemFlash>, Filesystem) {
        let flash = Arc::new(MemFlash::new(4096, 16).expect("flash"));
        let fs = Filesystem::format(flash.clone(), MountOptions::default()).expect("format");
        (flash, fs)
    }

    #[test]
    fn format_creates_root_directory() {
        let (_flash, fs) = fresh();
        let root = fs.getattr(InodeNumber::ROOT).expect("root");
        assert_eq!(root.kind, FileType::Directory);
        assert_eq!(root.nlink, 2);
        assert!(fs.readdir(InodeNumber::ROOT).expect("readdir").is_empty());
        assert_eq!(fs.state(), FsState::Active);
    }

    #[test]
    fn create_updates_parent_and_is_visible() {
        let (_flash, fs) = fresh();
        let before = fs.getattr(InodeNumber::ROOT).expect("root");
        let sub = fs
            .create(InodeNumber::ROOT, b"sub", FileType::Directory, 0o700)
            .expect("mkdir");
        let file = fs
            .create(InodeNumber::ROOT, b"f", FileType::RegularFile, 0o644)
            .expect("create");
        assert_eq!(sub.nlink, 2);
        assert_eq!(file.perm, 0o644);

        let root = fs.getattr(InodeNumber::ROOT).expect("root");
        assert_eq!(root.nlink, before.nlink + 1);
        assert_eq!(root.size, before.size + 64 + 64);
        assert_eq!(fs.lookup(InodeNumber::ROOT, b"f").expect("lookup").ino, file.ino);
        assert_eq!(fs.readdir(InodeNumber::ROOT).expect("readdir").len(), 2);
    }

    #[test]
    fn namespace_errors() {
        let (_flash, fs) = fresh();
        let file = fs
            .create(InodeNumber::ROOT, b"f", FileType::RegularFile, 0o644)
            .expect("create");
        assert!(matches!(
            fs.create(InodeNumber::ROOT, b"f", FileType::RegularFile, 0o644),
            Err(LsfsError::Exists)
        ));
        assert!(matches!(
            fs.create(file.ino, b"x", FileType::RegularFile, 0o644),
            Err(LsfsError::NotDirectory)
        ));
        assert!(matches!(
            fs.lookup(InodeNumber::ROOT, b"missing"),
            Err(LsfsError::NotFound(_))
        ));
        assert!(matches!(
            fs.lookup(InodeNumber::ROOT, &[b'n'; 256]),
            Err(LsfsError::NameTooLong)
        ));
        assert!(matches!(
            fs.getattr(InodeNumber(999)),
            Err(LsfsError::NotFound(_))
        ));
    }

    #[test]
    fn rename_flag_dispatch() {
        let (_flash, fs) = fresh();
        fs.create(InodeNumber::ROOT, b"a", FileType::RegularFile, 0o644)
            .expect("a");
        fs.create(InodeNumber::ROOT, b"b", FileType::RegularFile, 0o644)
            .expect("b");
        let root = InodeNumber::ROOT;
        assert!(matches!(
            fs.rename(root, b"a", root, b"b", RenameFlags::empty()),
            Err(LsfsError::Unsupported(_))
        ));
        assert!(matches!(
            fs.rename(root, b"a", root, b"b", RenameFlags::NOREPLACE),
            Err(LsfsError::Unsupported(_))
        ));
        assert!(matches!(
            fs.rename(
                root,
                b"a",
                root,
                b"b",
                RenameFlags::EXCHANGE | RenameFlags::NOREPLACE
            ),
            Err(LsfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            fs.rename(
                root,
                b"a",
                root,
                b"b",
                RenameFlags::EXCHANGE | RenameFlags::WHITEOUT
            ),
            Err(LsfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn read_only_mount_rejects_mutation() {
        let (flash, fs) = fresh();
        fs.sync().expect("sync");
        drop(fs);
        let options = MountOptions {
            read_only: true,
            ..MountOptions::default()
        };
        let fs = Filesystem::mount(flash, options).expect("mount");
        assert_eq!(fs.state(), FsState::ReadOnly);
        assert!(matches!(
            fs.create(InodeNumber::ROOT, b"x", FileType::RegularFile, 0o644),
            Err(LsfsError::ReadOnly)
        ));
        fs.getattr(InodeNumber::ROOT).expect("reads still work");
    }

    #[test]
    fn mount_of_blank_device_has_no_root() {
        let flash = Arc::new(MemFlash::new(4096, 4).expect("flash"));
        assert!(matches!(
            Filesystem::mount(flash, MountOptions::default()),
            Err(LsfsError::Format(_))
        ));
    }

    #[test]
    fn fsync_writes_back_dirty_metadata() {
        let (flash, fs) = fresh();
        let file = fs
            .create(InodeNumber::ROOT, b"f", FileType::RegularFile, 0o644)
            .expect("create");
        fs.sync().expect("sync");
        {
            let inode = fs.inode(file.ino).expect("inode");
            let mut meta = inode.lock();
            meta.uid = 42;
            meta.dirty = true;
        }
        fs.fsync(file.ino).expect("fsync");
        drop(fs);

        let fs = Filesystem::mount(Arc::new(flash.power_cut()), MountOptions::default())
            .expect("remount");
        assert_eq!(fs.getattr(file.ino).expect("attr").uid, 42);
    }
}
