//! Log heads, space reservation and write-buffer bookkeeping.
//!
//! Each head owns at most one LEB at a time and appends nodes to it at
//! increasing offsets. A writer first reserves the exact number of bytes it
//! is going to write; the reservation holds the head's lock until the
//! returned [`HeadWriter`] is released, so nothing else can interleave with
//! the write.
//!
//! ```text
//! reserve_space(head, len) ──► HeadWriter ──write(buf, sync)──► (lnum, offs)
//!                                   │
//!                                   ├─ add_dirty_inode(ino)
//!                                   └─ release() / drop
//! ```
//!
//! Writes that are not synced stay in the head's write-buffer. The head
//! remembers which inodes have metadata sitting there so `fsync` can flush
//! exactly the head that holds them.

use crate::device::FlashDevice;
use crate::scan::ScanReport;
use crate::state::StateSwitch;
use lsfs_error::{LsfsError, Result};
use lsfs_types::{HeadId, InodeNumber, NODE_ALIGN, NodeLocation, SeqNum};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Space accounting of one LEB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LebProps {
    /// Bytes still writable at the end of the LEB.
    free: u32,
    /// Bytes that will never hold live data (closed tails, failed writes).
    dirty: u32,
    /// Handed to a head at some point; never reused without GC.
    taken: bool,
}

#[derive(Debug, Default)]
struct HeadState {
    lnum: Option<u32>,
    offs: u32,
    /// Inodes whose latest node is still in this head's write-buffer.
    inodes: BTreeSet<InodeNumber>,
}

/// Snapshot of the space accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpaceStats {
    pub leb_size: u32,
    pub leb_count: u32,
    pub free_lebs: u32,
    pub free_bytes: u64,
    pub dirty_bytes: u64,
    pub used_bytes: u64,
}

/// The log: heads, LEB table and the global sequence counter.
pub struct Journal {
    device: Arc<dyn FlashDevice>,
    state: Arc<StateSwitch>,
    heads: Vec<Mutex<HeadState>>,
    lebs: Mutex<Vec<LebProps>>,
    sqnum: AtomicU64,
    leb_size: u32,
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("heads", &self.heads.len())
            .field("leb_size", &self.leb_size)
            .field("sqnum", &self.sqnum.load(Ordering::Relaxed))
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl Journal {
    /// Journal over an erased device.
    pub fn new(device: Arc<dyn FlashDevice>, state: Arc<StateSwitch>, heads: u8) -> Result<Self> {
        let leb_size = device.leb_size();
        let lebs = (0..device.leb_count())
            .map(|_| LebProps {
                free: leb_size,
                dirty: 0,
                taken: false,
            })
            .collect();
        Self::with_table(device, state, heads, lebs, SeqNum(0))
    }

    /// Journal over a scanned device.
    ///
    /// Every LEB that holds data is closed: its unwritten tail is accounted
    /// as dirty and heads start on fresh LEBs.
    pub fn open(
        device: Arc<dyn FlashDevice>,
        state: Arc<StateSwitch>,
        heads: u8,
        report: &ScanReport,
    ) -> Result<Self> {
        let leb_size = device.leb_size();
        let mut lebs: Vec<LebProps> = (0..device.leb_count())
            .map(|_| LebProps {
                free: leb_size,
                dirty: 0,
                taken: false,
            })
            .collect();
        for usage in &report.lebs {
            let Some(props) = lebs.get_mut(usage.lnum as usize) else {
                return Err(LsfsError::Format(format!(
                    "scan reported LEB {} beyond the device",
                    usage.lnum
                )));
            };
            if usage.used > 0 {
                *props = LebProps {
                    free: 0,
                    dirty: leb_size.saturating_sub(usage.used),
                    taken: true,
                };
            }
        }
        Self::with_table(device, state, heads, lebs, report.max_sqnum)
    }

    fn with_table(
        device: Arc<dyn FlashDevice>,
        state: Arc<StateSwitch>,
        heads: u8,
        lebs: Vec<LebProps>,
        sqnum: SeqNum,
    ) -> Result<Self> {
        if heads == 0 {
            return Err(LsfsError::InvalidArgument(
                "journal needs at least one head".to_owned(),
            ));
        }
        let leb_size = device.leb_size();
        Ok(Self {
            device,
            state,
            heads: (0..heads).map(|_| Mutex::new(HeadState::default())).collect(),
            lebs: Mutex::new(lebs),
            sqnum: AtomicU64::new(sqnum.0),
            leb_size,
        })
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn FlashDevice> {
        &self.device
    }

    #[must_use]
    pub fn state(&self) -> &Arc<StateSwitch> {
        &self.state
    }

    #[must_use]
    pub fn head_count(&self) -> usize {
        self.heads.len()
    }

    /// Next global sequence number.
    pub fn next_sqnum(&self) -> SeqNum {
        SeqNum(self.sqnum.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Highest sequence number handed out so far.
    #[must_use]
    pub fn max_sqnum(&self) -> SeqNum {
        SeqNum(self.sqnum.load(Ordering::Acquire))
    }

    /// Reserve `len` contiguous bytes in `head`.
    ///
    /// `len` must be a non-zero multiple of the node alignment. When the
    /// head's current LEB cannot take `len` more bytes the head moves to a
    /// free LEB; the old LEB is synced first so its write-buffer never
    /// outlives the head's ownership. Fails with [`LsfsError::NoSpace`]
    /// without side effects when no LEB can hold the reservation.
    pub fn reserve_space(&self, head: HeadId, len: usize) -> Result<HeadWriter<'_>> {
        self.state.ensure_writable()?;
        let slot = self.heads.get(usize::from(head.0)).ok_or_else(|| {
            LsfsError::InvalidArgument(format!(
                "head {head} does not exist ({} configured)",
                self.heads.len()
            ))
        })?;
        let len = u32::try_from(len)
            .ok()
            .filter(|len| *len > 0 && *len as usize % NODE_ALIGN == 0)
            .ok_or_else(|| {
                LsfsError::InvalidArgument(format!(
                    "reservation of {len} bytes is not a positive multiple of {NODE_ALIGN}"
                ))
            })?;
        if len > self.leb_size {
            return Err(LsfsError::NoSpace);
        }

        let mut guard = slot.lock();
        let fits = guard.lnum.is_some() && guard.offs + len <= self.leb_size;
        if !fits {
            self.switch_leb(head, &mut guard)?;
        }

        tracing::debug!(
            target: "lsfs::journal",
            head = head.0,
            lnum = guard.lnum,
            offs = guard.offs,
            len,
            "reserve_space"
        );

        Ok(HeadWriter {
            journal: self,
            head,
            guard,
            len,
            written: false,
        })
    }

    fn switch_leb(&self, head: HeadId, guard: &mut HeadState) -> Result<()> {
        let mut lebs = self.lebs.lock();
        let Some(next) = lebs.iter().position(|props| !props.taken) else {
            tracing::warn!(target: "lsfs::journal", head = head.0, "no_free_leb");
            return Err(LsfsError::NoSpace);
        };
        let next = u32::try_from(next)
            .map_err(|_| LsfsError::Format("LEB number overflows u32".to_owned()))?;

        if let Some(old) = guard.lnum {
            if let Err(err) = self.device.sync() {
                self.state.degrade(&format!("sync before leaving LEB {old} failed: {err}"));
                return Err(err);
            }
            guard.inodes.clear();
            let props = &mut lebs[old as usize];
            props.dirty += props.free;
            props.free = 0;
        }
        lebs[next as usize].taken = true;
        drop(lebs);

        tracing::debug!(
            target: "lsfs::journal",
            head = head.0,
            from = guard.lnum,
            to = next,
            "head_switched_leb"
        );
        guard.lnum = Some(next);
        guard.offs = 0;
        Ok(())
    }

    /// Flush one head's write-buffer and forget its dirty inodes.
    pub fn sync_head(&self, head: HeadId) -> Result<()> {
        let slot = self.heads.get(usize::from(head.0)).ok_or_else(|| {
            LsfsError::InvalidArgument(format!("head {head} does not exist"))
        })?;
        let mut guard = slot.lock();
        self.sync_locked(&mut guard)
    }

    fn sync_locked(&self, guard: &mut HeadState) -> Result<()> {
        if let Err(err) = self.device.sync() {
            self.state.degrade(&format!("device sync failed: {err}"));
            return Err(err);
        }
        guard.inodes.clear();
        Ok(())
    }

    /// Flush the head whose write-buffer holds `ino`, if any.
    ///
    /// Returns whether a sync was needed.
    pub fn sync_inode(&self, ino: InodeNumber) -> Result<bool> {
        for (idx, slot) in self.heads.iter().enumerate() {
            let mut guard = slot.lock();
            if guard.inodes.contains(&ino) {
                self.sync_locked(&mut guard)?;
                tracing::debug!(target: "lsfs::journal", head = idx, ino = ino.0, "inode_synced");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Flush every head.
    pub fn sync_all(&self) -> Result<()> {
        let mut guards: Vec<_> = self.heads.iter().map(|slot| slot.lock()).collect();
        if let Err(err) = self.device.sync() {
            self.state.degrade(&format!("device sync failed: {err}"));
            return Err(err);
        }
        for guard in &mut guards {
            guard.inodes.clear();
        }
        Ok(())
    }

    /// Whether `ino` has metadata in some head's unsynced write-buffer.
    #[must_use]
    pub fn is_inode_dirty(&self, ino: InodeNumber) -> bool {
        self.heads.iter().any(|slot| slot.lock().inodes.contains(&ino))
    }

    /// Read the raw bytes of a node back from flash.
    pub fn read_node(&self, loc: NodeLocation) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; loc.len as usize];
        self.device.read(loc.lnum, loc.offs, &mut buf)?;
        Ok(buf)
    }

    #[must_use]
    pub fn space_stats(&self) -> SpaceStats {
        let lebs = self.lebs.lock();
        let mut stats = SpaceStats {
            leb_size: self.leb_size,
            leb_count: u32::try_from(lebs.len()).unwrap_or(u32::MAX),
            free_lebs: 0,
            free_bytes: 0,
            dirty_bytes: 0,
            used_bytes: 0,
        };
        for props in lebs.iter() {
            if !props.taken {
                stats.free_lebs += 1;
            }
            stats.free_bytes += u64::from(props.free);
            stats.dirty_bytes += u64::from(props.dirty);
            stats.used_bytes += u64::from(self.leb_size - props.free - props.dirty);
        }
        stats
    }
}

/// Exclusive access to a head for one reserved write.
///
/// Dropping the writer releases the head. A reservation that was never
/// written consumes no space.
pub struct HeadWriter<'a> {
    journal: &'a Journal,
    head: HeadId,
    guard: MutexGuard<'a, HeadState>,
    len: u32,
    written: bool,
}

impl fmt::Debug for HeadWriter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeadWriter")
            .field("head", &self.head)
            .field("lnum", &self.guard.lnum)
            .field("offs", &self.guard.offs)
            .field("len", &self.len)
            .field("written", &self.written)
            .finish()
    }
}

impl HeadWriter<'_> {
    #[must_use]
    pub fn head(&self) -> HeadId {
        self.head
    }

    /// Reserved length in bytes.
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.len as usize
    }

    /// Write the reserved range in one device write and return where it
    /// landed.
    ///
    /// A failed write switches the filesystem to read-only and the range is
    /// accounted as dirty: part of it may already be programmed. The error is
    /// always reported as [`LsfsError::Io`].
    pub fn write(&mut self, buf: &[u8], sync: bool) -> Result<(u32, u32)> {
        if self.written {
            return Err(LsfsError::InvalidState(
                "head reservation already written".to_owned(),
            ));
        }
        if buf.len() != self.len as usize {
            return Err(LsfsError::InvalidArgument(format!(
                "write of {} bytes into a {}-byte reservation",
                buf.len(),
                self.len
            )));
        }
        let lnum = self
            .guard
            .lnum
            .ok_or_else(|| LsfsError::InvalidState("head owns no LEB".to_owned()))?;
        let offs = self.guard.offs;
        self.written = true;
        self.guard.offs += self.len;

        let written = self.journal.device.write(lnum, offs, buf);
        {
            let mut lebs = self.journal.lebs.lock();
            let props = &mut lebs[lnum as usize];
            props.free = props.free.saturating_sub(self.len);
            if written.is_err() {
                props.dirty += self.len;
            }
        }
        let result = written.and_then(|()| {
            if sync {
                self.journal.device.sync()?;
                self.guard.inodes.clear();
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                tracing::debug!(
                    target: "lsfs::journal",
                    head = self.head.0,
                    lnum,
                    offs,
                    len = self.len,
                    sync,
                    "head_write"
                );
                Ok((lnum, offs))
            }
            Err(err) => {
                self.journal
                    .state
                    .degrade(&format!("write at {lnum}:{offs} failed: {err}"));
                Err(match err {
                    LsfsError::Io(io) => LsfsError::Io(io),
                    other => LsfsError::Io(std::io::Error::other(other.to_string())),
                })
            }
        }
    }

    /// Record that `ino`'s latest node sits in this head's write-buffer.
    pub fn add_dirty_inode(&mut self, ino: InodeNumber) {
        self.guard.inodes.insert(ino);
    }

    /// Release the head.
    pub fn release(self) {}
}

impl Drop for HeadWriter<'_> {
    fn drop(&mut self) {
        tracing::trace!(
            target: "lsfs::journal",
            head = self.head.0,
            written = self.written,
            "head_released"
        );
    }
}
