//! Filesystem-wide read-only switch.

use lsfs_error::{LsfsError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether the filesystem accepts mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FsState {
    Active,
    ReadOnly,
}

/// Shared switch checked by every mutating operation.
///
/// The switch only ever moves from `Active` to `ReadOnly`. Once an I/O
/// failure may have left bytes in the log that the index does not reflect,
/// nothing may be written until the log is replayed by a fresh mount.
#[derive(Debug)]
pub struct StateSwitch {
    read_only: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl StateSwitch {
    #[must_use]
    pub fn new(read_only: bool) -> Self {
        Self {
            read_only: AtomicBool::new(read_only),
            reason: Mutex::new(read_only.then(|| "mounted read-only".to_owned())),
        }
    }

    #[must_use]
    pub fn get(&self) -> FsState {
        if self.read_only.load(Ordering::Acquire) {
            FsState::ReadOnly
        } else {
            FsState::Active
        }
    }

    /// Fail with [`LsfsError::ReadOnly`] unless the filesystem is active.
    pub fn ensure_writable(&self) -> Result<()> {
        match self.get() {
            FsState::Active => Ok(()),
            FsState::ReadOnly => Err(LsfsError::ReadOnly),
        }
    }

    /// Switch to read-only. Idempotent; returns `true` for the call that
    /// actually flipped the switch.
    pub fn degrade(&self, reason: &str) -> bool {
        let mut slot = self.reason.lock();
        if self.read_only.swap(true, Ordering::AcqRel) {
            return false;
        }
        *slot = Some(reason.to_owned());
        drop(slot);
        tracing::error!(target: "lsfs::state", reason, "switched_to_read_only");
        true
    }

    /// Why the filesystem is read-only, if it is.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrade_is_one_way_and_idempotent() {
        let state = StateSwitch::new(false);
        assert_eq!(state.get(), FsState::Active);
        state.ensure_writable().expect("active");

        assert!(state.degrade("write failed"));
        assert!(!state.degrade("index failed"));
        assert_eq!(state.get(), FsState::ReadOnly);
        assert!(matches!(state.ensure_writable(), Err(LsfsError::ReadOnly)));
        assert_eq!(state.reason().as_deref(), Some("write failed"));
    }

    #[test]
    fn read_only_mount_starts_degraded() {
        let state = StateSwitch::new(true);
        assert_eq!(state.get(), FsState::ReadOnly);
        assert!(!state.degrade("anything"));
    }
}
