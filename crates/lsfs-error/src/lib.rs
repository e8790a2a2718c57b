#![forbid(unsafe_code)]
//! Error types for LSFS.
//!
//! # Error Taxonomy
//!
//! LSFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `lsfs-types` | On-flash node format violations detected during byte parsing |
//! | Runtime | `LsfsError` | `lsfs-error` (this crate) | Errors returned by journal, index and filesystem operations |
//!
//! `lsfs-error` does not depend on `lsfs-types`. A `ParseError` is converted
//! into `LsfsError::Corruption` by the crate that knows where the bytes came
//! from (the journal scanner and the core node reader), so the LEB position
//! is always attached.
//!
//! ## Failure classes
//!
//! Every variant belongs to exactly one [`ErrorClass`]. The class decides what
//! a caller may assume about side effects:
//!
//! | Class | Variants | Side effects |
//! |-------|----------|--------------|
//! | `Precondition` | `InvalidState`, `InvalidArgument`, `NotFound`, `NotDirectory`, `Exists`, `NameTooLong`, `Unsupported`, `ReadOnly` | none |
//! | `ResourceExhaustion` | `NoSpace`, `OutOfMemory` | none, may be retried by caller policy |
//! | `IoFailure` | `Io`, `Corruption`, `Format`, `IndexUpdate` | bytes may have reached the log; the filesystem is switched to read-only |
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `IndexUpdate` | `EIO` |
//! | `InvalidState` | `EINVAL` |
//! | `InvalidArgument` | `EINVAL` |
//! | `Unsupported` | `EOPNOTSUPP` |
//! | `NoSpace` | `ENOSPC` |
//! | `OutOfMemory` | `ENOMEM` |
//! | `NotFound` | `ENOENT` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `Exists` | `EEXIST` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `ReadOnly` | `EROFS` |

use thiserror::Error;

/// Coarse failure class used to decide recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Bad input shape or state; nothing was changed.
    Precondition,
    /// Memory or log space ran out before anything was written.
    ResourceExhaustion,
    /// The log may already hold the bytes; only the read-only switch is safe.
    IoFailure,
}

/// Unified error type for all LSFS operations.
#[derive(Debug, Error)]
pub enum LsfsError {
    /// Operating system I/O error from a device backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A node on flash failed validation (bad magic, CRC, or length).
    #[error("corrupt node at LEB {lnum}:{offs}: {detail}")]
    Corruption { lnum: u32, offs: u32, detail: String },

    /// Invalid on-flash format or geometry.
    #[error("invalid on-flash format: {0}")]
    Format(String),

    /// The index could not record a node that is already in the log.
    #[error("index update failed: {0}")]
    IndexUpdate(String),

    /// An object is not in the state the operation requires.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Caller passed an argument combination that is never valid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The request is well formed but this filesystem does not implement it.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// No LEB can hold the requested reservation.
    #[error("no space left on device")]
    NoSpace,

    /// A transaction buffer could not be allocated.
    #[error("out of memory")]
    OutOfMemory,

    /// Directory entry or inode not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A parent inode is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Target name already exists.
    #[error("file exists")]
    Exists,

    /// Name exceeds the configured limit.
    #[error("name too long")]
    NameTooLong,

    /// The filesystem is mounted read-only or was switched to read-only
    /// after an unrecoverable failure.
    #[error("read-only filesystem")]
    ReadOnly,
}

impl LsfsError {
    /// Failure class of this error.
    ///
    /// The match is exhaustive so a new variant must pick a class.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io(_) | Self::Corruption { .. } | Self::Format(_) | Self::IndexUpdate(_) => {
                ErrorClass::IoFailure
            }
            Self::NoSpace | Self::OutOfMemory => ErrorClass::ResourceExhaustion,
            Self::InvalidState(_)
            | Self::InvalidArgument(_)
            | Self::Unsupported(_)
            | Self::NotFound(_)
            | Self::NotDirectory
            | Self::Exists
            | Self::NameTooLong
            | Self::ReadOnly => ErrorClass::Precondition,
        }
    }

    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::IndexUpdate(_) => libc::EIO,
            Self::Format(_) | Self::InvalidState(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
            Self::NoSpace => libc::ENOSPC,
            Self::OutOfMemory => libc::ENOMEM,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::Exists => libc::EEXIST,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::ReadOnly => libc::EROFS,
        }
    }
}

/// Result alias using `LsfsError`.
pub type Result<T> = std::result::Result<T, LsfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(LsfsError, libc::c_int)> = vec![
            (LsfsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                LsfsError::Corruption {
                    lnum: 3,
                    offs: 64,
                    detail: "bad crc".into(),
                },
                libc::EIO,
            ),
            (LsfsError::Format("test".into()), libc::EINVAL),
            (LsfsError::IndexUpdate("test".into()), libc::EIO),
            (LsfsError::InvalidState("test".into()), libc::EINVAL),
            (LsfsError::InvalidArgument("test".into()), libc::EINVAL),
            (LsfsError::Unsupported("rename".into()), libc::EOPNOTSUPP),
            (LsfsError::NoSpace, libc::ENOSPC),
            (LsfsError::OutOfMemory, libc::ENOMEM),
            (LsfsError::NotFound("a".into()), libc::ENOENT),
            (LsfsError::NotDirectory, libc::ENOTDIR),
            (LsfsError::Exists, libc::EEXIST),
            (LsfsError::NameTooLong, libc::ENAMETOOLONG),
            (LsfsError::ReadOnly, libc::EROFS),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(LsfsError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn classes_follow_side_effect_contract() {
        assert_eq!(LsfsError::NoSpace.class(), ErrorClass::ResourceExhaustion);
        assert_eq!(LsfsError::OutOfMemory.class(), ErrorClass::ResourceExhaustion);
        assert_eq!(
            LsfsError::InvalidState("data_len".into()).class(),
            ErrorClass::Precondition
        );
        assert_eq!(LsfsError::ReadOnly.class(), ErrorClass::Precondition);
        assert_eq!(
            LsfsError::IndexUpdate("tnc".into()).class(),
            ErrorClass::IoFailure
        );
        assert_eq!(
            LsfsError::Io(std::io::Error::other("eio")).class(),
            ErrorClass::IoFailure
        );
    }

    #[test]
    fn display_formatting() {
        let err = LsfsError::Corruption {
            lnum: 7,
            offs: 128,
            detail: "bad magic".into(),
        };
        assert_eq!(err.to_string(), "corrupt node at LEB 7:128: bad magic");
        assert_eq!(LsfsError::ReadOnly.to_string(), "read-only filesystem");
        assert_eq!(
            LsfsError::IndexUpdate("injected".into()).to_string(),
            "index update failed: injected"
        );
    }
}
