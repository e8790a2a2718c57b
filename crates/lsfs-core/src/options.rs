use lsfs_error::{LsfsError, Result};
use lsfs_types::MAX_NAME_LEN;
use serde::{Deserialize, Serialize};

/// Options controlling how a filesystem is mounted.
///
/// Missing fields take their defaults when parsed from JSON, so
/// `{"dirsync": true}` is a complete configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Reject every mutation with `ReadOnly`.
    pub read_only: bool,
    /// Write directory updates synchronously, as if every directory carried
    /// the per-inode `DIRSYNC` flag.
    pub dirsync: bool,
    /// Number of log heads. Directory entries and inode metadata always go
    /// to the base head.
    pub journal_heads: u8,
    /// Longest accepted entry name, at most the on-flash limit.
    pub max_name_len: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            dirsync: false,
            journal_heads: 1,
            max_name_len: MAX_NAME_LEN,
        }
    }
}

impl MountOptions {
    /// Parse and validate options from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|err| LsfsError::InvalidArgument(format!("mount options: {err}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.journal_heads == 0 {
            return Err(LsfsError::InvalidArgument(
                "journal_heads must be at least 1".to_owned(),
            ));
        }
        if self.max_name_len == 0 || self.max_name_len > MAX_NAME_LEN {
            return Err(LsfsError::InvalidArgument(format!(
                "max_name_len must be in 1..={MAX_NAME_LEN}, got {}",
                self.max_name_len
            )));
        }
        Ok(())
    }
}
