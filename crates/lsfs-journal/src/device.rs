//! Flash devices addressed by logical erase block.
//!
//! A device is `leb_count` LEBs of `leb_size` bytes each. Erased bytes read
//! as `0xFF` and a byte can only be programmed once per erase cycle, so
//! every backend rejects writes that overlap already-programmed bytes.

use lsfs_error::{LsfsError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Value of an erased flash byte.
pub const ERASED: u8 = 0xFF;

/// LEB-addressed flash interface.
pub trait FlashDevice: Send + Sync {
    /// Bytes per logical erase block.
    fn leb_size(&self) -> u32;

    /// Number of logical erase blocks.
    fn leb_count(&self) -> u32;

    /// Read `buf.len()` bytes at `offs` inside LEB `lnum`.
    fn read(&self, lnum: u32, offs: u32, buf: &mut [u8]) -> Result<()>;

    /// Program `buf` at `offs` inside LEB `lnum`. The range must be erased.
    fn write(&self, lnum: u32, offs: u32, buf: &[u8]) -> Result<()>;

    /// Reset every byte of LEB `lnum` to [`ERASED`].
    fn erase(&self, lnum: u32) -> Result<()>;

    /// Make every completed write durable.
    fn sync(&self) -> Result<()>;
}

impl<D: FlashDevice + ?Sized> FlashDevice for Arc<D> {
    fn leb_size(&self) -> u32 {
        (**self).leb_size()
    }

    fn leb_count(&self) -> u32 {
        (**self).leb_count()
    }

    fn read(&self, lnum: u32, offs: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read(lnum, offs, buf)
    }

    fn write(&self, lnum: u32, offs: u32, buf: &[u8]) -> Result<()> {
        (**self).write(lnum, offs, buf)
    }

    fn erase(&self, lnum: u32) -> Result<()> {
        (**self).erase(lnum)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// Validate `(lnum, offs, len)` against the geometry and return the absolute
/// byte offset of the range.
fn device_offset(leb_size: u32, leb_count: u32, lnum: u32, offs: u32, len: usize) -> Result<u64> {
    if lnum >= leb_count {
        return Err(LsfsError::Format(format!(
            "LEB {lnum} out of range (device has {leb_count})"
        )));
    }
    let len = u64::try_from(len)
        .map_err(|_| LsfsError::Format("I/O length overflows u64".to_owned()))?;
    if u64::from(offs) + len > u64::from(leb_size) {
        return Err(LsfsError::Format(format!(
            "I/O at {lnum}:{offs}+{len} crosses the end of a {leb_size}-byte LEB"
        )));
    }
    Ok(u64::from(lnum) * u64::from(leb_size) + u64::from(offs))
}

fn mem_range(
    leb_size: u32,
    leb_count: u32,
    lnum: u32,
    offs: u32,
    len: usize,
) -> Result<Range<usize>> {
    let start = device_offset(leb_size, leb_count, lnum, offs, len)?;
    let start = usize::try_from(start)
        .map_err(|_| LsfsError::Format("device offset overflows usize".to_owned()))?;
    Ok(start..start + len)
}

fn ensure_erased(lnum: u32, offs: u32, existing: &[u8]) -> Result<()> {
    if let Some(pos) = existing.iter().position(|b| *b != ERASED) {
        return Err(LsfsError::InvalidState(format!(
            "write to programmed flash at {lnum}:{}",
            u64::from(offs) + pos as u64
        )));
    }
    Ok(())
}

#[derive(Debug)]
struct MemFlashInner {
    /// What a reader sees now.
    current: Vec<u8>,
    /// What survives a power cut.
    durable: Vec<u8>,
}

/// In-memory flash that keeps written and synced contents apart.
///
/// [`power_cut`](Self::power_cut) returns a fresh device holding only the
/// synced bytes, which is what a remount after power loss would see.
#[derive(Debug)]
pub struct MemFlash {
    leb_size: u32,
    leb_count: u32,
    inner: Mutex<MemFlashInner>,
}

impl MemFlash {
    /// A fully erased device.
    pub fn new(leb_size: u32, leb_count: u32) -> Result<Self> {
        let total = usize::try_from(u64::from(leb_size) * u64::from(leb_count))
            .map_err(|_| LsfsError::Format("device size overflows usize".to_owned()))?;
        if leb_size == 0 || leb_count == 0 || leb_size % 8 != 0 {
            return Err(LsfsError::Format(format!(
                "invalid geometry: {leb_count} LEBs of {leb_size} bytes"
            )));
        }
        Ok(Self {
            leb_size,
            leb_count,
            inner: Mutex::new(MemFlashInner {
                current: vec![ERASED; total],
                durable: vec![ERASED; total],
            }),
        })
    }

    /// Simulate power loss: unsynced writes are gone on the returned device.
    #[must_use]
    pub fn power_cut(&self) -> Self {
        let inner = self.inner.lock();
        Self {
            leb_size: self.leb_size,
            leb_count: self.leb_count,
            inner: Mutex::new(MemFlashInner {
                current: inner.durable.clone(),
                durable: inner.durable.clone(),
            }),
        }
    }

    /// Bytes a reader would currently see, for assertions in tests.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().current.clone()
    }
}

impl FlashDevice for MemFlash {
    fn leb_size(&self) -> u32 {
        self.leb_size
    }

    fn leb_count(&self) -> u32 {
        self.leb_count
    }

    fn read(&self, lnum: u32, offs: u32, buf: &mut [u8]) -> Result<()> {
        let range = mem_range(self.leb_size, self.leb_count, lnum, offs, buf.len())?;
        let inner = self.inner.lock();
        buf.copy_from_slice(&inner.current[range]);
        Ok(())
    }

    fn write(&self, lnum: u32, offs: u32, buf: &[u8]) -> Result<()> {
        let range = mem_range(self.leb_size, self.leb_count, lnum, offs, buf.len())?;
        let mut inner = self.inner.lock();
        ensure_erased(lnum, offs, &inner.current[range.clone()])?;
        inner.current[range].copy_from_slice(buf);
        Ok(())
    }

    fn erase(&self, lnum: u32) -> Result<()> {
        let range = mem_range(self.leb_size, self.leb_count, lnum, 0, self.leb_size as usize)?;
        let mut inner = self.inner.lock();
        inner.current[range.clone()].fill(ERASED);
        inner.durable[range].fill(ERASED);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let MemFlashInner { current, durable } = &mut *inner;
        durable.copy_from_slice(current);
        Ok(())
    }
}

/// File-backed flash image using positional I/O.
#[derive(Debug, Clone)]
pub struct FileFlash {
    file: Arc<File>,
    leb_size: u32,
    leb_count: u32,
}

impl FileFlash {
    /// Create (or truncate) an image of `leb_count` erased LEBs.
    pub fn create(path: impl AsRef<Path>, leb_size: u32, leb_count: u32) -> Result<Self> {
        if leb_size == 0 || leb_count == 0 || leb_size % 8 != 0 {
            return Err(LsfsError::Format(format!(
                "invalid geometry: {leb_count} LEBs of {leb_size} bytes"
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(u64::from(leb_size) * u64::from(leb_count))?;
        let flash = Self {
            file: Arc::new(file),
            leb_size,
            leb_count,
        };
        for lnum in 0..leb_count {
            flash.erase(lnum)?;
        }
        flash.sync()?;
        Ok(flash)
    }

    /// Open an existing image; its length must be a whole number of LEBs.
    pub fn open(path: impl AsRef<Path>, leb_size: u32) -> Result<Self> {
        if leb_size == 0 || leb_size % 8 != 0 {
            return Err(LsfsError::Format(format!("invalid LEB size {leb_size}")));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len == 0 || len % u64::from(leb_size) != 0 {
            return Err(LsfsError::Format(format!(
                "image of {len} bytes is not a whole number of {leb_size}-byte LEBs"
            )));
        }
        let leb_count = u32::try_from(len / u64::from(leb_size))
            .map_err(|_| LsfsError::Format("too many LEBs".to_owned()))?;
        Ok(Self {
            file: Arc::new(file),
            leb_size,
            leb_count,
        })
    }
}

impl FlashDevice for FileFlash {
    fn leb_size(&self) -> u32 {
        self.leb_size
    }

    fn leb_count(&self) -> u32 {
        self.leb_count
    }

    fn read(&self, lnum: u32, offs: u32, buf: &mut [u8]) -> Result<()> {
        let at = device_offset(self.leb_size, self.leb_count, lnum, offs, buf.len())?;
        self.file.read_exact_at(buf, at)?;
        Ok(())
    }

    fn write(&self, lnum: u32, offs: u32, buf: &[u8]) -> Result<()> {
        let at = device_offset(self.leb_size, self.leb_count, lnum, offs, buf.len())?;
        let mut existing = vec![0_u8; buf.len()];
        self.file.read_exact_at(&mut existing, at)?;
        ensure_erased(lnum, offs, &existing)?;
        self.file.write_all_at(buf, at)?;
        Ok(())
    }

    fn erase(&self, lnum: u32) -> Result<()> {
        let at = device_offset(self.leb_size, self.leb_count, lnum, 0, 0)?;
        let erased = vec![ERASED; self.leb_size as usize];
        self.file.write_all_at(&erased, at)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_device_reads_erased() {
        let flash = MemFlash::new(64, 2).expect("flash");
        let mut buf = [0_u8; 16];
        flash.read(1, 48, &mut buf).expect("read");
        assert!(buf.iter().all(|b| *b == ERASED));
    }

    #[test]
    fn programmed_bytes_cannot_be_rewritten_until_erase() {
        let flash = MemFlash::new(64, 2).expect("flash");
        flash.write(0, 8, &[1, 2, 3, 4]).expect("first write");
        assert!(matches!(
            flash.write(0, 10, &[9]),
            Err(LsfsError::InvalidState(_))
        ));
        flash.erase(0).expect("erase");
        flash.write(0, 10, &[9]).expect("after erase");
    }

    #[test]
    fn out_of_range_io_is_rejected() {
        let flash = MemFlash::new(64, 2).expect("flash");
        let mut buf = [0_u8; 8];
        assert!(flash.read(2, 0, &mut buf).is_err());
        assert!(flash.read(0, 60, &mut buf).is_err());
        assert!(flash.write(1, 64, &[0]).is_err());
    }

    #[test]
    fn power_cut_drops_unsynced_writes() {
        let flash = MemFlash::new(64, 2).expect("flash");
        flash.write(0, 0, &[1; 8]).expect("write");
        flash.sync().expect("sync");
        flash.write(0, 8, &[2; 8]).expect("write");

        let after = flash.power_cut();
        let mut buf = [0_u8; 16];
        after.read(0, 0, &mut buf).expect("read");
        assert_eq!(&buf[..8], &[1; 8]);
        assert_eq!(&buf[8..], &[ERASED; 8]);
    }

    #[test]
    fn file_flash_persists_across_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("flash.img");
        {
            let flash = FileFlash::create(&path, 128, 4).expect("create");
            flash.write(3, 120, &[7; 8]).expect("write");
            flash.sync().expect("sync");
        }
        let flash = FileFlash::open(&path, 128).expect("open");
        assert_eq!(flash.leb_count(), 4);
        let mut buf = [0_u8; 8];
        flash.read(3, 120, &mut buf).expect("read");
        assert_eq!(buf, [7; 8]);
        assert!(flash.write(3, 124, &[0]).is_err());
        assert!(FileFlash::open(&path, 96).is_err());
    }
}
