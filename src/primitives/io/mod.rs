#![forbid(unsafe_code)]

use std::{
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom},
    path::Path,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    sync::Arc,
};

use tracing::trace;

use crate::primitives::concurrency::OwnerLock;
use crate::types::{DeviceClass, FileId, MountId, Result, VnError};

mod mem;

pub use mem::{MemFile, MemFileCounters};

/// Kind of object a backing file is.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileKind {
    /// Ordinary regular file; sized through the attribute query.
    Regular,
    /// Block-special device; sized through the partition query.
    BlockDevice(DeviceClass),
}

/// Capability a pager consumes from the filesystem layer.
///
/// Transfers report the number of bytes moved; a short count at end of file
/// is not an error at this level.
pub trait BackingFile: Send + Sync + 'static {
    /// Stable identity of the file.
    fn id(&self) -> FileId;
    /// Kind of the file.
    fn kind(&self) -> FileKind;
    /// Filesystem the file belongs to.
    fn mount(&self) -> MountId;
    /// Current size through the generic attribute query.
    fn query_size(&self) -> Result<u64>;
    /// Current size of a block-special device's partition.
    fn partition_size(&self) -> Result<u64> {
        Err(VnError::Unsupported("partition size query"))
    }
    /// Reads up to `dst.len()` bytes at `off`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<usize>;
    /// Writes up to `src.len()` bytes at `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<usize>;
    /// Takes the file's exclusive lock; fails if the calling thread holds it already.
    fn lock_exclusive(&self) -> Result<()>;
    /// Takes the file's exclusive lock only if it is free.
    ///
    /// Returns `Ok(false)` when another thread holds it and
    /// [`VnError::LockRecursion`] when the calling thread does.
    fn try_lock_exclusive(&self) -> Result<bool>;
    /// Releases the file's exclusive lock.
    fn unlock(&self) -> Result<()>;
    /// Pins the file in the filesystem's own lifecycle.
    fn take_durable_reference(&self);
    /// Drops a pin taken with [`BackingFile::take_durable_reference`].
    fn release_durable_reference(&self);
    /// Best-effort clear of the "mapped executable" hint.
    fn clear_executable_hint(&self) {}
}

#[cfg(unix)]
/// Unix-specific positioned I/O helpers.
pub mod stdio_unix {
    use std::{fs::File, io, os::unix::fs::FileExt};

    /// Reads until `dst` is full or end of file, returning the bytes read.
    pub fn read_full(file: &File, mut off: u64, dst: &mut [u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < dst.len() {
            let read = match file.read_at(&mut dst[done..], off) {
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            if read == 0 {
                break;
            }
            done += read;
            off += read as u64;
        }
        Ok(done)
    }

    /// Writes every byte of `src` at `off`.
    pub fn write_all(file: &File, off: u64, src: &[u8]) -> io::Result<usize> {
        file.write_all_at(src, off)?;
        Ok(src.len())
    }
}

#[cfg(windows)]
/// Windows-specific positioned I/O helpers.
pub mod stdio_win {
    use std::{fs::File, io, os::windows::fs::FileExt};

    /// Reads until `dst` is full or end of file, returning the bytes read.
    pub fn read_full(file: &File, mut off: u64, dst: &mut [u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < dst.len() {
            let read = file.seek_read(&mut dst[done..], off)?;
            if read == 0 {
                break;
            }
            done += read;
            off += read as u64;
        }
        Ok(done)
    }

    /// Writes every byte of `src` at `off`.
    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<usize> {
        let total = src.len();
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(total)
    }
}

/// Backing file over a `std::fs::File`.
#[derive(Clone)]
pub struct StdBackingFile {
    inner: Arc<StdInner>,
}

struct StdInner {
    file: File,
    id: FileId,
    mount: MountId,
    kind: FileKind,
    lock: OwnerLock,
    durable_refs: AtomicU64,
    executable: AtomicBool,
}

impl StdBackingFile {
    /// Wraps an open file.
    pub fn new(file: File, id: FileId, mount: MountId) -> Result<Self> {
        let kind = file_kind(&file)?;
        Ok(Self {
            inner: Arc::new(StdInner {
                file,
                id,
                mount,
                kind,
                lock: OwnerLock::new(),
                durable_refs: AtomicU64::new(0),
                executable: AtomicBool::new(false),
            }),
        })
    }

    /// Opens or creates a file for read-write access, deriving its identity from the filesystem.
    pub fn open(path: impl AsRef<Path>, mount: MountId) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())
            .map_err(VnError::from)?;
        let id = file_identity(&file, path.as_ref())?;
        Self::new(file, id, mount)
    }

    /// Sets the on-disk length, the way a filesystem truncate or extend would.
    pub fn set_len(&self, len: u64) -> Result<()> {
        self.inner.file.set_len(len).map_err(VnError::from)
    }

    /// Flushes file data and metadata to stable storage.
    pub fn sync_all(&self) -> Result<()> {
        self.inner.file.sync_all().map_err(VnError::from)
    }

    /// Number of durable references currently held.
    pub fn durable_refs(&self) -> u64 {
        self.inner.durable_refs.load(Ordering::Acquire)
    }

    /// Marks the file as mapped executable.
    pub fn set_executable_hint(&self) {
        self.inner.executable.store(true, Ordering::Release);
    }

    /// Returns the "mapped executable" hint.
    pub fn executable_hint(&self) -> bool {
        self.inner.executable.load(Ordering::Acquire)
    }

    #[cfg(unix)]
    fn read_full(&self, off: u64, dst: &mut [u8]) -> std::io::Result<usize> {
        stdio_unix::read_full(&self.inner.file, off, dst)
    }

    #[cfg(windows)]
    fn read_full(&self, off: u64, dst: &mut [u8]) -> std::io::Result<usize> {
        stdio_win::read_full(&self.inner.file, off, dst)
    }

    #[cfg(unix)]
    fn write_all(&self, off: u64, src: &[u8]) -> std::io::Result<usize> {
        stdio_unix::write_all(&self.inner.file, off, src)
    }

    #[cfg(windows)]
    fn write_all(&self, off: u64, src: &[u8]) -> std::io::Result<usize> {
        stdio_win::write_all(&self.inner.file, off, src)
    }

    #[cfg(not(any(unix, windows)))]
    fn read_full(&self, _off: u64, _dst: &mut [u8]) -> std::io::Result<usize> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "StdBackingFile unsupported on this platform",
        ))
    }

    #[cfg(not(any(unix, windows)))]
    fn write_all(&self, _off: u64, _src: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "StdBackingFile unsupported on this platform",
        ))
    }
}

impl BackingFile for StdBackingFile {
    fn id(&self) -> FileId {
        self.inner.id
    }

    fn kind(&self) -> FileKind {
        self.inner.kind
    }

    fn mount(&self) -> MountId {
        self.inner.mount
    }

    fn query_size(&self) -> Result<u64> {
        if matches!(self.inner.kind, FileKind::BlockDevice(_)) {
            return Err(VnError::Unsupported("attribute query on a block device"));
        }
        Ok(self.inner.file.metadata().map_err(VnError::from)?.len())
    }

    fn partition_size(&self) -> Result<u64> {
        let mut file = &self.inner.file;
        file.seek(SeekFrom::End(0)).map_err(VnError::from)
    }

    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<usize> {
        let read = self.read_full(off, dst).map_err(VnError::from)?;
        trace!(file = self.inner.id.0, off, len = dst.len(), read, "io.std.read");
        Ok(read)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<usize> {
        let written = self.write_all(off, src).map_err(VnError::from)?;
        trace!(file = self.inner.id.0, off, written, "io.std.write");
        Ok(written)
    }

    fn lock_exclusive(&self) -> Result<()> {
        self.inner.lock.lock()
    }

    fn try_lock_exclusive(&self) -> Result<bool> {
        self.inner.lock.try_lock()
    }

    fn unlock(&self) -> Result<()> {
        self.inner.lock.unlock()
    }

    fn take_durable_reference(&self) {
        self.inner.durable_refs.fetch_add(1, Ordering::AcqRel);
    }

    fn release_durable_reference(&self) {
        let prev = self.inner.durable_refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "durable reference underflow");
    }

    fn clear_executable_hint(&self) {
        self.inner.executable.store(false, Ordering::Release);
    }
}

#[cfg(unix)]
fn file_kind(file: &File) -> Result<FileKind> {
    use std::os::unix::fs::FileTypeExt;
    let file_type = file.metadata().map_err(VnError::from)?.file_type();
    if file_type.is_block_device() {
        // The only block devices reachable through a path open are disks.
        Ok(FileKind::BlockDevice(DeviceClass::Disk))
    } else {
        Ok(FileKind::Regular)
    }
}

#[cfg(not(unix))]
fn file_kind(_file: &File) -> Result<FileKind> {
    Ok(FileKind::Regular)
}

#[cfg(unix)]
fn file_identity(file: &File, _path: &Path) -> Result<FileId> {
    use std::os::unix::fs::MetadataExt;
    let meta = file.metadata().map_err(VnError::from)?;
    Ok(FileId(meta.ino()))
}

#[cfg(not(unix))]
fn file_identity(_file: &File, path: &Path) -> Result<FileId> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let canonical = std::fs::canonicalize(path).map_err(VnError::from)?;
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    Ok(FileId(hasher.finish()))
}
