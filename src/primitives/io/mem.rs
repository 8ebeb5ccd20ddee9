use std::io::{Error as IoError, ErrorKind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use super::{BackingFile, FileKind};
use crate::primitives::concurrency::OwnerLock;
use crate::types::{FileId, MountId, Result, VnError};

/// In-memory backing store with fault injection and call counters.
///
/// Reads past the end return short counts, writes past the end extend the
/// store, exactly like a regular file.
pub struct MemFile {
    id: FileId,
    mount: MountId,
    kind: FileKind,
    data: RwLock<Vec<u8>>,
    lock: OwnerLock,
    durable_refs: AtomicU64,
    executable: AtomicBool,
    faults: Mutex<Faults>,
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_written: AtomicU64,
    lock_calls: AtomicU64,
}

#[derive(Default)]
struct Faults {
    fail_reads: bool,
    fail_writes: bool,
    fail_size: bool,
    short_write: bool,
    panic_on_io: bool,
}

/// Snapshot of how a [`MemFile`] has been used.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MemFileCounters {
    /// Number of `read_at` calls.
    pub reads: u64,
    /// Number of `write_at` calls.
    pub writes: u64,
    /// Total bytes accepted by `write_at`.
    pub bytes_written: u64,
    /// Number of `lock_exclusive` and `try_lock_exclusive` calls.
    pub lock_calls: u64,
    /// Durable references currently held.
    pub durable_refs: u64,
}

impl MemFile {
    /// Creates an empty regular file.
    pub fn new(id: FileId) -> Self {
        Self {
            id,
            mount: MountId(0),
            kind: FileKind::Regular,
            data: RwLock::new(Vec::new()),
            lock: OwnerLock::new(),
            durable_refs: AtomicU64::new(0),
            executable: AtomicBool::new(false),
            faults: Mutex::new(Faults::default()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            lock_calls: AtomicU64::new(0),
        }
    }

    /// Creates a file holding `contents`.
    pub fn with_contents(id: FileId, contents: Vec<u8>) -> Self {
        let file = Self::new(id);
        *file.data.write() = contents;
        file
    }

    /// Places the file on `mount`.
    pub fn on_mount(mut self, mount: MountId) -> Self {
        self.mount = mount;
        self
    }

    /// Changes the kind of object this file pretends to be.
    pub fn with_kind(mut self, kind: FileKind) -> Self {
        self.kind = kind;
        self
    }

    /// Truncates or zero-extends the store.
    pub fn set_len(&self, len: u64) {
        self.data.write().resize(len as usize, 0);
    }

    /// Current length of the store.
    pub fn len(&self) -> u64 {
        self.data.read().len() as u64
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Copy of the stored bytes.
    pub fn contents(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Copy of `len` bytes at `off`, zero padded past the end.
    pub fn slice(&self, off: u64, len: usize) -> Vec<u8> {
        let data = self.data.read();
        let mut out = vec![0u8; len];
        let start = (off as usize).min(data.len());
        let end = (start + len).min(data.len());
        out[..end - start].copy_from_slice(&data[start..end]);
        out
    }

    /// Makes every read fail.
    pub fn fail_reads(&self, on: bool) {
        self.faults.lock().fail_reads = on;
    }

    /// Makes every write fail.
    pub fn fail_writes(&self, on: bool) {
        self.faults.lock().fail_writes = on;
    }

    /// Makes the size queries fail.
    pub fn fail_size_queries(&self, on: bool) {
        self.faults.lock().fail_size = on;
    }

    /// Makes writes accept zero bytes.
    pub fn short_writes(&self, on: bool) {
        self.faults.lock().short_write = on;
    }

    /// Panics on any transfer, lock, or size query; proves a path never blocks.
    pub fn panic_on_io(&self, on: bool) {
        self.faults.lock().panic_on_io = on;
    }

    /// Snapshot of the call counters.
    pub fn counters(&self) -> MemFileCounters {
        MemFileCounters {
            reads: self.reads.load(Ordering::Acquire),
            writes: self.writes.load(Ordering::Acquire),
            bytes_written: self.bytes_written.load(Ordering::Acquire),
            lock_calls: self.lock_calls.load(Ordering::Acquire),
            durable_refs: self.durable_refs.load(Ordering::Acquire),
        }
    }

    /// Marks the file as mapped executable.
    pub fn set_executable_hint(&self) {
        self.executable.store(true, Ordering::Release);
    }

    /// Returns the "mapped executable" hint.
    pub fn executable_hint(&self) -> bool {
        self.executable.load(Ordering::Acquire)
    }

    /// Returns true when the calling thread holds the file lock.
    pub fn locked_by_current(&self) -> bool {
        self.lock.held_by_current()
    }

    fn guard_blocking(&self, what: &str) {
        if self.faults.lock().panic_on_io {
            panic!("blocking primitive `{what}` invoked on file {}", self.id);
        }
    }
}

impl BackingFile for MemFile {
    fn id(&self) -> FileId {
        self.id
    }

    fn kind(&self) -> FileKind {
        self.kind
    }

    fn mount(&self) -> MountId {
        self.mount
    }

    fn query_size(&self) -> Result<u64> {
        self.guard_blocking("query_size");
        if matches!(self.kind, FileKind::BlockDevice(_)) {
            return Err(VnError::Unsupported("attribute query on a block device"));
        }
        if self.faults.lock().fail_size {
            return Err(VnError::Io(IoError::new(ErrorKind::Other, "getattr failed")));
        }
        Ok(self.len())
    }

    fn partition_size(&self) -> Result<u64> {
        self.guard_blocking("partition_size");
        if !matches!(self.kind, FileKind::BlockDevice(_)) {
            return Err(VnError::Unsupported("partition size query"));
        }
        if self.faults.lock().fail_size {
            return Err(VnError::Io(IoError::new(ErrorKind::Other, "ioctl failed")));
        }
        Ok(self.len())
    }

    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<usize> {
        self.guard_blocking("read_at");
        self.reads.fetch_add(1, Ordering::AcqRel);
        if self.faults.lock().fail_reads {
            return Err(VnError::Io(IoError::new(ErrorKind::Other, "read failed")));
        }
        let data = self.data.read();
        let start = (off as usize).min(data.len());
        let end = (start + dst.len()).min(data.len());
        dst[..end - start].copy_from_slice(&data[start..end]);
        Ok(end - start)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<usize> {
        self.guard_blocking("write_at");
        self.writes.fetch_add(1, Ordering::AcqRel);
        {
            let faults = self.faults.lock();
            if faults.fail_writes {
                return Err(VnError::Io(IoError::new(ErrorKind::Other, "write failed")));
            }
            if faults.short_write {
                return Ok(0);
            }
        }
        let mut data = self.data.write();
        let start = off as usize;
        let end = start + src.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(src);
        self.bytes_written
            .fetch_add(src.len() as u64, Ordering::AcqRel);
        Ok(src.len())
    }

    fn lock_exclusive(&self) -> Result<()> {
        self.guard_blocking("lock_exclusive");
        self.lock_calls.fetch_add(1, Ordering::AcqRel);
        self.lock.lock()
    }

    fn try_lock_exclusive(&self) -> Result<bool> {
        self.guard_blocking("try_lock_exclusive");
        self.lock_calls.fetch_add(1, Ordering::AcqRel);
        self.lock.try_lock()
    }

    fn unlock(&self) -> Result<()> {
        self.lock.unlock()
    }

    fn take_durable_reference(&self) {
        self.durable_refs.fetch_add(1, Ordering::AcqRel);
    }

    fn release_durable_reference(&self) {
        let prev = self.durable_refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "durable reference underflow");
    }

    fn clear_executable_hint(&self) {
        self.executable.store(false, Ordering::Release);
    }
}
