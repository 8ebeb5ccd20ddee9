use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, warn};

use super::ops::{Access, Advice, FlushFlags, GetFlags, PagerOps};
use super::page::{PageHandle, PageRelease, Protection};
use super::state::{Lifecycle, ObjectState, PagerPhase};
use super::system::PagerContext;
use crate::primitives::io::{BackingFile, FileKind};
use crate::types::{AttachError, DeviceClass, FileId, PageKey, PagerId, PagerStatus, Result};

pub(super) type ObjectGuard<'a> = MutexGuard<'a, ObjectState>;

/// Per-call facts threaded from an operation down to the I/O engine.
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct IoContext {
    /// The caller already holds the backing file's lock.
    pub file_locked: bool,
}

/// Point-in-time view of one pager.
#[derive(Clone, Debug, Serialize)]
pub struct PagerSnapshot {
    /// Pager identity.
    pub id: PagerId,
    /// Backing file identity.
    pub file: FileId,
    /// Number of fresh initialisations so far.
    pub generation: u64,
    /// Lifecycle phase.
    pub phase: PagerPhase,
    /// Outstanding references.
    pub refs: u32,
    /// Logical object size in bytes.
    pub size: u64,
    /// Resident pages.
    pub resident: usize,
    /// Resident pages whose contents differ from the file.
    pub dirty: usize,
    /// Synchronous transfers in flight.
    pub nio: u32,
    /// On the writeable list.
    pub writeable: bool,
    /// May persist once unreferenced.
    pub can_persist: bool,
}

/// Pager binding a memory object to a backing file.
///
/// One lives beside each file for the file's whole lifetime; attaching
/// (re)initialises it and the last detach either leaves it persisting or
/// tears it down to the uninitialised state.
pub struct VnodePager {
    id: PagerId,
    file: Arc<dyn BackingFile>,
    pub(super) ctx: Arc<PagerContext>,
    me: Weak<VnodePager>,
    pub(super) state: Mutex<ObjectState>,
    pub(super) attach_cv: Condvar,
    pub(super) io_cv: Condvar,
    pub(super) page_cv: Condvar,
}

impl fmt::Debug for VnodePager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `try_lock` keeps formatting usable while the object lock is held.
        let phase = self.state.try_lock().map(|st| st.phase());
        f.debug_struct("VnodePager")
            .field("id", &self.id)
            .field("file", &self.file.id())
            .field("phase", &phase)
            .finish_non_exhaustive()
    }
}

impl VnodePager {
    pub(super) fn new(id: PagerId, file: Arc<dyn BackingFile>, ctx: Arc<PagerContext>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            file,
            ctx,
            me: me.clone(),
            state: Mutex::new(ObjectState::new()),
            attach_cv: Condvar::new(),
            io_cv: Condvar::new(),
            page_cv: Condvar::new(),
        })
    }

    /// Identity of this pager.
    pub fn id(&self) -> PagerId {
        self.id
    }

    /// Identity of the backing file.
    pub fn file_id(&self) -> FileId {
        self.file.id()
    }

    /// The backing file.
    pub fn file(&self) -> &Arc<dyn BackingFile> {
        &self.file
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.ctx.page_size
    }

    /// Logical size of the object in bytes.
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    /// Outstanding references.
    pub fn refs(&self) -> u32 {
        self.state.lock().refs
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> PagerPhase {
        self.state.lock().phase()
    }

    /// Snapshot of the pager's counters.
    pub fn stats(&self) -> PagerSnapshot {
        let st = self.state.lock();
        PagerSnapshot {
            id: self.id,
            file: self.file.id(),
            generation: st.generation,
            phase: st.phase(),
            refs: st.refs,
            size: st.size,
            resident: st.pages.len(),
            dirty: st.dirty_pages(),
            nio: st.nio,
            writeable: st.writeable,
            can_persist: st.can_persist,
        }
    }

    /// File offsets of the resident pages, in increasing order.
    pub fn resident_pages(&self) -> Vec<u64> {
        let st = self.state.lock();
        st.pages.keys().map(|index| self.page_offset(*index)).collect()
    }

    pub(super) fn key(&self, index: u64) -> PageKey {
        PageKey {
            pager: self.id,
            index,
        }
    }

    pub(super) fn page_offset(&self, index: u64) -> u64 {
        index * self.ctx.page_size as u64
    }

    pub(super) fn handle(&self, st: &ObjectState, index: u64) -> Option<PageHandle> {
        st.pages.get(&index).map(|page| {
            PageHandle::new(self.key(index), self.page_offset(index), Arc::clone(&page.buf))
        })
    }

    pub(super) fn attach(&self, access: Access) -> std::result::Result<(), AttachError> {
        let mut st = self.state.lock();
        while st.is_blocked() {
            self.attach_cv.wait(&mut st);
        }
        if let FileKind::BlockDevice(class) = self.file.kind() {
            if class != DeviceClass::Disk {
                debug!(pager = %self.id, ?class, "vnpager.attach.wrong_device");
                return Err(AttachError::WrongDeviceKind(class));
            }
        }

        if st.is_valid() {
            if st.refs == 0 {
                self.file.take_durable_reference();
            }
            st.refs += 1;
            if access.allows_write() && !st.writeable {
                self.register_writeable(&mut st);
            }
            debug!(pager = %self.id, refs = st.refs, "vnpager.attach.reuse");
            return Ok(());
        }

        st.lifecycle = Lifecycle::Attaching;
        let size = MutexGuard::unlocked(&mut st, || self.query_size());
        let size = match size {
            Ok(size) => size,
            Err(err) => {
                debug!(pager = %self.id, error = %err, "vnpager.attach.size_failed");
                st.reset();
                drop(st);
                self.attach_cv.notify_all();
                return Err(AttachError::SizeQuery(Box::new(err)));
            }
        };

        st.lifecycle = Lifecycle::Valid { revoked: false };
        st.can_persist = true;
        st.nio = 0;
        st.size = size;
        st.refs = 1;
        st.generation += 1;
        if access.allows_write() {
            self.register_writeable(&mut st);
        }
        self.file.take_durable_reference();
        debug!(
            pager = %self.id,
            file = %self.file.id(),
            size,
            generation = st.generation,
            "vnpager.attach.init"
        );
        drop(st);
        self.attach_cv.notify_all();
        Ok(())
    }

    fn query_size(&self) -> Result<u64> {
        match self.file.kind() {
            FileKind::BlockDevice(_) => self.file.partition_size(),
            FileKind::Regular => self.file.query_size(),
        }
    }

    fn register_writeable(&self, st: &mut ObjectState) {
        st.writeable = true;
        self.ctx.registry.insert(self.id, self.me.clone());
    }

    pub(super) fn unregister_writeable(&self, st: &mut ObjectState) {
        if st.writeable {
            st.writeable = false;
            self.ctx.registry.remove(self.id);
        }
    }

    fn detach_locked(&self, mut st: ObjectGuard<'_>) {
        assert!(st.refs > 0, "detach of pager {} with no references", self.id);
        st.refs -= 1;
        if st.refs > 0 {
            return;
        }
        if st.is_dying() {
            // A running terminate owns the teardown.
            debug!(pager = %self.id, "vnpager.detach.during_teardown");
            return;
        }

        if st.can_persist {
            let ok = self.flush_locked(
                &mut st,
                0,
                0,
                FlushFlags::ALLPAGES | FlushFlags::DEACTIVATE,
                IoContext::default(),
            );
            debug!(pager = %self.id, resident = st.pages.len(), ok, "vnpager.detach.persist");
            drop(st);
            self.file.release_durable_reference();
            return;
        }

        self.file.clear_executable_hint();
        st.lifecycle = Lifecycle::Dying { relkill: false };
        let ok = self.flush_locked(
            &mut st,
            0,
            0,
            FlushFlags::CLEANIT | FlushFlags::FREE | FlushFlags::ALLPAGES,
            IoContext::default(),
        );
        if !ok {
            warn!(pager = %self.id, "vnpager.detach.flush_failed");
        }

        if !st.pages.is_empty() || st.nio > 0 {
            st.lifecycle = Lifecycle::Dying { relkill: true };
            self.attach_cv.notify_all();
            while (!st.pages.is_empty() || st.nio > 0) && st.relkill() {
                self.io_cv.wait(&mut st);
            }
            if !st.relkill() {
                debug!(pager = %self.id, "vnpager.detach.taken_over");
                return;
            }
        }

        self.unregister_writeable(&mut st);
        st.reset();
        debug!(pager = %self.id, generation = st.generation, "vnpager.detach.destroyed");
        drop(st);
        self.attach_cv.notify_all();
        self.file.release_durable_reference();
    }

    pub(super) fn terminate(&self) {
        let mut st = self.state.lock();
        // Another teardown that is still flushing finishes first.
        while matches!(st.lifecycle, Lifecycle::Dying { relkill: false }) {
            self.attach_cv.wait(&mut st);
        }
        if !st.is_valid() {
            return;
        }

        let took_over = st.relkill();
        let holds_durable = st.refs > 0 || took_over;
        if took_over {
            self.io_cv.notify_all();
        }
        st.lifecycle = Lifecycle::Dying { relkill: false };
        st.terminating = true;

        let ok = self.flush_locked(
            &mut st,
            0,
            0,
            FlushFlags::CLEANIT | FlushFlags::FREE | FlushFlags::ALLPAGES,
            IoContext { file_locked: true },
        );
        while !st.pages.is_empty() || st.nio > 0 {
            self.io_cv.wait(&mut st);
        }
        st.terminating = false;
        self.unregister_writeable(&mut st);

        let release_durable = if st.refs > 0 {
            st.lifecycle = Lifecycle::Valid { revoked: true };
            st.can_persist = false;
            false
        } else {
            st.reset();
            holds_durable
        };
        debug!(
            pager = %self.id,
            refs = st.refs,
            took_over,
            ok,
            "vnpager.terminate.done"
        );
        drop(st);
        self.attach_cv.notify_all();
        if release_durable {
            self.file.release_durable_reference();
        }
    }

    pub(super) fn setsize(&self, new_size: u64) {
        let mut st = self.state.lock();
        if !st.is_valid() {
            return;
        }
        if new_size < st.size {
            let page_size = self.ctx.page_size as u64;
            let keep = new_size.div_ceil(page_size) * page_size;
            let old_size = st.size;
            if keep < old_size {
                self.flush_locked(&mut st, keep, old_size, FlushFlags::FREE, IoContext::default());
            }
            let tail = (new_size % page_size) as usize;
            if tail != 0 {
                let index = new_size / page_size;
                if let Some(page) = st.pages.get(&index).filter(|page| !page.busy) {
                    page.buf.write()[tail..].fill(0);
                }
            }
            debug!(pager = %self.id, old_size, new_size, "vnpager.setsize.shrink");
        }
        st.size = new_size;
    }

    pub(super) fn uncache(&self) -> bool {
        let mut st = self.state.lock();
        if !st.is_valid() || st.is_blocked() {
            return true;
        }
        st.can_persist = false;
        if st.refs > 0 {
            return false;
        }
        self.file.take_durable_reference();
        st.refs = 1;
        drop(st);

        let relock = self.file.unlock().is_ok();
        self.detach();
        if relock {
            if let Err(err) = self.file.lock_exclusive() {
                warn!(pager = %self.id, error = %err, "vnpager.uncache.relock_failed");
            }
        }
        debug!(pager = %self.id, "vnpager.uncache.done");
        true
    }

    /// Takes the reference a sync pass holds while flushing; false when the pager is not eligible.
    pub(super) fn sync_reference(&self) -> bool {
        let mut st = self.state.lock();
        if !matches!(st.lifecycle, Lifecycle::Valid { revoked: false }) || !st.writeable {
            return false;
        }
        if st.refs == 0 {
            self.file.take_durable_reference();
        }
        st.refs += 1;
        true
    }

    /// Flushes on behalf of a sync pass, then drops the pass's reference.
    pub(super) fn sync_flush(&self) -> bool {
        let mut st = self.state.lock();
        let ok = self.flush_locked(
            &mut st,
            0,
            0,
            FlushFlags::CLEANIT | FlushFlags::ALLPAGES | FlushFlags::SYNCIO,
            IoContext::default(),
        );
        if st.refs == 1 {
            self.unregister_writeable(&mut st);
        }
        self.detach_locked(st);
        ok
    }

    /// Hands busy pages back to the pager.
    ///
    /// Pages marked released while the caller held them are freed here.
    pub fn release_pages(&self, pages: &[PageHandle], release: PageRelease) {
        let mut st = self.state.lock();
        for handle in pages {
            let key = handle.key();
            assert_eq!(key.pager, self.id, "page {key:?} released to the wrong pager");
            let Some(page) = st.pages.get_mut(&key.index) else {
                panic!("released page {key:?} is not resident");
            };
            assert!(page.busy, "released page {key:?} is not busy");
            if page.released {
                self.free_page_locked(&mut st, key.index);
                continue;
            }
            page.busy = false;
            if release.modified {
                page.clean = false;
            }
            match release.map {
                Protection::Unchanged => {}
                Protection::None => page.unmap(),
                Protection::Read => {
                    page.hw.mapped = true;
                    page.hw.writable = false;
                }
                Protection::ReadWrite => {
                    page.hw.mapped = true;
                    page.hw.writable = true;
                }
            }
            if page.wire_count == 0 {
                self.ctx.queues.lock().activate(key);
            }
        }
        drop(st);
        self.page_cv.notify_all();
    }

    /// Returns true when the page behind `handle` was released while busy.
    pub fn is_released(&self, handle: &PageHandle) -> bool {
        let st = self.state.lock();
        st.pages
            .get(&handle.key().index)
            .map_or(true, |page| page.released)
    }

    /// Stores through an existing writable mapping.
    ///
    /// Returns false when the page at `offset` is not mapped writable; the
    /// caller must then fault the page in through `get`.
    pub fn write_mapped(&self, offset: u64, f: impl FnOnce(&mut [u8])) -> bool {
        let index = offset / self.ctx.page_size as u64;
        let mut st = self.state.lock();
        let Some(page) = st.pages.get_mut(&index) else {
            return false;
        };
        if !page.hw.mapped || !page.hw.writable {
            return false;
        }
        page.hw.modified = true;
        let buf = Arc::clone(&page.buf);
        let mut data = buf.write();
        f(&mut data);
        true
    }

    /// Reads through an existing mapping; `None` when the page is not mapped.
    pub fn read_mapped<T>(&self, offset: u64, f: impl FnOnce(&[u8]) -> T) -> Option<T> {
        let index = offset / self.ctx.page_size as u64;
        let st = self.state.lock();
        let page = st.pages.get(&index).filter(|page| page.hw.mapped)?;
        let data = page.buf.read();
        Some(f(&data))
    }

    /// Wires the resident page at `offset`; wired pages leave the paging queues.
    pub fn wire(&self, offset: u64) -> bool {
        let index = offset / self.ctx.page_size as u64;
        let mut st = self.state.lock();
        let Some(page) = st.pages.get_mut(&index) else {
            return false;
        };
        page.wire_count += 1;
        self.ctx.queues.lock().remove(self.key(index));
        true
    }

    /// Drops one wiring of the page at `offset`.
    pub fn unwire(&self, offset: u64) -> bool {
        let index = offset / self.ctx.page_size as u64;
        let mut st = self.state.lock();
        let Some(page) = st.pages.get_mut(&index) else {
            return false;
        };
        if page.wire_count == 0 {
            return false;
        }
        page.wire_count -= 1;
        if page.wire_count == 0 {
            self.ctx.queues.lock().activate(self.key(index));
        }
        true
    }

    /// Frees a resident page and returns its frame to the pool.
    pub(super) fn free_page_locked(&self, st: &mut ObjectState, index: u64) {
        if st.pages.remove(&index).is_none() {
            return;
        }
        self.ctx.queues.lock().remove(self.key(index));
        self.ctx.frames.release(1);
        if st.pages.is_empty() {
            self.io_cv.notify_all();
        }
    }

    /// Wakes interruptible sleepers so they can observe a raised interrupt.
    pub(super) fn wake_sleepers(&self) {
        drop(self.state.lock());
        self.page_cv.notify_all();
    }
}

impl PagerOps for VnodePager {
    fn reference(&self) {
        let mut st = self.state.lock();
        assert!(st.is_valid(), "reference on pager {} that is not valid", self.id);
        st.refs += 1;
    }

    fn detach(&self) {
        let st = self.state.lock();
        self.detach_locked(st);
    }

    fn flush(&self, start: u64, stop: u64, flags: FlushFlags) -> bool {
        let mut st = self.state.lock();
        self.flush_locked(&mut st, start, stop, flags, IoContext::default())
    }

    fn get(
        &self,
        offset: u64,
        slots: &mut [Option<PageHandle>],
        center: usize,
        access: Access,
        advice: Advice,
        flags: GetFlags,
    ) -> PagerStatus {
        if flags.locked {
            self.get_locked(offset, slots, center, flags)
        } else {
            self.get_blocking(offset, slots, center, access, advice, flags)
        }
    }

    fn put(&self, pages: &[PageHandle], flags: FlushFlags) -> PagerStatus {
        self.put_pages(pages, flags)
    }

    fn cluster(&self, offset: u64) -> (u64, u64) {
        let st = self.state.lock();
        self.cluster_window(&st, offset)
    }
}
