use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use super::ops::Access;
use super::options::PagerOptions;
use super::queues::{FramePool, PageQueues};
use super::vnode::VnodePager;
use crate::primitives::concurrency::{Interrupts, ScratchMap};
use crate::primitives::io::BackingFile;
use crate::types::{FileId, MountId, PagerId, Result};

/// Resources shared by every pager of one system.
pub(crate) struct PagerContext {
    pub options: PagerOptions,
    pub page_size: usize,
    pub registry: SyncRegistry,
    pub queues: Mutex<PageQueues>,
    pub frames: FramePool,
    pub scratch: ScratchMap,
    pub interrupts: Interrupts,
}

/// Pagers that may hold dirty pages, plus the lock serialising sync passes.
#[derive(Default)]
pub(crate) struct SyncRegistry {
    writeable: Mutex<BTreeMap<PagerId, Weak<VnodePager>>>,
    pass: Mutex<()>,
}

impl SyncRegistry {
    pub fn insert(&self, id: PagerId, pager: Weak<VnodePager>) {
        self.writeable.lock().insert(id, pager);
    }

    pub fn remove(&self, id: PagerId) {
        self.writeable.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.writeable.lock().len()
    }

    fn snapshot(&self) -> Vec<Arc<VnodePager>> {
        self.writeable
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

/// Outcome of one [`PagerSystem::sync`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Pagers on the writeable list when the pass started.
    pub scanned: usize,
    /// Pagers flushed by the pass.
    pub flushed: usize,
    /// Pagers whose flush reported a write-back failure.
    pub failed: usize,
}

/// System-wide counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SystemStats {
    /// Pagers known to the system.
    pub pagers: usize,
    /// Pagers on the writeable list.
    pub writeable: usize,
    /// Pages on the active queue.
    pub active: usize,
    /// Pages on the inactive queue.
    pub inactive: usize,
    /// Unallocated page frames.
    pub free_frames: usize,
    /// Pages currently mapped in the scratch window.
    pub scratch_in_use: usize,
}

/// Owner of every vnode pager and the resources they share.
///
/// There is one pager per backing file identity. It is created by the first
/// attach and lives until [`forget`](Self::forget), the way a pager lives
/// inside its vnode.
pub struct PagerSystem {
    ctx: Arc<PagerContext>,
    pagers: Mutex<HashMap<FileId, Arc<VnodePager>>>,
    next_id: AtomicU64,
}

impl PagerSystem {
    /// Creates a system after validating `options`.
    pub fn new(options: PagerOptions) -> Result<Self> {
        options.validate()?;
        let ctx = PagerContext {
            page_size: options.page_size as usize,
            registry: SyncRegistry::default(),
            queues: Mutex::new(PageQueues::default()),
            frames: FramePool::new(options.frame_pool_pages),
            scratch: ScratchMap::new(options.scratch_pages),
            interrupts: Interrupts::default(),
            options,
        };
        info!(
            page_size = ctx.page_size,
            cluster_bytes = ctx.options.cluster_bytes,
            frames = ctx.options.frame_pool_pages,
            "vnpager.system.open"
        );
        Ok(Self {
            ctx: Arc::new(ctx),
            pagers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Options the system was built with.
    pub fn options(&self) -> &PagerOptions {
        &self.ctx.options
    }

    /// Attaches to the pager of `file`, creating and initialising it as needed.
    pub fn attach(&self, file: Arc<dyn BackingFile>, access: Access) -> Result<Arc<VnodePager>> {
        let pager = {
            let mut pagers = self.pagers.lock();
            let id = file.id();
            Arc::clone(pagers.entry(id).or_insert_with(|| {
                let pager_id = PagerId(self.next_id.fetch_add(1, Ordering::Relaxed));
                VnodePager::new(pager_id, file, Arc::clone(&self.ctx))
            }))
        };
        pager.attach(access)?;
        Ok(pager)
    }

    /// Returns the pager of `file`, if one was ever created.
    pub fn lookup(&self, file: FileId) -> Option<Arc<VnodePager>> {
        self.pagers.lock().get(&file).cloned()
    }

    /// Forcibly tears down the pager of a file being recycled.
    ///
    /// The caller holds the file lock. Live references survive with a
    /// revoked pager on which every further transfer fails.
    pub fn terminate(&self, file: FileId) {
        if let Some(pager) = self.lookup(file) {
            pager.terminate();
        }
    }

    /// Records a new file size, discarding pages past a shrunk end.
    pub fn setsize(&self, file: FileId, new_size: u64) {
        if let Some(pager) = self.lookup(file) {
            pager.setsize(new_size);
        }
    }

    /// Stops `file`'s pager from persisting and tears it down when unreferenced.
    ///
    /// Returns true when no pager remains alive for the file. The caller
    /// holds the file lock; it is released and retaken around the teardown.
    pub fn uncache(&self, file: FileId) -> bool {
        match self.lookup(file) {
            Some(pager) => pager.uncache(),
            None => true,
        }
    }

    /// Writes back every writeable pager, optionally only those on `mount`.
    pub fn sync(&self, mount: Option<MountId>) -> SyncReport {
        let _pass = self.ctx.registry.pass.lock();
        let listed = self.ctx.registry.snapshot();
        let mut report = SyncReport {
            scanned: listed.len(),
            ..SyncReport::default()
        };

        let queued: Vec<_> = listed
            .into_iter()
            .filter(|pager| mount.map_or(true, |mount| pager.file().mount() == mount))
            .filter(|pager| pager.sync_reference())
            .collect();

        for pager in queued {
            report.flushed += 1;
            if !pager.sync_flush() {
                report.failed += 1;
            }
        }
        debug!(
            mount = ?mount,
            scanned = report.scanned,
            flushed = report.flushed,
            failed = report.failed,
            "vnpager.sync.done"
        );
        report
    }

    /// Interrupts every interruptible sleep in progress.
    pub fn interrupt(&self) {
        self.ctx.interrupts.raise();
        self.ctx.frames.wake_all();
        let pagers: Vec<_> = self.pagers.lock().values().cloned().collect();
        for pager in pagers {
            pager.wake_sleepers();
        }
    }

    /// Drops the pager of a reclaimed file; refused while it is not uninitialised.
    pub fn forget(&self, file: FileId) -> bool {
        let mut pagers = self.pagers.lock();
        let idle = pagers
            .get(&file)
            .is_some_and(|pager| pager.phase() == super::PagerPhase::Uninitialized);
        if idle {
            pagers.remove(&file);
        }
        idle
    }

    /// System-wide counters.
    pub fn stats(&self) -> SystemStats {
        let pagers = self.pagers.lock().len();
        let (active, inactive) = {
            let queues = self.ctx.queues.lock();
            (queues.active_len(), queues.inactive_len())
        };
        SystemStats {
            pagers,
            writeable: self.ctx.registry.len(),
            active,
            inactive,
            free_frames: self.ctx.frames.free(),
            scratch_in_use: self.ctx.scratch.in_use(),
        }
    }

    /// Capacity of the frame pool.
    pub fn frame_capacity(&self) -> usize {
        self.ctx.frames.capacity()
    }
}
