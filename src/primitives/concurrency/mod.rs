//! Blocking coordination primitives used by the pager and its backing files.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::types::{Result, VnError};

/// Exclusive, non-recursive lock owned by a thread rather than a guard.
///
/// Models a vnode lock: `lock` and `unlock` are separate calls that may be
/// issued from different stack frames, and a thread that already owns the
/// lock gets [`VnError::LockRecursion`] instead of deadlocking on itself.
#[derive(Default)]
pub struct OwnerLock {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

impl OwnerLock {
    /// Creates an unlocked lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the lock is acquired by the calling thread.
    pub fn lock(&self) -> Result<()> {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        if *owner == Some(me) {
            return Err(VnError::LockRecursion);
        }
        while owner.is_some() {
            self.released.wait(&mut owner);
        }
        *owner = Some(me);
        Ok(())
    }

    /// Acquires the lock only if it is free.
    pub fn try_lock(&self) -> Result<bool> {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        match *owner {
            Some(current) if current == me => Err(VnError::LockRecursion),
            Some(_) => Ok(false),
            None => {
                *owner = Some(me);
                Ok(true)
            }
        }
    }

    /// Releases the lock; fails when the calling thread does not own it.
    pub fn unlock(&self) -> Result<()> {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        if *owner != Some(me) {
            return Err(VnError::Invalid("unlock of a lock not held by this thread"));
        }
        *owner = None;
        drop(owner);
        self.released.notify_one();
        Ok(())
    }

    /// Returns true when the calling thread owns the lock.
    pub fn held_by_current(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }

    /// Returns true when any thread owns the lock.
    pub fn is_locked(&self) -> bool {
        self.owner.lock().is_some()
    }
}

/// Generation counter used to abort interruptible sleeps.
///
/// A sleeper records the generation before waiting; if it has moved on when
/// the sleeper wakes, the sleep was interrupted.
#[derive(Default)]
pub struct Interrupts {
    generation: AtomicU64,
}

impl Interrupts {
    /// Returns the current generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Advances the generation, interrupting every sleeper that observed an older one.
    pub fn raise(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Fails with [`VnError::Interrupted`] when `seen` is stale.
    pub fn check(&self, seen: u64) -> Result<()> {
        if self.generation() != seen {
            Err(VnError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Bounded scratch address window used to make a run of pages contiguous for one transfer.
pub struct ScratchMap {
    inner: Arc<ScratchInner>,
}

struct ScratchInner {
    capacity: usize,
    in_use: Mutex<usize>,
    freed: Condvar,
}

/// Pages mapped into the scratch window; the mapping is torn down on drop.
pub struct ScratchWindow {
    inner: Arc<ScratchInner>,
    pages: usize,
    buf: Vec<u8>,
}

impl ScratchMap {
    /// Creates a window able to hold `capacity` pages at once.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(ScratchInner {
                capacity: capacity.max(1),
                in_use: Mutex::new(0),
                freed: Condvar::new(),
            }),
        }
    }

    /// Maps `pages` pages of `page_size` bytes without sleeping.
    pub fn try_map(&self, pages: usize, page_size: usize) -> Option<ScratchWindow> {
        let mut in_use = self.inner.in_use.lock();
        if *in_use + pages > self.inner.capacity {
            return None;
        }
        *in_use += pages;
        drop(in_use);
        Some(self.window(pages, page_size))
    }

    /// Maps `pages` pages, sleeping until enough of the window is free.
    pub fn map(&self, pages: usize, page_size: usize) -> ScratchWindow {
        assert!(
            pages <= self.inner.capacity,
            "scratch request larger than the whole window"
        );
        let mut in_use = self.inner.in_use.lock();
        while *in_use + pages > self.inner.capacity {
            self.inner.freed.wait(&mut in_use);
        }
        *in_use += pages;
        drop(in_use);
        self.window(pages, page_size)
    }

    /// Returns the number of pages currently mapped.
    pub fn in_use(&self) -> usize {
        *self.inner.in_use.lock()
    }

    /// Returns the window size in pages.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    fn window(&self, pages: usize, page_size: usize) -> ScratchWindow {
        ScratchWindow {
            inner: Arc::clone(&self.inner),
            pages,
            buf: vec![0u8; pages * page_size],
        }
    }
}

impl ScratchWindow {
    /// Contiguous view of the mapped pages.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable contiguous view of the mapped pages.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for ScratchWindow {
    fn drop(&mut self) {
        let mut in_use = self.inner.in_use.lock();
        *in_use = in_use.saturating_sub(self.pages);
        drop(in_use);
        self.inner.freed.notify_all();
    }
}
