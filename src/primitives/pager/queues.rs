use std::collections::BTreeSet;

use parking_lot::{Condvar, Mutex};

use crate::primitives::concurrency::Interrupts;
use crate::types::{PageKey, Result};

/// Global active/inactive page queues.
///
/// Guarded by the page-queue lock, which nests inside any object lock.
#[derive(Default)]
pub(crate) struct PageQueues {
    active: BTreeSet<PageKey>,
    inactive: BTreeSet<PageKey>,
}

impl PageQueues {
    pub fn activate(&mut self, key: PageKey) {
        self.inactive.remove(&key);
        self.active.insert(key);
    }

    /// Moves the page to the inactive queue; false if it already was there.
    pub fn deactivate(&mut self, key: PageKey) -> bool {
        self.active.remove(&key);
        self.inactive.insert(key)
    }

    pub fn remove(&mut self, key: PageKey) {
        self.active.remove(&key);
        self.inactive.remove(&key);
    }

    pub fn is_inactive(&self, key: PageKey) -> bool {
        self.inactive.contains(&key)
    }

    pub fn is_active(&self, key: PageKey) -> bool {
        self.active.contains(&key)
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn inactive_len(&self) -> usize {
        self.inactive.len()
    }
}

/// Bounded pool of page frames shared by every pager.
pub(crate) struct FramePool {
    capacity: usize,
    free: Mutex<usize>,
    freed: Condvar,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: Mutex::new(capacity),
            freed: Condvar::new(),
        }
    }

    /// Takes one frame if any is free.
    pub fn try_alloc(&self) -> bool {
        let mut free = self.free.lock();
        if *free == 0 {
            return false;
        }
        *free -= 1;
        true
    }

    /// Returns `count` frames to the pool and wakes waiters.
    pub fn release(&self, count: usize) {
        let mut free = self.free.lock();
        *free = (*free + count).min(self.capacity);
        drop(free);
        self.freed.notify_all();
    }

    /// Sleeps until a frame is free; does not allocate it.
    pub fn wait_for_free(&self, interrupts: &Interrupts, seen: u64) -> Result<()> {
        let mut free = self.free.lock();
        loop {
            if *free > 0 {
                return Ok(());
            }
            interrupts.check(seen)?;
            self.freed.wait(&mut free);
        }
    }

    /// Wakes every sleeper so it can observe an interrupt.
    pub fn wake_all(&self) {
        drop(self.free.lock());
        self.freed.notify_all();
    }

    pub fn free(&self) -> usize {
        *self.free.lock()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
