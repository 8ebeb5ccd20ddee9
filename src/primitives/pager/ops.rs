use bitflags::bitflags;

use crate::types::PagerStatus;

use super::page::PageHandle;

bitflags! {
    /// Policy flags for [`PagerOps::flush`] and [`PagerOps::put`].
    #[derive(Default)]
    pub struct FlushFlags: u8 {
        /// Ignore the range and visit every resident page.
        const ALLPAGES   = 1 << 0;
        /// Write dirty pages back to the file.
        const CLEANIT    = 1 << 1;
        /// Free pages after cleaning.
        const FREE       = 1 << 2;
        /// Move clean pages to the inactive queue.
        const DEACTIVATE = 1 << 3;
        /// Transfers must complete before returning.
        const SYNCIO     = 1 << 4;
    }
}

/// Access the faulting caller intends to perform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Access {
    /// Read-only access.
    #[default]
    Read,
    /// Read and write access.
    ReadWrite,
}

impl Access {
    /// Returns true when writes are requested.
    pub fn allows_write(self) -> bool {
        matches!(self, Access::ReadWrite)
    }
}

/// Access-pattern hint attached to a page-in request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Advice {
    /// No particular pattern.
    #[default]
    Normal,
    /// Pages will be touched in increasing order.
    Sequential,
    /// Pages will be touched in no useful order.
    Random,
}

/// Mode flags for [`PagerOps::get`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GetFlags {
    /// The caller holds the object lock and must not sleep.
    pub locked: bool,
    /// Every empty slot is required, not just the center one.
    pub all_pages: bool,
}

impl GetFlags {
    /// Blocking lookup of the center page only.
    pub const CENTER: Self = Self {
        locked: false,
        all_pages: false,
    };
    /// Blocking lookup of every empty slot.
    pub const ALL: Self = Self {
        locked: false,
        all_pages: true,
    };
    /// Non-sleeping lookup of the center page.
    pub const LOCKED: Self = Self {
        locked: true,
        all_pages: false,
    };
}

/// Operations the VM system invokes on a pager.
pub trait PagerOps: Send + Sync {
    /// Adds a reference to a valid pager.
    fn reference(&self);

    /// Drops a reference; the last one persists or destroys the pager.
    fn detach(&self);

    /// Cleans, deactivates or frees the pages in `[start, stop)`.
    ///
    /// Returns false when some write-back failed.
    fn flush(&self, start: u64, stop: u64, flags: FlushFlags) -> bool;

    /// Fills `slots` with busy pages starting at `offset`.
    fn get(
        &self,
        offset: u64,
        slots: &mut [Option<PageHandle>],
        center: usize,
        access: Access,
        advice: Advice,
        flags: GetFlags,
    ) -> PagerStatus;

    /// Writes out a contiguous run of busy pages.
    fn put(&self, pages: &[PageHandle], flags: FlushFlags) -> PagerStatus;

    /// Byte range a write-back starting at `offset` may cover.
    fn cluster(&self, offset: u64) -> (u64, u64);
}
