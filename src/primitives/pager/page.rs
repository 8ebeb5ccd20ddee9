use std::fmt;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::PageKey;

pub(crate) type PageBuf = Arc<RwLock<Box<[u8]>>>;

/// Hardware mapping state of a resident page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct HwMapping {
    pub mapped: bool,
    pub writable: bool,
    pub modified: bool,
}

/// A resident page owned by one pager at one page index.
///
/// All flags are guarded by the owning pager's object lock. The buffer sits
/// behind its own lock so transfers can move bytes with the object lock
/// dropped while `busy` pins the page's identity.
pub(crate) struct Page {
    pub buf: PageBuf,
    pub busy: bool,
    pub clean: bool,
    pub released: bool,
    pub fake: bool,
    pub clean_checked: bool,
    pub wire_count: u32,
    pub hw: HwMapping,
}

impl Page {
    /// Freshly allocated page, busy for the allocator and not yet filled.
    pub fn fresh(page_size: usize) -> Self {
        Self {
            buf: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
            busy: true,
            clean: true,
            released: false,
            fake: true,
            clean_checked: false,
            wire_count: 0,
            hw: HwMapping::default(),
        }
    }

    /// Removes every hardware mapping; the modified attribute survives.
    pub fn unmap(&mut self) {
        self.hw.mapped = false;
        self.hw.writable = false;
    }

    /// Downgrades mappings to read-only so stores fault while the page is written out.
    pub fn write_protect(&mut self) {
        self.hw.writable = false;
    }

    /// Pulls the hardware modified bit into `clean`.
    pub fn sync_clean(&mut self) {
        if self.hw.modified {
            self.clean = false;
        }
        self.clean_checked = true;
    }

    pub fn is_dirty(&self) -> bool {
        !self.clean || self.hw.modified
    }
}

/// Hardware protection to install when releasing a page back to the object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Protection {
    /// Leave existing mappings untouched.
    #[default]
    Unchanged,
    /// Remove every mapping.
    None,
    /// Map read-only.
    Read,
    /// Map read-write.
    ReadWrite,
}

/// How a caller hands a busy page back to its pager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageRelease {
    /// The caller changed the page contents.
    pub modified: bool,
    /// Mapping to install for the page.
    pub map: Protection,
}

impl PageRelease {
    /// Release without modification or mapping changes.
    pub const CLEAN: Self = Self {
        modified: false,
        map: Protection::Unchanged,
    };

    /// Release a page the caller wrote to.
    pub const DIRTY: Self = Self {
        modified: true,
        map: Protection::Unchanged,
    };

    /// Release and install a hardware mapping.
    pub fn mapped(map: Protection) -> Self {
        Self {
            modified: false,
            map,
        }
    }
}

/// Caller's handle on a page it holds busy.
///
/// The handle carries the page buffer, so the contents can be read or
/// written without the pager's object lock. It must be handed back through
/// [`VnodePager::release_pages`](super::VnodePager::release_pages).
#[derive(Clone)]
pub struct PageHandle {
    key: PageKey,
    offset: u64,
    buf: PageBuf,
}

impl PageHandle {
    pub(crate) fn new(key: PageKey, offset: u64, buf: PageBuf) -> Self {
        Self { key, offset, buf }
    }

    /// Arena key of the page.
    pub fn key(&self) -> PageKey {
        self.key
    }

    /// File offset of the first byte in the page.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Shared view of the page contents.
    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.buf.read()
    }

    /// Exclusive view of the page contents.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.buf.write()
    }
}

impl fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHandle")
            .field("key", &self.key)
            .field("offset", &self.offset)
            .finish()
    }
}
