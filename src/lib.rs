//! File-backed virtual-memory pager.
//!
//! Binds memory objects to backing files: pages are filled from the file on
//! demand, dirty pages are clustered and written back, and the pager follows
//! the file's size and lifetime.

#![warn(missing_docs)]

pub mod primitives;
pub mod types;

pub use primitives::io::{BackingFile, FileKind, MemFile, StdBackingFile};
pub use primitives::pager::{
    Access, Advice, FlushFlags, GetFlags, PageHandle, PageRelease, PagerOps, PagerOptions,
    PagerPhase, PagerSnapshot, PagerSystem, Protection, SyncReport, SystemStats, VnodePager,
};
pub use types::{AttachError, FileId, MountId, PageKey, PagerId, PagerStatus, Result, VnError};
