#![forbid(unsafe_code)]

mod io;
mod ops;
mod options;
mod page;
mod pagein;
mod pageout;
mod queues;
mod state;
mod system;
mod vnode;

pub use ops::{Access, Advice, FlushFlags, GetFlags, PagerOps};
pub use options::{PagerOptions, DEFAULT_CLUSTER_BYTES, DEFAULT_PAGE_SIZE};
pub use page::{PageHandle, PageRelease, Protection};
pub use state::PagerPhase;
pub use system::{PagerSystem, SyncReport, SystemStats};
pub use vnode::{PagerSnapshot, VnodePager};
