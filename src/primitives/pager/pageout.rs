use smallvec::{smallvec, SmallVec};
use tracing::{debug, warn};

use super::io::Direction;
use super::ops::FlushFlags;
use super::page::PageHandle;
use super::state::ObjectState;
use super::vnode::{IoContext, ObjectGuard, VnodePager};
use crate::types::PagerStatus;

type Run = SmallVec<[u64; 16]>;

impl VnodePager {
    /// Cleans, deactivates or frees resident pages in `[start, stop)`.
    ///
    /// Called and returns with the object lock held; the lock is dropped
    /// around each write-back.
    pub(super) fn flush_locked(
        &self,
        st: &mut ObjectGuard<'_>,
        start: u64,
        stop: u64,
        flags: FlushFlags,
        ctx: IoContext,
    ) -> bool {
        let page_size = self.ctx.page_size as u64;
        let (first, last) = if flags.contains(FlushFlags::ALLPAGES) {
            (0, u64::MAX)
        } else {
            (start / page_size, stop.div_ceil(page_size))
        };
        if first >= last {
            return true;
        }

        let cleanit = flags.contains(FlushFlags::CLEANIT);
        let freeing = flags.contains(FlushFlags::FREE);
        let mut flags = flags;
        let mut retval = true;
        let mut need_iosync = false;

        if cleanit {
            for page in st.pages.range_mut(first..last).map(|(_, page)| page) {
                page.clean_checked = false;
            }
        }

        let mut cursor = first;
        while let Some(index) = st.pages.range(cursor..last).next().map(|(index, _)| *index) {
            cursor = index + 1;

            let needs_clean = {
                let Some(page) = st.pages.get_mut(&index) else {
                    continue;
                };
                if !cleanit || page.busy {
                    if page.busy && cleanit && flags.contains(FlushFlags::SYNCIO) {
                        need_iosync = true;
                    }
                    false
                } else {
                    if freeing {
                        page.unmap();
                    }
                    page.sync_clean();
                    !page.clean
                }
            };

            if !needs_clean {
                self.dispose_clean(st, index, flags);
                continue;
            }

            let run = self.collect_cluster(st, index, last);
            let mut status = self.io_locked(st, &run, flags.contains(FlushFlags::SYNCIO), Direction::Write, ctx);
            if status == PagerStatus::Again {
                flags |= FlushFlags::SYNCIO;
                status = self.io_locked(st, &run, true, Direction::Write, ctx);
            }
            if status != PagerStatus::Ok {
                warn!(
                    pager = %self.id(),
                    offset = self.page_offset(index),
                    pages = run.len(),
                    %status,
                    "vnpager.flush.write_error: changes may be lost"
                );
                retval = false;
            } else {
                debug!(
                    pager = %self.id(),
                    offset = self.page_offset(index),
                    pages = run.len(),
                    "vnpager.flush.cluster_written"
                );
            }

            for &done in &run {
                let released = match st.pages.get_mut(&done) {
                    Some(page) => {
                        page.busy = false;
                        page.clean = true;
                        if !freeing {
                            page.hw.modified = false;
                        }
                        page.released
                    }
                    None => continue,
                };
                if released {
                    self.free_page_locked(st, done);
                    continue;
                }
                self.dispose_clean(st, done, flags);
            }
            self.page_cv.notify_all();
        }

        if need_iosync {
            while st.nio != 0 {
                st.iosync = true;
                self.io_cv.wait(st);
            }
            if st.iosync_wanted {
                self.io_cv.notify_all();
            }
            st.iosync = false;
            st.iosync_wanted = false;
        }
        retval
    }

    /// Applies the deactivate/free policy to a page that needs no write-back.
    fn dispose_clean(&self, st: &mut ObjectState, index: u64, flags: FlushFlags) {
        let key = self.key(index);
        let Some(page) = st.pages.get_mut(&index) else {
            return;
        };
        if flags.contains(FlushFlags::DEACTIVATE) {
            if page.wire_count == 0 && !self.ctx.queues.lock().is_inactive(key) {
                page.unmap();
                self.ctx.queues.lock().deactivate(key);
            }
        } else if flags.contains(FlushFlags::FREE) {
            if page.busy {
                page.released = true;
            } else {
                page.unmap();
                self.free_page_locked(st, index);
            }
        }
    }

    /// Busies `index` and the dirty pages following it inside the cluster window.
    fn collect_cluster(&self, st: &mut ObjectState, index: u64, last: u64) -> Run {
        let page_size = self.ctx.page_size as u64;
        let offset = self.page_offset(index);
        let hi = if offset < st.size {
            self.cluster_window(st, offset).1.div_ceil(page_size).min(last)
        } else {
            index + 1
        };

        let mut run: Run = smallvec![index];
        if let Some(page) = st.pages.get_mut(&index) {
            page.busy = true;
            page.write_protect();
        }
        for next in index + 1..hi {
            let Some(page) = st.pages.get_mut(&next) else {
                break;
            };
            if page.busy {
                break;
            }
            if !page.clean_checked {
                page.sync_clean();
            }
            if page.clean {
                break;
            }
            page.busy = true;
            page.write_protect();
            run.push(next);
        }
        run
    }

    pub(super) fn cluster_window(&self, st: &ObjectState, offset: u64) -> (u64, u64) {
        assert!(
            offset < st.size,
            "cluster offset {offset} beyond object size {}",
            st.size
        );
        let page_size = self.ctx.page_size as u64;
        let end = st.size.div_ceil(page_size) * page_size;
        let hi = offset
            .saturating_add(self.ctx.options.cluster_bytes)
            .min(end);
        (offset, hi)
    }

    pub(super) fn put_pages(&self, pages: &[PageHandle], flags: FlushFlags) -> PagerStatus {
        let Some(first) = pages.first() else {
            return PagerStatus::Ok;
        };
        let run: Run = pages
            .iter()
            .enumerate()
            .map(|(i, handle)| {
                let key = handle.key();
                assert_eq!(key.pager, self.id(), "put of page {key:?} from another pager");
                assert_eq!(
                    key.index,
                    first.key().index + i as u64,
                    "put pages must be contiguous"
                );
                key.index
            })
            .collect();
        let mut st = self.state.lock();
        for index in &run {
            let busy = st.pages.get(index).is_some_and(|page| page.busy);
            assert!(busy, "put of page {index} that is not busy");
        }
        self.io_locked(
            &mut st,
            &run,
            flags.contains(FlushFlags::SYNCIO),
            Direction::Write,
            IoContext::default(),
        )
    }
}
