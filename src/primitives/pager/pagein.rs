use parking_lot::MutexGuard;
use tracing::debug;

use super::io::Direction;
use super::ops::{Access, Advice, GetFlags};
use super::page::{Page, PageHandle};
use super::vnode::{IoContext, VnodePager};
use crate::types::PagerStatus;

impl VnodePager {
    /// Claims already-resident pages without sleeping or doing I/O.
    pub(super) fn get_locked(
        &self,
        offset: u64,
        slots: &mut [Option<PageHandle>],
        center: usize,
        flags: GetFlags,
    ) -> PagerStatus {
        let first = self.first_index(offset);
        let mut st = self.state.lock();
        let mut done = true;
        for (lcv, slot) in slots.iter_mut().enumerate() {
            if slot.is_some() {
                continue;
            }
            let index = first + lcv as u64;
            match st.pages.get_mut(&index) {
                Some(page) if !page.busy => {
                    page.busy = true;
                    *slot = self.handle(&st, index);
                }
                _ => {
                    if lcv == center || flags.all_pages {
                        done = false;
                    }
                }
            }
        }
        if done {
            PagerStatus::Ok
        } else {
            PagerStatus::Unlock
        }
    }

    /// Fills the requested slots, sleeping on busy pages and reading missing ones.
    ///
    /// Pages already placed into `slots` stay busy for the caller even when a
    /// later slot fails; the caller releases them.
    pub(super) fn get_blocking(
        &self,
        offset: u64,
        slots: &mut [Option<PageHandle>],
        center: usize,
        access: Access,
        advice: Advice,
        flags: GetFlags,
    ) -> PagerStatus {
        let first = self.first_index(offset);
        let seen = self.ctx.interrupts.generation();
        let mut st = self.state.lock();

        for lcv in 0..slots.len() {
            if slots[lcv].is_some() || (lcv != center && !flags.all_pages) {
                continue;
            }
            let index = first + lcv as u64;

            let fresh = loop {
                match st.pages.get_mut(&index) {
                    None => {
                        if self.ctx.frames.try_alloc() {
                            st.pages.insert(index, Page::fresh(self.ctx.page_size));
                            break true;
                        }
                        debug!(pager = %self.id(), index, "vnpager.get.wait_frame");
                        let waited = MutexGuard::unlocked(&mut st, || {
                            self.ctx.frames.wait_for_free(&self.ctx.interrupts, seen)
                        });
                        if waited.is_err() {
                            return PagerStatus::Interrupted;
                        }
                    }
                    Some(page) if page.busy => {
                        if self.ctx.interrupts.check(seen).is_err() {
                            return PagerStatus::Interrupted;
                        }
                        self.page_cv.wait(&mut st);
                    }
                    Some(page) => {
                        page.busy = true;
                        break false;
                    }
                }
                if self.ctx.interrupts.check(seen).is_err() {
                    return PagerStatus::Interrupted;
                }
            };

            if fresh {
                let status = self.io_locked(&mut st, &[index], true, Direction::Read, IoContext::default());
                if status != PagerStatus::Ok {
                    debug!(
                        pager = %self.id(),
                        index,
                        %status,
                        ?access,
                        ?advice,
                        "vnpager.get.read_failed"
                    );
                    self.free_page_locked(&mut st, index);
                    drop(st);
                    self.page_cv.notify_all();
                    return status;
                }
                if let Some(page) = st.pages.get_mut(&index) {
                    page.fake = false;
                    page.clean = true;
                    page.hw.modified = false;
                }
            }
            slots[lcv] = self.handle(&st, index);
        }
        PagerStatus::Ok
    }

    fn first_index(&self, offset: u64) -> u64 {
        let page_size = self.ctx.page_size as u64;
        assert!(
            offset % page_size == 0,
            "page-in offset {offset} is not page aligned"
        );
        offset / page_size
    }
}
