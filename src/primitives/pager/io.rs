use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::MutexGuard;
use smallvec::SmallVec;
use tracing::{debug, warn};

use super::page::PageBuf;
use super::vnode::{IoContext, ObjectGuard, VnodePager};
use crate::primitives::concurrency::ScratchWindow;
use crate::types::{PagerStatus, Result, VnError};

const FILE_LOCK_RETRY: Duration = Duration::from_millis(1);

/// Direction of a transfer between pages and the backing file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Direction {
    Read,
    Write,
}

/// Outcome of taking the file lock for a transfer.
enum FileLock {
    Taken,
    HeldByCaller,
    Teardown,
}

/// One contiguous run of busy pages moving through the scratch window.
struct PendingIo {
    bufs: SmallVec<[PageBuf; 16]>,
    file_offset: u64,
    wanted: usize,
    direction: Direction,
}

impl VnodePager {
    /// Moves a run of busy, contiguous pages to or from the file.
    ///
    /// Entered and left with the object lock held; the lock is dropped for
    /// the transfer itself. With `sync` false the call never sleeps and
    /// answers `Again` instead.
    pub(super) fn io_locked(
        &self,
        st: &mut ObjectGuard<'_>,
        run: &[u64],
        sync: bool,
        direction: Direction,
        ctx: IoContext,
    ) -> PagerStatus {
        let Some(&first) = run.first() else {
            return PagerStatus::Ok;
        };

        while st.iosync {
            if !sync {
                return PagerStatus::Again;
            }
            st.iosync_wanted = true;
            self.io_cv.wait(st);
        }

        let file_offset = self.page_offset(first);
        if file_offset >= st.size {
            debug!(pager = %self.id(), file_offset, size = st.size, "vnpager.io.past_eof");
            return PagerStatus::Bad;
        }
        if st.is_revoked() {
            return PagerStatus::Error;
        }

        let page_size = self.ctx.page_size;
        let window = self.ctx.scratch.try_map(run.len(), page_size);
        if window.is_none() && !sync {
            return PagerStatus::Again;
        }

        let bufs: SmallVec<[PageBuf; 16]> = run
            .iter()
            .map(|index| {
                let page = st
                    .pages
                    .get(index)
                    .expect("pages under I/O stay resident while busy");
                debug_assert!(page.busy, "I/O on a page that is not busy");
                Arc::clone(&page.buf)
            })
            .collect();
        let pending = PendingIo {
            wanted: (run.len() * page_size).min((st.size - file_offset) as usize),
            bufs,
            file_offset,
            direction,
        };

        st.nio += 1;
        let status = MutexGuard::unlocked(st, || self.transfer(window, pending, ctx));
        st.nio -= 1;
        if st.nio == 0 && (st.iosync || st.is_dying()) {
            self.io_cv.notify_all();
        }
        status
    }

    /// Polls for the file lock, giving up once a terminate is draining.
    ///
    /// A terminate holds the file lock while it waits for `nio` to reach zero.
    fn acquire_file_lock(&self) -> Result<FileLock> {
        loop {
            match self.file().try_lock_exclusive() {
                Ok(true) => return Ok(FileLock::Taken),
                Ok(false) => {}
                Err(VnError::LockRecursion) => return Ok(FileLock::HeldByCaller),
                Err(err) => return Err(err),
            }
            if self.state.lock().terminating {
                return Ok(FileLock::Teardown);
            }
            thread::sleep(FILE_LOCK_RETRY);
        }
    }

    fn transfer(&self, window: Option<ScratchWindow>, io: PendingIo, ctx: IoContext) -> PagerStatus {
        let page_size = self.ctx.page_size;
        let mut window =
            window.unwrap_or_else(|| self.ctx.scratch.map(io.bufs.len(), page_size));

        if io.direction == Direction::Write {
            let dst = window.as_mut_slice();
            for (i, buf) in io.bufs.iter().enumerate() {
                dst[i * page_size..(i + 1) * page_size].copy_from_slice(&buf.read());
            }
        }

        let took_lock = if ctx.file_locked {
            false
        } else {
            match self.acquire_file_lock() {
                Ok(FileLock::Taken) => true,
                Ok(FileLock::HeldByCaller) => false,
                Ok(FileLock::Teardown) => {
                    debug!(pager = %self.id(), offset = io.file_offset, "vnpager.io.lock_abandoned");
                    return PagerStatus::Error;
                }
                Err(err) => {
                    warn!(pager = %self.id(), error = %err, "vnpager.io.lock_failed");
                    return PagerStatus::Error;
                }
            }
        };
        let outcome = match io.direction {
            Direction::Read => self
                .file()
                .read_at(io.file_offset, &mut window.as_mut_slice()[..io.wanted]),
            Direction::Write => self
                .file()
                .write_at(io.file_offset, &window.as_slice()[..io.wanted]),
        };
        if took_lock {
            if let Err(err) = self.file().unlock() {
                warn!(pager = %self.id(), error = %err, "vnpager.io.unlock_failed");
            }
        }

        let got = match outcome {
            Ok(got) => got,
            Err(err) => {
                debug!(
                    pager = %self.id(),
                    offset = io.file_offset,
                    direction = ?io.direction,
                    error = %err,
                    "vnpager.io.failed"
                );
                return PagerStatus::Error;
            }
        };
        if io.wanted > 0 && got == 0 {
            debug!(
                pager = %self.id(),
                offset = io.file_offset,
                direction = ?io.direction,
                "vnpager.io.zero_transfer"
            );
            return PagerStatus::Error;
        }

        if io.direction == Direction::Read {
            let src = window.as_mut_slice();
            let from = got.min(src.len());
            src[from..].fill(0);
            for (i, buf) in io.bufs.iter().enumerate() {
                buf.write()
                    .copy_from_slice(&src[i * page_size..(i + 1) * page_size]);
            }
        }
        PagerStatus::Ok
    }
}
