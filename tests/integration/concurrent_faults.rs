#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use vnpager::{
    Access, Advice, FileId, FlushFlags, GetFlags, MemFile, PageRelease, PagerOps, PagerOptions,
    PagerPhase, PagerStatus, PagerSystem, Result,
};

const PAGE: usize = 4096;
const PAGES: usize = 32;
const THREADS: usize = 4;
const LANE: usize = 64;
const ROUNDS: usize = 400;

fn system() -> PagerSystem {
    PagerSystem::new(PagerOptions {
        page_size: PAGE as u32,
        cluster_bytes: 8 * PAGE as u64,
        frame_pool_pages: 2 * PAGES,
        scratch_pages: 32,
    })
    .expect("valid options")
}

#[test]
fn faults_and_flushes_never_share_a_busy_page() -> Result<()> {
    let system = Arc::new(system());
    let file = Arc::new(MemFile::with_contents(FileId(1), vec![0; PAGE * PAGES]));
    let pager = system.attach(file.clone(), Access::ReadWrite)?;
    let held: Arc<Vec<AtomicBool>> = Arc::new((0..PAGES).map(|_| AtomicBool::new(false)).collect());
    let start = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|lane| {
            let pager = Arc::clone(&pager);
            let held = Arc::clone(&held);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                let mut rng = ChaCha8Rng::seed_from_u64(0x5eed + lane as u64);
                let mut last = vec![0u8; PAGES];
                start.wait();
                for round in 0..ROUNDS {
                    if rng.gen_ratio(1, 10) {
                        let flags = if rng.gen_bool(0.5) {
                            FlushFlags::CLEANIT | FlushFlags::ALLPAGES
                        } else {
                            FlushFlags::CLEANIT | FlushFlags::DEACTIVATE | FlushFlags::ALLPAGES
                        };
                        assert!(pager.flush(0, 0, flags));
                        continue;
                    }

                    let index = rng.gen_range(0..PAGES);
                    let mut slots = vec![None];
                    let status = pager.get(
                        (index * PAGE) as u64,
                        &mut slots,
                        0,
                        Access::ReadWrite,
                        Advice::Random,
                        GetFlags::CENTER,
                    );
                    assert_eq!(status, PagerStatus::Ok);
                    assert!(
                        !held[index].swap(true, Ordering::AcqRel),
                        "page {index} handed out twice"
                    );
                    let pages: Vec<_> = slots.into_iter().flatten().collect();
                    let value = (round % 250) as u8 + 1;
                    {
                        let mut data = pages[0].data_mut();
                        assert!(
                            data[lane * LANE..(lane + 1) * LANE]
                                .iter()
                                .all(|b| *b == last[index]),
                            "lane {lane} of page {index} lost an update"
                        );
                        data[lane * LANE..(lane + 1) * LANE].fill(value);
                    }
                    last[index] = value;
                    held[index].store(false, Ordering::Release);
                    pager.release_pages(&pages, PageRelease::DIRTY);
                }
                last
            })
        })
        .collect();

    let finals: Vec<Vec<u8>> = workers
        .into_iter()
        .map(|worker| worker.join().expect("worker panicked"))
        .collect();

    assert!(pager.flush(0, 0, FlushFlags::CLEANIT | FlushFlags::ALLPAGES | FlushFlags::SYNCIO));
    assert_eq!(pager.stats().dirty, 0);
    assert_eq!(pager.stats().nio, 0);
    let contents = file.contents();
    for (lane, last) in finals.iter().enumerate() {
        for (index, value) in last.iter().enumerate() {
            let base = index * PAGE + lane * LANE;
            assert!(
                contents[base..base + LANE].iter().all(|b| b == value),
                "lane {lane} of page {index} not written back"
            );
        }
    }
    assert_eq!(system.stats().scratch_in_use, 0);
    Ok(())
}

#[test]
fn attach_detach_and_sync_race_to_a_persisting_pager() -> Result<()> {
    let system = Arc::new(system());
    let file = Arc::new(MemFile::with_contents(FileId(2), vec![0; PAGE * 8]));
    let start = Arc::new(Barrier::new(THREADS + 1));

    let workers: Vec<_> = (0..THREADS)
        .map(|worker| {
            let system = Arc::clone(&system);
            let file = file.clone();
            let start = Arc::clone(&start);
            thread::spawn(move || -> Result<()> {
                let mut rng = ChaCha8Rng::seed_from_u64(worker as u64);
                start.wait();
                for _ in 0..100 {
                    let pager = system.attach(file.clone(), Access::ReadWrite)?;
                    let offset = (rng.gen_range(0..8) * PAGE) as u64;
                    let mut slots = vec![None];
                    let status = pager.get(
                        offset,
                        &mut slots,
                        0,
                        Access::ReadWrite,
                        Advice::Normal,
                        GetFlags::CENTER,
                    );
                    assert_eq!(status, PagerStatus::Ok);
                    let pages: Vec<_> = slots.into_iter().flatten().collect();
                    pages[0].data_mut()[worker] = worker as u8 + 1;
                    pager.release_pages(&pages, PageRelease::DIRTY);
                    pager.detach();
                }
                Ok(())
            })
        })
        .collect();

    let syncer = {
        let system = Arc::clone(&system);
        thread::spawn(move || {
            start.wait();
            for _ in 0..50 {
                system.sync(None);
                thread::yield_now();
            }
        })
    };

    for worker in workers {
        worker.join().expect("worker panicked")?;
    }
    syncer.join().expect("sync thread panicked");

    let pager = system.lookup(FileId(2)).expect("pager exists");
    assert_eq!(pager.refs(), 0);
    assert_eq!(pager.phase(), PagerPhase::Persisting);
    assert_eq!(file.counters().durable_refs, 0);
    assert_eq!(pager.stats().generation, 1);

    assert!(pager.flush(0, 0, FlushFlags::CLEANIT | FlushFlags::ALLPAGES | FlushFlags::SYNCIO));
    assert_eq!(pager.stats().dirty, 0);
    let contents = file.contents();
    for worker in 0..THREADS {
        let touched = (0..8).any(|index| contents[index * PAGE + worker] == worker as u8 + 1);
        assert!(touched, "worker {worker} stores never reached the file");
    }
    Ok(())
}

#[test]
fn interrupt_wakes_a_fault_waiting_for_frames() -> Result<()> {
    let system = Arc::new(
        PagerSystem::new(PagerOptions {
            page_size: PAGE as u32,
            cluster_bytes: PAGE as u64,
            frame_pool_pages: 1,
            scratch_pages: 1,
        })
        .expect("valid options"),
    );
    let file = Arc::new(MemFile::with_contents(FileId(3), vec![0; PAGE * 2]));
    let pager = system.attach(file, Access::Read)?;
    let mut slots = vec![None];
    pager.get(0, &mut slots, 0, Access::Read, Advice::Normal, GetFlags::CENTER);
    let held: Vec<_> = slots.into_iter().flatten().collect();

    let waiter = {
        let pager = Arc::clone(&pager);
        thread::spawn(move || {
            let mut slots = vec![None];
            pager.get(PAGE as u64, &mut slots, 0, Access::Read, Advice::Normal, GetFlags::CENTER)
        })
    };
    while !waiter.is_finished() {
        system.interrupt();
        thread::sleep(std::time::Duration::from_millis(10));
    }
    assert_eq!(waiter.join().expect("waiter panicked"), PagerStatus::Interrupted);
    pager.release_pages(&held, PageRelease::CLEAN);
    assert_eq!(pager.resident_pages(), vec![0]);
    Ok(())
}
