#![allow(missing_docs)]

use std::sync::Arc;

use proptest::prelude::*;
use vnpager::{
    Access, Advice, FileId, FlushFlags, GetFlags, MemFile, PageHandle, PageRelease, PagerOps,
    PagerOptions, PagerStatus, PagerSystem, Protection, Result, VnodePager,
};

const PAGE: u64 = 4096;

fn system() -> PagerSystem {
    PagerSystem::new(PagerOptions::default()).expect("default options are valid")
}

fn fetch(pager: &VnodePager, offset: u64) -> (PagerStatus, Vec<PageHandle>) {
    let mut slots = vec![None];
    let status = pager.get(
        offset,
        &mut slots,
        0,
        Access::ReadWrite,
        Advice::Normal,
        GetFlags::CENTER,
    );
    (status, slots.into_iter().flatten().collect())
}

fn write_page(pager: &VnodePager, offset: u64, byte: u8) {
    let (status, pages) = fetch(pager, offset);
    assert_eq!(status, PagerStatus::Ok, "page-in at {offset}");
    pages[0].data_mut().fill(byte);
    pager.release_pages(&pages, PageRelease::DIRTY);
}

#[test]
fn round_trip_reads_back_written_bytes_and_zero_past_eof() -> Result<()> {
    let system = system();
    let file = Arc::new(MemFile::with_contents(FileId(1), vec![0xC3; 1000]));
    let pager = system.attach(file.clone(), Access::ReadWrite)?;

    let (_, pages) = fetch(&pager, 0);
    {
        let data = pages[0].data();
        assert!(data[..1000].iter().all(|b| *b == 0xC3));
        assert!(data[1000..].iter().all(|b| *b == 0));
    }
    pages[0].data_mut()[10] = 0x01;
    pager.release_pages(&pages, PageRelease::DIRTY);

    assert!(pager.flush(0, PAGE, FlushFlags::CLEANIT | FlushFlags::SYNCIO));
    assert_eq!(file.len(), 1000, "write-back stops at end of object");
    assert_eq!(file.slice(10, 1), vec![0x01]);

    assert!(pager.flush(0, PAGE, FlushFlags::FREE));
    let (_, pages) = fetch(&pager, 0);
    assert_eq!(pages[0].data()[10], 0x01);
    assert!(pages[0].data()[1000..].iter().all(|b| *b == 0));
    pager.release_pages(&pages, PageRelease::CLEAN);
    Ok(())
}

#[test]
fn flush_is_idempotent() -> Result<()> {
    let system = system();
    let file = Arc::new(MemFile::with_contents(FileId(2), vec![0; 4 * PAGE as usize]));
    let pager = system.attach(file.clone(), Access::ReadWrite)?;
    write_page(&pager, 0, 1);
    write_page(&pager, 2 * PAGE, 2);

    let flags = FlushFlags::CLEANIT | FlushFlags::ALLPAGES | FlushFlags::SYNCIO;
    assert!(pager.flush(0, 0, flags));
    let writes = file.counters().writes;
    assert_eq!(writes, 2);
    assert!(pager.flush(0, 0, flags));
    assert_eq!(file.counters().writes, writes);
    Ok(())
}

#[test]
fn shrinking_discards_pages_past_the_new_end() -> Result<()> {
    let system = system();
    let file = Arc::new(MemFile::with_contents(FileId(3), vec![0xAA; 2 * PAGE as usize]));
    let pager = system.attach(file.clone(), Access::ReadWrite)?;
    for offset in [0, PAGE] {
        let (_, pages) = fetch(&pager, offset);
        pager.release_pages(&pages, PageRelease::CLEAN);
    }
    assert_eq!(pager.resident_pages(), vec![0, PAGE]);

    system.setsize(FileId(3), 100);
    file.set_len(100);
    assert_eq!(pager.size(), 100);
    assert_eq!(pager.resident_pages(), vec![0]);

    let (status, pages) = fetch(&pager, PAGE);
    assert_eq!(status, PagerStatus::Bad);
    assert!(pages.is_empty());

    file.set_len(2 * PAGE);
    system.setsize(FileId(3), 2 * PAGE);
    let (_, pages) = fetch(&pager, 0);
    {
        let data = pages[0].data();
        assert!(data[..100].iter().all(|b| *b == 0xAA));
        assert!(data[100..].iter().all(|b| *b == 0), "stale bytes past the old end");
    }
    pager.release_pages(&pages, PageRelease::CLEAN);
    let (status, pages) = fetch(&pager, PAGE);
    assert_eq!(status, PagerStatus::Ok);
    assert!(pages[0].data().iter().all(|b| *b == 0));
    pager.release_pages(&pages, PageRelease::CLEAN);
    Ok(())
}

#[test]
fn shrinking_to_zero_frees_everything() -> Result<()> {
    let system = system();
    let file = Arc::new(MemFile::with_contents(FileId(4), vec![1; 3 * PAGE as usize]));
    let pager = system.attach(file, Access::ReadWrite)?;
    for offset in [0, PAGE, 2 * PAGE] {
        write_page(&pager, offset, 9);
    }
    system.setsize(FileId(4), 0);
    assert!(pager.resident_pages().is_empty());
    assert_eq!(pager.stats().dirty, 0);
    Ok(())
}

#[test]
fn busy_pages_are_never_handed_out_twice() -> Result<()> {
    let system = system();
    let file = Arc::new(MemFile::with_contents(FileId(5), vec![0; PAGE as usize]));
    let pager = system.attach(file, Access::Read)?;
    let (_, held) = fetch(&pager, 0);

    let mut slots = vec![None];
    let status = pager.get(0, &mut slots, 0, Access::Read, Advice::Normal, GetFlags::LOCKED);
    assert_eq!(status, PagerStatus::Unlock);
    assert!(slots[0].is_none());

    pager.release_pages(&held, PageRelease::CLEAN);
    let status = pager.get(0, &mut slots, 0, Access::Read, Advice::Normal, GetFlags::LOCKED);
    assert_eq!(status, PagerStatus::Ok);
    let pages: Vec<_> = slots.into_iter().flatten().collect();
    pager.release_pages(&pages, PageRelease::CLEAN);
    Ok(())
}

#[test]
fn locked_get_does_not_touch_the_file() -> Result<()> {
    let system = system();
    let file = Arc::new(MemFile::with_contents(FileId(6), vec![0; 2 * PAGE as usize]));
    let pager = system.attach(file.clone(), Access::Read)?;
    file.panic_on_io(true);

    let mut slots = vec![None, None];
    let status = pager.get(0, &mut slots, 1, Access::Read, Advice::Random, GetFlags::LOCKED);
    assert_eq!(status, PagerStatus::Unlock);
    assert!(slots.iter().all(Option::is_none));
    Ok(())
}

#[test]
fn mapped_stores_are_written_back_after_dirty_bit_sync() -> Result<()> {
    let system = system();
    let file = Arc::new(MemFile::with_contents(FileId(7), vec![0; 2 * PAGE as usize]));
    let pager = system.attach(file.clone(), Access::ReadWrite)?;
    let (_, pages) = fetch(&pager, PAGE);
    pager.release_pages(&pages, PageRelease::mapped(Protection::ReadWrite));
    assert!(pager.write_mapped(PAGE, |data| data[1] = 0xF0));

    // Deactivating unmaps the page but keeps it dirty.
    assert!(pager.flush(PAGE, 2 * PAGE, FlushFlags::DEACTIVATE));
    assert!(!pager.write_mapped(PAGE, |data| data[1] = 0xF1));
    assert_eq!(pager.stats().dirty, 1);

    assert!(pager.flush(0, 0, FlushFlags::ALLPAGES | FlushFlags::CLEANIT | FlushFlags::FREE));
    assert_eq!(file.slice(PAGE + 1, 1), vec![0xF0]);
    assert!(pager.resident_pages().is_empty());
    Ok(())
}

#[test]
fn put_writes_busy_pages_through() -> Result<()> {
    let system = system();
    let file = Arc::new(MemFile::with_contents(FileId(8), vec![0; 3 * PAGE as usize]));
    let pager = system.attach(file.clone(), Access::ReadWrite)?;
    let mut slots = vec![None, None, None];
    let status = pager.get(0, &mut slots, 0, Access::ReadWrite, Advice::Sequential, GetFlags::ALL);
    assert_eq!(status, PagerStatus::Ok);
    let pages: Vec<_> = slots.into_iter().flatten().collect();
    for (i, page) in pages.iter().enumerate() {
        page.data_mut().fill(i as u8 + 1);
    }
    assert_eq!(pager.put(&pages[1..], FlushFlags::SYNCIO), PagerStatus::Ok);
    assert_eq!(file.counters().writes, 1);
    assert_eq!(file.slice(PAGE, 1), vec![2]);
    assert_eq!(file.slice(2 * PAGE, 1), vec![3]);
    assert_eq!(file.slice(0, 1), vec![0]);
    pager.release_pages(&pages, PageRelease::CLEAN);
    Ok(())
}

#[test]
#[should_panic(expected = "contiguous")]
fn put_rejects_gaps() {
    let system = system();
    let file = Arc::new(MemFile::with_contents(FileId(9), vec![0; 3 * PAGE as usize]));
    let pager = system.attach(file, Access::ReadWrite).unwrap();
    let mut slots = vec![None, None, None];
    pager.get(0, &mut slots, 0, Access::ReadWrite, Advice::Normal, GetFlags::ALL);
    let pages: Vec<_> = slots.into_iter().flatten().collect();
    pager.put(&[pages[0].clone(), pages[2].clone()], FlushFlags::SYNCIO);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn resident_pages_follow_setsize(
        initial_pages in 1u64..8,
        sizes in prop::collection::vec(0u64..(10 * PAGE), 1..12),
    ) {
        let system = system();
        let len = initial_pages * PAGE;
        let file = Arc::new(MemFile::with_contents(FileId(50), vec![0x77; len as usize]));
        let pager = system.attach(file.clone(), Access::ReadWrite).unwrap();

        for (round, new_size) in sizes.into_iter().enumerate() {
            let size = pager.size();
            let fill = round as u8 + 1;
            let mut offset = 0;
            while offset < size {
                let (status, pages) = fetch(&pager, offset);
                prop_assert_eq!(status, PagerStatus::Ok);
                pages[0].data_mut().fill(fill);
                pager.release_pages(&pages, PageRelease::DIRTY);
                offset += PAGE;
            }
            let before = pager.resident_pages();

            if new_size > file.len() {
                file.set_len(new_size);
            }
            system.setsize(FileId(50), new_size);
            prop_assert_eq!(pager.size(), new_size);
            for resident in pager.resident_pages() {
                prop_assert!(resident < new_size, "page {} survived shrink to {}", resident, new_size);
            }

            if new_size >= size {
                prop_assert_eq!(pager.resident_pages(), before.clone());
                let reads = file.counters().reads;
                for offset in before {
                    let (status, pages) = fetch(&pager, offset);
                    prop_assert_eq!(status, PagerStatus::Ok);
                    prop_assert!(
                        pages[0].data().iter().all(|b| *b == fill),
                        "page {} changed when growing {} -> {}", offset, size, new_size
                    );
                    pager.release_pages(&pages, PageRelease::DIRTY);
                }
                prop_assert_eq!(file.counters().reads, reads);
            }
        }
    }
}
