#![allow(missing_docs)]

use std::fs;
use std::sync::Arc;

use tempfile::tempdir;
use vnpager::{
    Access, Advice, BackingFile, FlushFlags, GetFlags, MountId, PageRelease, PagerOps,
    PagerOptions, PagerPhase, PagerStatus, PagerSystem, Result, StdBackingFile,
};

const PAGE: u64 = 4096;

#[test]
fn pages_reach_the_disk_through_sync_and_teardown() -> Result<()> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.bin");
    fs::write(&path, vec![0x10u8; 3 * PAGE as usize]).unwrap();

    let system = PagerSystem::new(PagerOptions::default())?;
    let file = StdBackingFile::open(&path, MountId(1))?;
    let pager = system.attach(Arc::new(file.clone()), Access::ReadWrite)?;
    assert_eq!(pager.size(), 3 * PAGE);
    assert_eq!(file.durable_refs(), 1);

    let mut slots = vec![None, None];
    let status = pager.get(PAGE, &mut slots, 0, Access::ReadWrite, Advice::Sequential, GetFlags::ALL);
    assert_eq!(status, PagerStatus::Ok);
    let pages: Vec<_> = slots.into_iter().flatten().collect();
    assert!(pages.iter().all(|page| page.data().iter().all(|b| *b == 0x10)));
    pages[0].data_mut()[..5].copy_from_slice(b"hello");
    pages[1].data_mut()[..5].copy_from_slice(b"world");
    pager.release_pages(&pages, PageRelease::DIRTY);

    let report = system.sync(Some(MountId(1)));
    assert_eq!(report.flushed, 1);
    assert_eq!(report.failed, 0);
    let on_disk = fs::read(&path).unwrap();
    assert_eq!(&on_disk[PAGE as usize..PAGE as usize + 5], b"hello");
    assert_eq!(&on_disk[2 * PAGE as usize..2 * PAGE as usize + 5], b"world");
    assert_eq!(on_disk[0], 0x10);

    file.set_len(PAGE + 10)?;
    system.setsize(file.id(), PAGE + 10);
    assert_eq!(pager.resident_pages(), vec![PAGE]);
    assert_eq!(fs::metadata(&path).unwrap().len(), PAGE + 10);

    let mut slots = vec![None];
    pager.get(PAGE, &mut slots, 0, Access::ReadWrite, Advice::Normal, GetFlags::CENTER);
    let pages: Vec<_> = slots.into_iter().flatten().collect();
    pages[0].data_mut()[9] = b'!';
    pager.release_pages(&pages, PageRelease::DIRTY);

    file.lock_exclusive()?;
    system.terminate(file.id());
    file.unlock()?;
    assert_eq!(pager.phase(), PagerPhase::Revoked);

    let on_disk = fs::read(&path).unwrap();
    assert_eq!(on_disk.len() as u64, PAGE + 10, "write-back must not extend the file");
    assert_eq!(&on_disk[PAGE as usize..PAGE as usize + 10], b"hello\x10\x10\x10\x10!");

    pager.detach();
    assert_eq!(pager.phase(), PagerPhase::Uninitialized);
    assert_eq!(file.durable_refs(), 0);
    Ok(())
}

#[test]
fn persisting_pager_sees_no_disk_traffic_on_reattach() -> Result<()> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("persist.bin");
    fs::write(&path, b"persisted contents").unwrap();

    let system = PagerSystem::new(PagerOptions::default())?;
    let file = StdBackingFile::open(&path, MountId(2))?;
    let pager = system.attach(Arc::new(file.clone()), Access::Read)?;
    let mut slots = vec![None];
    pager.get(0, &mut slots, 0, Access::Read, Advice::Normal, GetFlags::CENTER);
    let pages: Vec<_> = slots.into_iter().flatten().collect();
    pager.release_pages(&pages, PageRelease::CLEAN);
    pager.detach();
    assert_eq!(pager.phase(), PagerPhase::Persisting);

    fs::write(&path, b"changed underneath").unwrap();
    let again = system.attach(Arc::new(file.clone()), Access::Read)?;
    let mut slots = vec![None];
    again.get(0, &mut slots, 0, Access::Read, Advice::Normal, GetFlags::CENTER);
    let pages: Vec<_> = slots.into_iter().flatten().collect();
    assert_eq!(&pages[0].data()[..9], b"persisted");
    again.release_pages(&pages, PageRelease::CLEAN);

    assert!(again.flush(0, 0, FlushFlags::ALLPAGES | FlushFlags::FREE));
    let mut slots = vec![None];
    again.get(0, &mut slots, 0, Access::Read, Advice::Normal, GetFlags::CENTER);
    let pages: Vec<_> = slots.into_iter().flatten().collect();
    assert_eq!(&pages[0].data()[..7], b"changed");
    again.release_pages(&pages, PageRelease::CLEAN);
    Ok(())
}
