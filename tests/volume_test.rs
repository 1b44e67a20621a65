mod common;

use stratum_db::{
    disk::TRAIN_PAGES,
    error::ErrorKind,
    ids::PageId,
    VolumeKind,
};

/// Format a 1-device volume with 16-page extents and 1024 pages,
/// allocate 8 single pages, free them, allocate again: the same page
/// ids come back.
#[test]
fn test_alloc_free_realloc_round_trip() {
    common::setup();
    let td = common::new_thread();
    let (vol, _dev) = common::format_and_mount(&td, "vol-e1", 1, 16, 1024);

    let pids = td.disk().alloc_trains(vol, 0, None, 100, 8, 1).unwrap();
    let expect: Vec<PageId> = (0..8).map(|i| PageId::new(vol, i)).collect();
    assert_eq!(pids, expect);

    let free_before = td.disk().free_page_count(vol).unwrap();
    td.disk().free_trains(vol, &pids, 1).unwrap();
    assert_eq!(td.disk().free_page_count(vol).unwrap(), free_before + 8);

    let again = td.disk().alloc_trains(vol, 0, None, 100, 8, 1).unwrap();
    assert_eq!(again, expect);

    td.disk().dismount(vol).unwrap();
}

#[test]
fn test_train_allocation_and_io() {
    common::setup();
    let td = common::new_thread();
    let (vol, _dev) = common::format_and_mount(&td, "vol-train", 2, 16, 256);

    let pids = td
        .disk()
        .alloc_trains(vol, 0, None, 100, 2, TRAIN_PAGES)
        .unwrap();
    assert_eq!(pids.len(), 2);
    for pid in &pids {
        assert_eq!(pid.page_no % TRAIN_PAGES as u32, 0);
    }

    let mut buf = td.train_scratch().clone();
    for (i, b) in buf.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    td.disk().write_train(&pids[0], &buf, TRAIN_PAGES).unwrap();

    let mut back = vec![0u8; buf.len()];
    td.disk().read_train(&pids[0], &mut back, TRAIN_PAGES).unwrap();
    assert_eq!(buf, back);

    td.disk().free_trains(vol, &pids, TRAIN_PAGES).unwrap();
    td.disk().dismount(vol).unwrap();
}

#[test]
fn test_invalid_train_size_is_rejected() {
    common::setup();
    let td = common::new_thread();
    let (vol, _dev) = common::format_and_mount(&td, "vol-badsize", 3, 16, 64);

    let e = td.disk().alloc_trains(vol, 0, None, 100, 1, 3).unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::InvalidTrainSize(3));

    let mut buf = vec![0u8; 2 * 4096];
    let e = td
        .disk()
        .read_train(&PageId::new(vol, 0), &mut buf, 2)
        .unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::InvalidTrainSize(2));

    td.disk().dismount(vol).unwrap();
}

#[test]
fn test_out_of_range_page_id() {
    common::setup();
    let td = common::new_thread();
    let (vol, _dev) = common::format_and_mount(&td, "vol-range", 4, 16, 64);

    let bad = PageId::new(vol, 64);
    let mut buf = vec![0u8; 4096];
    let e = td.disk().read_train(&bad, &mut buf, 1).unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::BadPageId(bad));

    td.disk().dismount(vol).unwrap();
}

/// The on-disk bitmap is authoritative: allocations survive a
/// dismount/mount cycle.
#[test]
fn test_bitmap_survives_remount() {
    common::setup();
    let td = common::new_thread();
    let dev = common::device_path("vol-remount");
    td.disk()
        .format(&[&dev], "remount", 5, 16, &[128], VolumeKind::Data)
        .unwrap();

    let vol = td.disk().mount(&[&dev]).unwrap();
    let pids = td.disk().alloc_trains(vol, 0, None, 100, 4, 1).unwrap();
    td.disk().dismount(vol).unwrap();

    let vol = td.disk().mount(&[&dev]).unwrap();
    for pid in &pids {
        // freeing succeeds only if the remounted bitmap knows them
        td.disk().free_trains(vol, &[*pid], 1).unwrap();
    }
    let e = td.disk().free_trains(vol, &[pids[0]], 1).unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::BadParameter);
    td.disk().dismount(vol).unwrap();
}

#[test]
fn test_mount_count() {
    common::setup();
    let td = common::new_thread();
    let dev = common::device_path("vol-mounts");
    td.disk()
        .format(&[&dev], "mounts", 6, 16, &[64], VolumeKind::Data)
        .unwrap();

    let vol = td.disk().mount(&[&dev]).unwrap();
    let vol2 = td.disk().mount(&[&dev]).unwrap();
    assert_eq!(vol, vol2);

    td.disk().dismount(vol).unwrap();
    // still mounted once: lookups keep working
    td.disk().volume(vol).unwrap();
    td.disk().dismount(vol).unwrap();
    assert!(td.disk().volume(vol).is_err());
}

#[test]
fn test_multi_device_volume() {
    common::setup();
    let td = common::new_thread();
    let dev_a = common::device_path("vol-multi-a");
    let dev_b = common::device_path("vol-multi-b");
    td.disk()
        .format(&[&dev_a, &dev_b], "multi", 7, 16, &[64, 64], VolumeKind::Data)
        .unwrap();

    let vol = td.disk().mount(&[&dev_a, &dev_b]).unwrap();
    assert_eq!(td.disk().volume(vol).unwrap().num_pages(), 128);

    // a page in the second device's range round-trips
    let pid = PageId::new(vol, 100);
    let mut buf = vec![0xABu8; 4096];
    td.disk().write_train(&pid, &buf, 1).unwrap();
    buf.iter_mut().for_each(|b| *b = 0);
    td.disk().read_train(&pid, &mut buf, 1).unwrap();
    assert!(buf.iter().all(|&b| b == 0xAB));

    assert_eq!(td.disk().page_id_to_ext_no(&pid).unwrap(), 100 / 16);

    td.disk().dismount(vol).unwrap();
}

#[test]
fn test_device_full() {
    common::setup();
    let td = common::new_thread();
    let (vol, _dev) = common::format_and_mount(&td, "vol-full", 8, 16, 32);

    td.disk().alloc_trains(vol, 0, None, 100, 32, 1).unwrap();
    let e = td.disk().alloc_trains(vol, 0, None, 100, 1, 1).unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::DeviceFull);

    td.disk().dismount(vol).unwrap();
}
