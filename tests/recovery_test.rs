mod common;

use stratum_db::{
    disk::{page_size, TRAIN_PAGES},
    error::ErrorKind,
    recovery, PageId, Thread,
};

fn make_log_volume(td: &Thread, name: &str, vol_id: u16, pages: u32) -> u16 {
    let dev = common::device_path(name);
    recovery::format_log_volume(td, &[&dev], name, vol_id, 16, &[pages]).unwrap();
    let vol = td.disk().mount(&[&dev]).unwrap();
    recovery::open_log_volume(td, vol).unwrap();
    vol
}

fn page_buf(fill: u8) -> Vec<u8> {
    vec![fill; page_size()]
}

/// Saving the same train twice keeps the mapping and overwrites the
/// image in place.
#[test]
fn test_save_train_overwrites_in_place() {
    common::setup();
    let td = common::new_thread();
    let log_vol = make_log_volume(&td, "rm-resave", 21, 256);

    let data_pid = PageId::new(9, 123);
    recovery::save_train(&td, &data_pid, &page_buf(0xAA), 1).unwrap();
    let mapped = recovery::saved_location(&td, &data_pid).unwrap();

    recovery::save_train(&td, &data_pid, &page_buf(0xBB), 1).unwrap();
    assert_eq!(recovery::saved_location(&td, &data_pid), Some(mapped));

    let mut back = page_buf(0);
    td.disk()
        .read_train(&PageId::new(log_vol, mapped), &mut back, 1)
        .unwrap();
    assert!(back.iter().all(|&b| b == 0xBB));

    recovery::close_log_volume(&td).unwrap();
    td.disk().dismount(log_vol).unwrap();
}

/// Page saves fill from the low end, train saves from the high end;
/// the cursors never cross.
#[test]
fn test_log_allocation_cursors() {
    common::setup();
    let td = common::new_thread();
    let _log_vol = make_log_volume(&td, "rm-cursors", 22, 256);

    let (p0, t0) = recovery::log_cursors(&td).unwrap();
    assert!(p0 <= t0);

    for i in 0..10u32 {
        recovery::save_train(&td, &PageId::new(9, i), &page_buf(i as u8), 1).unwrap();
        let train = vec![(i % 251) as u8; TRAIN_PAGES * page_size()];
        recovery::save_train(&td, &PageId::new(9, 1000 + i), &train, TRAIN_PAGES).unwrap();

        let (p, t) = recovery::log_cursors(&td).unwrap();
        assert!(p <= t, "cursors crossed: {} > {}", p, t);
        assert_eq!(p, p0 + i + 1);
        assert_eq!(t, t0 - (i + 1) * TRAIN_PAGES as u32);
    }

    // re-saves do not move either cursor
    let before = recovery::log_cursors(&td).unwrap();
    recovery::save_train(&td, &PageId::new(9, 0), &page_buf(0xFF), 1).unwrap();
    recovery::save_train(
        &td,
        &PageId::new(9, 1000),
        &vec![0xFFu8; TRAIN_PAGES * page_size()],
        TRAIN_PAGES,
    )
    .unwrap();
    assert_eq!(recovery::log_cursors(&td).unwrap(), before);
}

#[test]
fn test_log_volume_full() {
    common::setup();
    let td = common::new_thread();
    let _log_vol = make_log_volume(&td, "rm-full", 23, 16);

    for i in 0..16u32 {
        recovery::save_train(&td, &PageId::new(9, i), &page_buf(i as u8), 1).unwrap();
    }
    let e = recovery::save_train(&td, &PageId::new(9, 99), &page_buf(0), 1).unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::LogVolumeFull);

    // existing mappings still accept re-saves
    recovery::save_train(&td, &PageId::new(9, 3), &page_buf(0xEE), 1).unwrap();
}

/// Cursors survive close/reopen; the save table does not.
#[test]
fn test_cursors_persist_across_runs() {
    common::setup();
    let td = common::new_thread();
    let dev = common::device_path("rm-runs");
    recovery::format_log_volume(&td, &[&dev], "rm-runs", 24, 16, &[256]).unwrap();
    let vol = td.disk().mount(&[&dev]).unwrap();

    recovery::open_log_volume(&td, vol).unwrap();
    let data_pid = PageId::new(9, 7);
    recovery::save_train(&td, &data_pid, &page_buf(0x11), 1).unwrap();
    let first_mapping = recovery::saved_location(&td, &data_pid).unwrap();
    let cursors_after = recovery::log_cursors(&td).unwrap();
    recovery::close_log_volume(&td).unwrap();

    recovery::open_log_volume(&td, vol).unwrap();
    assert_eq!(recovery::log_cursors(&td).unwrap(), cursors_after);
    assert_eq!(recovery::saved_location(&td, &data_pid), None);

    // a new run maps the same train to a fresh log page
    recovery::save_train(&td, &data_pid, &page_buf(0x22), 1).unwrap();
    let second_mapping = recovery::saved_location(&td, &data_pid).unwrap();
    assert_ne!(first_mapping, second_mapping);

    recovery::close_log_volume(&td).unwrap();
    td.disk().dismount(vol).unwrap();
}

#[test]
fn test_save_train_parameter_checks() {
    common::setup();
    let td = common::new_thread();
    let _log_vol = make_log_volume(&td, "rm-params", 25, 64);

    let e = recovery::save_train(&td, &PageId::new(9, 0), &page_buf(0), 3).unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::InvalidTrainSize(3));

    let e = recovery::save_train(&td, &PageId::new(9, 0), &vec![0u8; 7], 1).unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::BadParameter);
}
