mod common;

use stratum_db::{
    btree,
    catalog::{self, SYS_SERIAL_FOR_FILE_COUNTER},
    error::ErrorKind,
    AllocScope, FileId, IndexId, Thread,
};

fn make_catalog_volume(td: &Thread, name: &str, vol_id: u16, pages: u32) -> (u16, String) {
    let (vol, dev) = common::format_and_mount(td, name, vol_id, 16, pages);
    catalog::create_catalog(td, vol).unwrap();
    (vol, dev)
}

#[test]
fn test_new_file_ids_are_fresh() {
    common::setup();
    let td = common::new_thread();
    let (vol, _dev) = make_catalog_volume(&td, "cat-files", 31, 1024);

    let a = catalog::get_new_file_id(&td, vol).unwrap();
    catalog::register_file(&td, &a, 2, 80).unwrap();

    let b = catalog::get_new_file_id(&td, vol).unwrap();
    assert_ne!(a.serial, b.serial);

    let scope = catalog::file_scope(&td, &a).unwrap();
    assert_eq!(scope.vol_no, vol);
    assert_eq!(scope.first_ext, 2);
    assert_eq!(scope.fill_factor, 80);
}

/// The counter walks past registered serials to the first free one.
#[test]
fn test_file_id_skips_taken_serials() {
    common::setup();
    let td = common::new_thread();
    let (vol, _dev) = make_catalog_volume(&td, "cat-skip", 32, 1024);

    let cid = catalog::get_counter_id(&td, vol, SYS_SERIAL_FOR_FILE_COUNTER).unwrap();
    catalog::set_counter_limit(&td, vol, cid, 4).unwrap();

    for s in [0u32, 1, 3].iter() {
        catalog::register_file(&td, &FileId::new(vol, *s), 0, 100).unwrap();
    }

    let fid = catalog::get_new_file_id(&td, vol).unwrap();
    assert_eq!(fid.serial, 2);
}

/// With every serial taken, the probe loop tolerates one full
/// wraparound and fails on the second.
#[test]
fn test_file_id_exhaustion_tolerates_one_wrap() {
    common::setup();
    let td = common::new_thread();
    let (vol, _dev) = make_catalog_volume(&td, "cat-wrap", 33, 1024);

    let cid = catalog::get_counter_id(&td, vol, SYS_SERIAL_FOR_FILE_COUNTER).unwrap();
    catalog::set_counter_limit(&td, vol, cid, 4).unwrap();

    for s in 0u32..4 {
        catalog::register_file(&td, &FileId::new(vol, s), 0, 100).unwrap();
    }

    let e = catalog::get_new_file_id(&td, vol).unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::FileIdFull);
}

#[test]
fn test_index_catalog_lookup() {
    common::setup();
    let td = common::new_thread();
    let (vol, _dev) = make_catalog_volume(&td, "cat-index", 34, 1024);

    let scope = AllocScope::new(vol, 0, 100);
    let root = btree::create_index(&td, &scope).unwrap();
    let iid = catalog::get_new_index_id(&td, vol).unwrap();
    catalog::register_index(&td, &iid, &root).unwrap();

    let (entry, physical) = catalog::get_catalog_entry_from_index_id(&td, &iid, true).unwrap();
    assert_eq!(entry.vol_no, vol);
    let physical = physical.unwrap();
    assert_eq!(physical.root(), root);

    // without the physical id, only the catalog entry comes back
    let (entry2, physical2) = catalog::get_catalog_entry_from_index_id(&td, &iid, false).unwrap();
    assert_eq!(entry, entry2);
    assert!(physical2.is_none());
}

#[test]
fn test_temporary_index_bypasses_catalog() {
    common::setup();
    let td = common::new_thread();
    let (vol, _dev) = make_catalog_volume(&td, "cat-temp", 35, 1024);

    let scope = AllocScope::new(vol, 0, 100);
    let root = btree::create_index(&td, &scope).unwrap();
    let iid = IndexId::new(vol, 9999);
    catalog::add_temp_index(&td, &iid, &root);

    let (_, physical) = catalog::get_catalog_entry_from_index_id(&td, &iid, true).unwrap();
    assert_eq!(physical.unwrap().root(), root);

    catalog::drop_temp_index(&td, &iid);
    let e = catalog::get_catalog_entry_from_index_id(&td, &iid, true).unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::BadIndexId);
}

/// Catalog anchors live in the volume header and survive a remount.
#[test]
fn test_catalog_reopens_after_remount() {
    common::setup();
    let td = common::new_thread();
    let (vol, dev) = make_catalog_volume(&td, "cat-remount", 36, 1024);

    let fid = catalog::get_new_file_id(&td, vol).unwrap();
    catalog::register_file(&td, &fid, 0, 100).unwrap();

    td.buffer().flush_all().unwrap();
    td.buffer().dismount(vol).unwrap();
    td.disk().dismount(vol).unwrap();

    let vol = td.disk().mount(&[&dev]).unwrap();
    catalog::open_catalog(&td, vol).unwrap();

    let scope = catalog::file_scope(&td, &fid).unwrap();
    assert_eq!(scope.vol_no, vol);

    let next = catalog::get_new_file_id(&td, vol).unwrap();
    assert_ne!(next.serial, fid.serial);
}
