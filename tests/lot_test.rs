mod common;

use rand::{thread_rng, Rng};

use stratum_db::{
    error::ErrorKind,
    lot::{self, LotRoot},
    AllocScope, PageId, Thread,
};

fn make_lot(td: &Thread, name: &str, vol_id: u16, pages: u32) -> (AllocScope, LotRoot) {
    let (vol, _dev) = common::format_and_mount(td, name, vol_id, 16, pages);
    (AllocScope::new(vol, 0, 100), LotRoot::new())
}

fn read_all(td: &Thread, scope: &AllocScope, root: &LotRoot) -> Vec<u8> {
    let n = lot::span(td, root).unwrap();
    let mut buf = vec![0u8; n];
    lot::read(td, scope, root, 0, &mut buf).unwrap();
    buf
}

#[test]
fn test_append_read_delete_small() {
    common::setup();
    let td = common::new_thread();
    let (scope, mut root) = make_lot(&td, "lot-small", 1, 512);

    lot::append(&td, &scope, &mut root, b"hello").unwrap();
    lot::append(&td, &scope, &mut root, b" world").unwrap();

    let mut buf = vec![0u8; 11];
    lot::read(&td, &scope, &root, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"hello world");

    lot::delete(&td, &scope, &mut root, 5, 1).unwrap();

    let mut buf = vec![0u8; 10];
    lot::read(&td, &scope, &root, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"helloworld");
    assert_eq!(lot::span(&td, &root).unwrap(), 10);
}

#[test]
fn test_insert_in_middle() {
    common::setup();
    let td = common::new_thread();
    let (scope, mut root) = make_lot(&td, "lot-mid", 2, 512);

    lot::append(&td, &scope, &mut root, b"helloworld").unwrap();
    lot::insert(&td, &scope, &mut root, 5, b", ").unwrap();
    assert_eq!(read_all(&td, &scope, &root), b"hello, world");

    let e = lot::insert(&td, &scope, &mut root, 100, b"x").unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::BadParameter);

    let mut buf = vec![0u8; 5];
    let e = lot::read(&td, &scope, &root, 10, &mut buf).unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::BadParameter);
}

/// Random inserts, deletes, and reads against an in-memory model.
#[test]
fn test_random_ops_match_model() {
    common::setup();
    let td = common::new_thread();
    let (scope, mut root) = make_lot(&td, "lot-rand", 3, 4096);
    let mut model: Vec<u8> = Vec::new();
    let mut rng = thread_rng();

    for round in 0..300 {
        match rng.gen_range(0, 3) {
            0 => {
                let len = rng.gen_range(1, 4000);
                let fill = (round % 251) as u8;
                let bytes = vec![fill; len];
                let offset = rng.gen_range(0, model.len() + 1);
                lot::insert(&td, &scope, &mut root, offset, &bytes).unwrap();
                model.splice(offset..offset, bytes);
            }
            1 if !model.is_empty() => {
                let offset = rng.gen_range(0, model.len());
                let len = rng.gen_range(1, (model.len() - offset).min(4000) + 1);
                lot::delete(&td, &scope, &mut root, offset, len).unwrap();
                model.drain(offset..offset + len);
            }
            _ if !model.is_empty() => {
                let offset = rng.gen_range(0, model.len());
                let len = rng.gen_range(1, (model.len() - offset).min(4000) + 1);
                let mut buf = vec![0u8; len];
                lot::read(&td, &scope, &root, offset, &mut buf).unwrap();
                assert_eq!(buf, model[offset..offset + len].to_vec());
            }
            _ => {}
        }
        assert_eq!(lot::span(&td, &root).unwrap(), model.len());
    }

    assert_eq!(read_all(&td, &scope, &root), model);
    assert_eq!(td.buffer().pinned_frames(), 0);
}

/// An embedded root outgrows its slot, moves to a page near its
/// file's pages, and the content survives the move.
#[test]
fn test_separate_root_node() {
    common::setup();
    let td = common::new_thread();
    let (scope, mut root) = make_lot(&td, "lot-sep", 4, 4096);

    // enough trains to overflow the inline slot
    let chunk = vec![0x5Au8; 16000];
    while !root.needs_separation() {
        lot::append(&td, &scope, &mut root, &chunk).unwrap();
    }
    let before = read_all(&td, &scope, &root);

    let near = PageId::new(scope.vol_no, 0);
    let new_root = lot::separate_root_node(&td, &scope, &near, &mut root).unwrap();
    match root {
        LotRoot::Page(pid) => assert_eq!(pid, new_root),
        LotRoot::Embedded(_) => panic!("root should live on a page now"),
    }

    assert_eq!(read_all(&td, &scope, &root), before);

    // the separated root keeps working as the tree grows
    lot::append(&td, &scope, &mut root, b"tail").unwrap();
    let n = lot::span(&td, &root).unwrap();
    let mut buf = vec![0u8; 4];
    lot::read(&td, &scope, &root, n - 4, &mut buf).unwrap();
    assert_eq!(&buf, b"tail");
}

/// Grow a page-rooted LOT until the root node itself splits and the
/// tree gains a level; reads still match a model.
#[test]
fn test_deep_tree_grow_and_shrink() {
    common::setup();
    let td = common::new_thread();
    let (scope, mut root) = make_lot(&td, "lot-deep", 5, 16384);

    let chunk: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    while !root.needs_separation() {
        lot::append(&td, &scope, &mut root, &chunk).unwrap();
    }
    let near = PageId::new(scope.vol_no, 0);
    lot::separate_root_node(&td, &scope, &near, &mut root).unwrap();

    // push well past one node page worth of entries
    let mut model = read_all(&td, &scope, &root);
    for i in 0..7000u32 {
        let fill = (i % 251) as u8;
        let bytes = vec![fill; 1024];
        lot::append(&td, &scope, &mut root, &bytes).unwrap();
        model.extend_from_slice(&bytes);
    }
    assert_eq!(lot::span(&td, &root).unwrap(), model.len());

    // spot-check random windows rather than the full 7 MiB
    let mut rng = thread_rng();
    for _ in 0..50 {
        let offset = rng.gen_range(0, model.len() - 1);
        let len = rng.gen_range(1, (model.len() - offset).min(50000) + 1);
        let mut buf = vec![0u8; len];
        lot::read(&td, &scope, &root, offset, &mut buf).unwrap();
        assert_eq!(buf, model[offset..offset + len].to_vec());
    }

    // carve out a large middle range, then drain the rest
    let offset = model.len() / 3;
    let len = model.len() / 2;
    lot::delete(&td, &scope, &mut root, offset, len).unwrap();
    model.drain(offset..offset + len);
    assert_eq!(lot::span(&td, &root).unwrap(), model.len());

    let mut buf = vec![0u8; 4096];
    lot::read(&td, &scope, &root, offset - 2048, &mut buf).unwrap();
    assert_eq!(buf, model[offset - 2048..offset + 2048].to_vec());

    lot::delete(&td, &scope, &mut root, 0, model.len()).unwrap();
    assert_eq!(lot::span(&td, &root).unwrap(), 0);
    assert_eq!(td.buffer().pinned_frames(), 0);
}
