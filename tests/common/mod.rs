//! Shared scaffolding for the integration tests: log init, scratch
//! device files, and the B+ tree invariant checkers.

#![allow(dead_code)]

use std::{
    cmp::Ordering as CmpOrdering,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Once,
    },
};

use once_cell::sync::Lazy;

use stratum_db::{
    btree::{
        key::{compare_keys, KeyDesc, KeyValue},
        page::{
            internal_p0, read_internal_entry, read_leaf_entry, read_overflow_oids, LeafPayload,
        },
    },
    buffer::{BufferClass, BufferConfig},
    page::{read_header, PAGE_TYPE_INTERNAL, PAGE_TYPE_LEAF, PAGE_TYPE_OVERFLOW},
    ObjectId, PageId, Process, Thread, VolumeKind,
};

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| stratum_db::utils::init_log());
}

static TEST_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    let p = std::env::temp_dir().join(format!("stratum-tests-{}", std::process::id()));
    std::fs::create_dir_all(&p).unwrap();
    p
});

static SEQ: AtomicUsize = AtomicUsize::new(0);

/// A fresh device file path; the file does not exist yet.
pub fn device_path(name: &str) -> String {
    let n = SEQ.fetch_add(1, Ordering::SeqCst);
    TEST_ROOT
        .join(format!("{}-{}.dev", name, n))
        .to_str()
        .unwrap()
        .to_string()
}

/// A fresh engine with its own buffer pool.
pub fn new_thread() -> Thread {
    Process::new(BufferConfig::default()).attach()
}

pub fn new_process() -> Arc<Process> {
    Process::new(BufferConfig::default())
}

/// Format a one-device data volume and mount it.
pub fn format_and_mount(
    td: &Thread,
    name: &str,
    vol_id: u16,
    extent_size: u16,
    pages: u32,
) -> (u16, String) {
    let dev = device_path(name);
    td.disk()
        .format(&[&dev], name, vol_id, extent_size, &[pages], VolumeKind::Data)
        .unwrap();
    let vol_no = td.disk().mount(&[&dev]).unwrap();
    (vol_no, dev)
}

/// Decode the i32 column of a single-column key.
pub fn key_to_i32(key: &KeyValue) -> i32 {
    i32::from_le_bytes([key.bytes[0], key.bytes[1], key.bytes[2], key.bytes[3]])
}

/// Every `(key, oid)` pair in leaf-chain order, starting from the
/// leftmost leaf.
pub fn scan_leaf_chain(td: &Thread, root: &PageId) -> Vec<(KeyValue, ObjectId)> {
    // find the leftmost leaf
    let mut pid = *root;
    loop {
        let guard = td.buffer().get_train(&pid, BufferClass::Page).unwrap();
        let data = guard.read();
        let hdr = read_header(&data);
        if hdr.is_type(PAGE_TYPE_LEAF) {
            break;
        }
        assert!(hdr.is_type(PAGE_TYPE_INTERNAL));
        pid = PageId::new(pid.vol_no, internal_p0(&data));
    }

    let mut out = Vec::new();
    loop {
        let next = {
            let guard = td.buffer().get_train(&pid, BufferClass::Page).unwrap();
            let data = guard.read();
            let hdr = read_header(&data);
            for slot in 0..hdr.n_slots as usize {
                let entry = read_leaf_entry(&data, slot);
                match entry.payload {
                    LeafPayload::Inline(oids) => {
                        for oid in oids {
                            out.push((entry.key.clone(), oid));
                        }
                    }
                    LeafPayload::Overflow(head) => {
                        for oid in chain_oids(td, pid.vol_no, head) {
                            out.push((entry.key.clone(), oid));
                        }
                    }
                }
            }
            hdr.next
        };
        if next.is_nil() {
            return out;
        }
        pid = next;
    }
}

pub fn chain_oids(td: &Thread, vol_no: u16, head: u32) -> Vec<ObjectId> {
    let mut out = Vec::new();
    let mut pid = PageId::new(vol_no, head);
    loop {
        let guard = td.buffer().get_train(&pid, BufferClass::Page).unwrap();
        let data = guard.read();
        let hdr = read_header(&data);
        assert!(hdr.is_type(PAGE_TYPE_OVERFLOW), "chain page {} type", pid);
        let oids = read_overflow_oids(&data);
        assert!(!oids.is_empty(), "empty chain page {}", pid);
        out.extend(oids);
        if hdr.next.is_nil() {
            return out;
        }
        pid = hdr.next;
    }
}

/// Structural invariants: strict key ordering per page, uniform leaf
/// depth, sorted non-empty overflow chains, and a leaf chain that
/// enumerates keys in non-decreasing order.
pub fn check_tree_invariants(td: &Thread, root: &PageId, kdesc: &KeyDesc) {
    let mut leaf_depths = Vec::new();
    check_node(td, root, kdesc, 0, &mut leaf_depths);

    leaf_depths.sort_unstable();
    leaf_depths.dedup();
    assert_eq!(leaf_depths.len(), 1, "leaves at different depths");

    let pairs = scan_leaf_chain(td, root);
    for w in pairs.windows(2) {
        let ord = compare_keys(kdesc, &w[0].0, &w[1].0).unwrap();
        assert_ne!(ord, CmpOrdering::Greater, "leaf chain out of order");
        if ord == CmpOrdering::Equal {
            assert!(w[0].1 < w[1].1, "duplicate key oids out of order");
        }
    }
}

fn check_node(
    td: &Thread,
    pid: &PageId,
    kdesc: &KeyDesc,
    depth: usize,
    leaf_depths: &mut Vec<usize>,
) {
    let guard = td.buffer().get_train(pid, BufferClass::Page).unwrap();
    let data = guard.read();
    let hdr = read_header(&data);

    if hdr.is_type(PAGE_TYPE_LEAF) {
        let mut prev: Option<KeyValue> = None;
        for slot in 0..hdr.n_slots as usize {
            let entry = read_leaf_entry(&data, slot);
            if let Some(p) = &prev {
                assert_eq!(
                    compare_keys(kdesc, p, &entry.key).unwrap(),
                    CmpOrdering::Less,
                    "leaf keys not strictly increasing in {}",
                    pid
                );
            }
            if let LeafPayload::Overflow(head) = entry.payload {
                let oids = chain_oids(td, pid.vol_no, head);
                for w in oids.windows(2) {
                    assert!(w[0] < w[1], "chain oids out of order");
                }
            }
            prev = Some(entry.key);
        }
        leaf_depths.push(depth);
        return;
    }

    assert!(hdr.is_type(PAGE_TYPE_INTERNAL), "unexpected page type in {}", pid);
    let mut children = vec![internal_p0(&data)];
    let mut prev: Option<KeyValue> = None;
    for slot in 0..hdr.n_slots as usize {
        let (child, key) = read_internal_entry(&data, slot);
        if let Some(p) = &prev {
            assert_eq!(
                compare_keys(kdesc, p, &key).unwrap(),
                CmpOrdering::Less,
                "internal keys not strictly increasing in {}",
                pid
            );
        }
        prev = Some(key);
        children.push(child);
    }
    drop(data);
    drop(guard);

    for child in children {
        check_node(td, &PageId::new(pid.vol_no, child), kdesc, depth + 1, leaf_depths);
    }
}
