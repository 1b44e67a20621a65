//! B+ tree structure operations: create/drop, insert with splits and
//! overflow chains, delete with redistribution and merges, and the
//! page statistics walk.
//!
//! The root page id never changes: a root split moves the old root's
//! content into a fresh child and the root page becomes the new
//! internal top; a root collapse copies the last child back up. A
//! `PhysicalIndexId` therefore stays valid for the index's lifetime.

use std::cmp::Ordering;

use log::debug;

use crate::{
    buffer::BufferClass,
    disk::AllocScope,
    error::{ErrorKind, StratumError},
    ids::{ObjectId, PageId, OBJECT_ID_SIZE},
    page::{
        self, read_header, write_header, PAGE_TYPE_INTERNAL, PAGE_TYPE_LEAF, PAGE_TYPE_OVERFLOW,
        PAGE_TYPE_ROOT,
    },
    process::Thread,
    types::StratumResult,
};

use super::{
    key::{check_key, compare_keys, KeyDesc, KeyValue},
    page::{
        build_internal_entry, build_leaf_entry, check_type, internal_child_for, internal_entry_len,
        internal_p0, leaf_entry_len, overflow_capacity, read_internal_entry,
        read_leaf_entry, read_overflow_oids, search_leaf, set_internal_p0, write_leaf_entry,
        write_overflow_oids, LeafEntry, LeafPayload, INTERNAL_DATA_START, LEAF_DATA_START,
    },
};

/// A leaf entry longer than this moves its ObjectIds to an overflow
/// chain.
fn overflow_threshold(page_len: usize) -> usize {
    page_len / 4
}

/// A chain that shrank back under this collapses inline again. Half
/// the creation threshold, so entries do not flap between modes.
fn collapse_threshold(page_len: usize) -> usize {
    page_len / 8
}

/// Pages under this fill fraction are candidates for merge.
const MERGE_FILL_PERCENT: usize = 40;

fn data_capacity(page_len: usize, data_start: usize) -> usize {
    page_len - data_start
}

fn used_bytes(page: &[u8], data_start: usize) -> usize {
    data_capacity(page.len(), data_start) - page::total_free(page, 0)
}

fn is_underfull(page: &[u8], data_start: usize) -> bool {
    used_bytes(page, data_start) * 100 < data_capacity(page.len(), data_start) * MERGE_FILL_PERCENT
}

fn alloc_page(td: &Thread, scope: &AllocScope, near: Option<PageId>) -> Result<PageId, StratumError> {
    let pids = td.disk().alloc_trains(
        scope.vol_no,
        scope.first_ext,
        near,
        scope.fill_factor,
        1,
        1,
    )?;
    Ok(pids[0])
}

fn free_page(td: &Thread, pid: &PageId) -> StratumResult {
    td.disk().free_trains(pid.vol_no, &[*pid], 1)
}

/// Create an empty index and return its root page.
pub fn create_index(td: &Thread, scope: &AllocScope) -> Result<PageId, StratumError> {
    let root = alloc_page(td, scope, None)?;
    let guard = td.buffer().get_new_train(&root, BufferClass::Page)?;
    {
        let mut data = guard.write();
        page::init_page(
            &mut data,
            PAGE_TYPE_LEAF | PAGE_TYPE_ROOT,
            root,
            LEAF_DATA_START,
        );
    }
    guard.mark_dirty();
    debug!("create_index: root {}", root);
    Ok(root)
}

/// Free every page of the index, overflow chains included.
pub fn drop_index(td: &Thread, root: &PageId) -> StratumResult {
    let latch = td.tree_latch(root);
    {
        let _guard = latch.write().unwrap();
        drop_rec(td, root)?;
    }
    td.process().drop_tree_latch(root);
    Ok(())
}

fn drop_rec(td: &Thread, pid: &PageId) -> StratumResult {
    let mut children: Vec<PageId> = Vec::new();
    {
        let guard = td.buffer().get_train(pid, BufferClass::Page)?;
        let data = guard.read();
        let hdr = read_header(&data);
        if hdr.is_type(PAGE_TYPE_INTERNAL) {
            children.push(PageId::new(pid.vol_no, internal_p0(&data)));
            for slot in 0..hdr.n_slots as usize {
                let (child, _) = read_internal_entry(&data, slot);
                children.push(PageId::new(pid.vol_no, child));
            }
        } else if hdr.is_type(PAGE_TYPE_LEAF) {
            for slot in 0..hdr.n_slots as usize {
                if let LeafPayload::Overflow(head) = read_leaf_entry(&data, slot).payload {
                    children.push(PageId::new(pid.vol_no, head));
                }
            }
        } else if hdr.is_type(PAGE_TYPE_OVERFLOW) {
            if !hdr.next.is_nil() {
                children.push(hdr.next);
            }
        } else {
            return Err(StratumError::new(
                ErrorKind::BadBtreePage(*pid),
                &format!("drop_index: header {}", page::dump_prefix(&data)),
            ));
        }
    }
    for child in children {
        drop_rec(td, &child)?;
    }
    td.buffer().discard(pid, BufferClass::Page)?;
    free_page(td, pid)
}

// ---- insert ----

/// Insert `(kval, oid)` into the index rooted at `root`. Inserting a
/// pair that is already present fails with `Duplicated`.
pub fn insert(
    td: &Thread,
    scope: &AllocScope,
    root: &PageId,
    kdesc: &KeyDesc,
    kval: &KeyValue,
    oid: &ObjectId,
) -> StratumResult {
    check_key(kdesc, kval)?;
    debug!("btree insert: root {}, oid {}", root, oid);

    let latch = td.tree_latch(root);
    let _guard = latch.write().unwrap();

    if let Some((sep, right)) = insert_rec(td, scope, root, kdesc, kval, oid)? {
        grow_root(td, scope, root, &sep, &right)?;
    }
    Ok(())
}

/// Returns the promoted separator and new right page when `pid` split.
fn insert_rec(
    td: &Thread,
    scope: &AllocScope,
    pid: &PageId,
    kdesc: &KeyDesc,
    kval: &KeyValue,
    oid: &ObjectId,
) -> Result<Option<(KeyValue, PageId)>, StratumError> {
    let guard = td.buffer().get_train(pid, BufferClass::Page)?;
    let hdr = read_header(&guard.read());

    if hdr.is_type(PAGE_TYPE_INTERNAL) {
        let (child_no, _) = internal_child_for(&guard.read(), kdesc, kval)?;
        let child = PageId::new(pid.vol_no, child_no);
        let split = insert_rec(td, scope, &child, kdesc, kval, oid)?;

        let (sep, right) = match split {
            None => return Ok(None),
            Some(s) => s,
        };
        return internal_insert_entry(td, scope, &guard, pid, kdesc, &sep, right.page_no);
    }

    if hdr.is_type(PAGE_TYPE_LEAF) {
        return leaf_insert(td, scope, &guard, pid, kdesc, kval, oid);
    }

    Err(StratumError::new(
        ErrorKind::BadBtreePage(*pid),
        &format!("insert: header {}", page::dump_prefix(&guard.read())),
    ))
}

/// Place `(sep, child)` into an internal page, splitting it when full.
fn internal_insert_entry(
    td: &Thread,
    scope: &AllocScope,
    guard: &crate::buffer::FrameGuard,
    pid: &PageId,
    kdesc: &KeyDesc,
    sep: &KeyValue,
    child: u32,
) -> Result<Option<(KeyValue, PageId)>, StratumError> {
    let entry = build_internal_entry(child, sep);

    // slot where the separator belongs
    let slot = {
        let data = guard.read();
        let n = read_header(&data).n_slots as usize;
        let mut slot = n;
        for i in 0..n {
            let (_, key) = read_internal_entry(&data, i);
            if compare_keys(kdesc, &key, sep)? == Ordering::Greater {
                slot = i;
                break;
            }
        }
        slot
    };

    let fits = page::total_free(&guard.read(), 1) >= crate::utils::aligned_length(entry.len());
    if fits {
        {
            let mut data = guard.write();
            page::insert_entry(&mut data, INTERNAL_DATA_START, slot, &entry, &internal_entry_len)?;
        }
        guard.mark_dirty();
        return Ok(None);
    }

    // split: gather every entry including the pending one
    let (p0, mut entries, flags) = {
        let data = guard.read();
        let hdr = read_header(&data);
        let mut entries: Vec<(u32, KeyValue)> = (0..hdr.n_slots as usize)
            .map(|i| read_internal_entry(&data, i))
            .collect();
        entries.insert(slot, (child, sep.clone()));
        (internal_p0(&data), entries, hdr.type_flags)
    };

    let mid = entries.len() / 2;
    let (promoted_child, promoted_key) = entries[mid].clone();
    let right_entries: Vec<(u32, KeyValue)> = entries.split_off(mid + 1);
    entries.pop(); // the promoted entry moves up

    let right_pid = alloc_page(td, scope, Some(*pid))?;
    let right = td.buffer().get_new_train(&right_pid, BufferClass::Page)?;
    {
        let mut data = right.write();
        rewrite_internal(&mut data, right_pid, PAGE_TYPE_INTERNAL, promoted_child, &right_entries)?;
    }
    right.mark_dirty();

    {
        let mut data = guard.write();
        rewrite_internal(&mut data, *pid, flags, p0, &entries)?;
    }
    guard.mark_dirty();

    Ok(Some((promoted_key, right_pid)))
}

fn rewrite_internal(
    data: &mut [u8],
    pid: PageId,
    flags: u16,
    p0: u32,
    entries: &[(u32, KeyValue)],
) -> StratumResult {
    page::init_page(data, flags, pid, INTERNAL_DATA_START);
    set_internal_p0(data, p0);
    for (i, (child, key)) in entries.iter().enumerate() {
        let e = build_internal_entry(*child, key);
        page::insert_entry(data, INTERNAL_DATA_START, i, &e, &internal_entry_len)?;
    }
    Ok(())
}

fn rewrite_leaf(
    data: &mut [u8],
    pid: PageId,
    flags: u16,
    next: PageId,
    prev: PageId,
    entries: &[Vec<u8>],
) -> StratumResult {
    page::init_page(data, flags, pid, LEAF_DATA_START);
    for (i, e) in entries.iter().enumerate() {
        page::insert_entry(data, LEAF_DATA_START, i, e, &leaf_entry_len)?;
    }
    let mut hdr = read_header(data);
    hdr.next = next;
    hdr.prev = prev;
    write_header(data, &hdr);
    Ok(())
}

fn leaf_insert(
    td: &Thread,
    scope: &AllocScope,
    guard: &crate::buffer::FrameGuard,
    pid: &PageId,
    kdesc: &KeyDesc,
    kval: &KeyValue,
    oid: &ObjectId,
) -> Result<Option<(KeyValue, PageId)>, StratumError> {
    let (found, slot) = search_leaf(&guard.read(), kdesc, kval)?;

    if found {
        let mut entry = read_leaf_entry(&guard.read(), slot);
        match entry.payload {
            LeafPayload::Overflow(head) => {
                insert_oid_into_chain(td, scope, pid, head, oid)?;
                return Ok(None);
            }
            LeafPayload::Inline(ref mut oids) => {
                let pos = match oids.binary_search(oid) {
                    Ok(_) => {
                        return Err(StratumError::new(
                            ErrorKind::Duplicated,
                            &format!("({:?}, {}) already present", kval, oid),
                        ))
                    }
                    Err(pos) => pos,
                };
                oids.insert(pos, *oid);

                let new_entry = build_leaf_entry(&entry.key, &LeafPayload::Inline(oids.clone()));
                let page_len = guard.read().len();

                if new_entry.len() > overflow_threshold(page_len) {
                    // migrate the ObjectIds to a fresh overflow chain
                    let head = alloc_page(td, scope, Some(*pid))?;
                    let ov = td.buffer().get_new_train(&head, BufferClass::Page)?;
                    {
                        let mut data = ov.write();
                        page::init_page(&mut data, PAGE_TYPE_OVERFLOW, head, LEAF_DATA_START);
                        write_overflow_oids(&mut data, &oids);
                    }
                    ov.mark_dirty();

                    let ov_entry =
                        build_leaf_entry(&entry.key, &LeafPayload::Overflow(head.page_no));
                    {
                        let mut data = guard.write();
                        page::resize_entry(
                            &mut data,
                            LEAF_DATA_START,
                            slot,
                            ov_entry.len(),
                            &leaf_entry_len,
                        )?;
                        write_leaf_entry(&mut data, slot, &ov_entry);
                    }
                    guard.mark_dirty();
                    return Ok(None);
                }

                let old_len = leaf_entry_len(&build_leaf_entry(&entry.key, &entry.payload));
                let grow = crate::utils::aligned_length(new_entry.len())
                    - crate::utils::aligned_length(old_len);
                if page::total_free(&guard.read(), 0) >= grow {
                    {
                        let mut data = guard.write();
                        page::resize_entry(
                            &mut data,
                            LEAF_DATA_START,
                            slot,
                            new_entry.len(),
                            &leaf_entry_len,
                        )?;
                        write_leaf_entry(&mut data, slot, &new_entry);
                    }
                    guard.mark_dirty();
                    return Ok(None);
                }

                // no room to grow in place: split, then place the
                // rebuilt entry in whichever half owns the key
                return leaf_split_replace(td, scope, guard, pid, slot, Some(new_entry), None);
            }
        }
    }

    let new_entry = build_leaf_entry(kval, &LeafPayload::Inline(vec![*oid]));
    if page::total_free(&guard.read(), 1) >= crate::utils::aligned_length(new_entry.len()) {
        {
            let mut data = guard.write();
            page::insert_entry(&mut data, LEAF_DATA_START, slot, &new_entry, &leaf_entry_len)?;
        }
        guard.mark_dirty();
        return Ok(None);
    }

    leaf_split_replace(td, scope, guard, pid, slot, None, Some(new_entry))
}

/// Split a full leaf. Either `replace` rewrites the entry currently at
/// `slot`, or `insert` adds a new entry at `slot`; exactly one is
/// given. Returns the promoted separator and the new right page.
fn leaf_split_replace(
    td: &Thread,
    scope: &AllocScope,
    guard: &crate::buffer::FrameGuard,
    pid: &PageId,
    slot: usize,
    replace: Option<Vec<u8>>,
    insert: Option<Vec<u8>>,
) -> Result<Option<(KeyValue, PageId)>, StratumError> {
    let (mut entries, flags, next, prev) = {
        let data = guard.read();
        let hdr = read_header(&data);
        let entries: Vec<Vec<u8>> = (0..hdr.n_slots as usize)
            .map(|i| {
                let off = page::slot_offset(&data, i);
                let len = leaf_entry_len(&data[off..]);
                data[off..off + len].to_vec()
            })
            .collect();
        (entries, hdr.type_flags, hdr.next, hdr.prev)
    };

    if let Some(e) = replace {
        entries[slot] = e;
    }
    if let Some(e) = insert {
        entries.insert(slot, e);
    }

    // split at half the stored bytes
    let total: usize = entries
        .iter()
        .map(|e| crate::utils::aligned_length(e.len()))
        .sum();
    let mut acc = 0usize;
    let mut mid = entries.len();
    for (i, e) in entries.iter().enumerate() {
        acc += crate::utils::aligned_length(e.len());
        if acc * 2 >= total {
            mid = i + 1;
            break;
        }
    }
    if mid >= entries.len() {
        mid = entries.len() - 1;
    }
    if mid == 0 {
        mid = 1;
    }

    let right_entries = entries.split_off(mid);
    let sep = {
        let mut r = crate::io::StratumReader::new(&right_entries[0]);
        let klen = r.read_u16() as usize;
        r.skip(2);
        KeyValue::from_bytes(r.read_bytes(klen))
    };

    let right_pid = alloc_page(td, scope, Some(*pid))?;
    let right = td.buffer().get_new_train(&right_pid, BufferClass::Page)?;
    {
        let mut data = right.write();
        rewrite_leaf(&mut data, right_pid, PAGE_TYPE_LEAF, next, *pid, &right_entries)?;
    }
    right.mark_dirty();

    {
        let mut data = guard.write();
        rewrite_leaf(&mut data, *pid, flags, right_pid, prev, &entries)?;
    }
    guard.mark_dirty();

    // the old right neighbor now follows the new page
    if !next.is_nil() {
        let after = td.buffer().get_train(&next, BufferClass::Page)?;
        {
            let mut data = after.write();
            let mut hdr = read_header(&data);
            hdr.prev = right_pid;
            write_header(&mut data, &hdr);
        }
        after.mark_dirty();
    }

    Ok(Some((sep, right_pid)))
}

/// When the root splits, its old content moves into a fresh left
/// child and the root page is rebuilt as the new internal top.
fn grow_root(
    td: &Thread,
    scope: &AllocScope,
    root: &PageId,
    sep: &KeyValue,
    right: &PageId,
) -> StratumResult {
    let root_guard = td.buffer().get_train(root, BufferClass::Page)?;
    let left_pid = alloc_page(td, scope, Some(*root))?;
    let left = td.buffer().get_new_train(&left_pid, BufferClass::Page)?;

    let was_leaf = {
        let root_data = root_guard.read();
        let mut data = left.write();
        data.copy_from_slice(&root_data);
        let mut hdr = read_header(&data);
        hdr.type_flags &= !PAGE_TYPE_ROOT;
        hdr.pid = left_pid;
        let was_leaf = hdr.is_type(PAGE_TYPE_LEAF);
        write_header(&mut data, &hdr);
        was_leaf
    };
    left.mark_dirty();

    if was_leaf {
        // the right half's prev still names the root page
        let right_guard = td.buffer().get_train(right, BufferClass::Page)?;
        {
            let mut data = right_guard.write();
            let mut hdr = read_header(&data);
            hdr.prev = left_pid;
            write_header(&mut data, &hdr);
        }
        right_guard.mark_dirty();
    }

    {
        let mut data = root_guard.write();
        rewrite_internal(
            &mut data,
            *root,
            PAGE_TYPE_INTERNAL | PAGE_TYPE_ROOT,
            left_pid.page_no,
            &[(right.page_no, sep.clone())],
        )?;
    }
    root_guard.mark_dirty();
    debug!("root {} grew: left {}, right {}", root, left_pid, right);
    Ok(())
}

// ---- overflow chains ----

/// Insert `oid` into the sorted chain headed at `head`. Full chain
/// pages split in place, keeping the chain sorted.
fn insert_oid_into_chain(
    td: &Thread,
    scope: &AllocScope,
    leaf: &PageId,
    head: u32,
    oid: &ObjectId,
) -> StratumResult {
    let cap = overflow_capacity(crate::disk::page_size());
    let mut pid = PageId::new(leaf.vol_no, head);

    loop {
        let guard = td.buffer().get_train(&pid, BufferClass::Page)?;
        check_type(&guard.read(), PAGE_TYPE_OVERFLOW, &pid)?;
        let hdr = read_header(&guard.read());
        let mut oids = read_overflow_oids(&guard.read());

        if oids.binary_search(oid).is_ok() {
            return Err(StratumError::new(
                ErrorKind::Duplicated,
                &format!("oid {} already in chain", oid),
            ));
        }

        let belongs_here = hdr.next.is_nil() || oids.last().map_or(true, |last| oid < last);
        if !belongs_here {
            pid = hdr.next;
            continue;
        }

        if oids.len() < cap {
            let pos = oids.binary_search(oid).unwrap_err();
            oids.insert(pos, *oid);
            {
                let mut data = guard.write();
                write_overflow_oids(&mut data, &oids);
            }
            guard.mark_dirty();
            return Ok(());
        }

        // page full: move the upper half into a new chain page
        let new_pid = alloc_page(td, scope, Some(pid))?;
        let upper = oids.split_off(oids.len() / 2);
        let new_guard = td.buffer().get_new_train(&new_pid, BufferClass::Page)?;
        {
            let mut data = new_guard.write();
            page::init_page(&mut data, PAGE_TYPE_OVERFLOW, new_pid, LEAF_DATA_START);
            write_overflow_oids(&mut data, &upper);
            let mut new_hdr = read_header(&data);
            new_hdr.next = hdr.next;
            new_hdr.prev = pid;
            write_header(&mut data, &new_hdr);
        }
        new_guard.mark_dirty();

        if !hdr.next.is_nil() {
            let after = td.buffer().get_train(&hdr.next, BufferClass::Page)?;
            {
                let mut data = after.write();
                let mut h = read_header(&data);
                h.prev = new_pid;
                write_header(&mut data, &h);
            }
            after.mark_dirty();
        }

        {
            let mut data = guard.write();
            write_overflow_oids(&mut data, &oids);
            let mut h = read_header(&data);
            h.next = new_pid;
            write_header(&mut data, &h);
        }
        guard.mark_dirty();

        // retry: the target page is now this page or the new one
        let target = if oid < upper.first().unwrap() { pid } else { new_pid };
        let guard = td.buffer().get_train(&target, BufferClass::Page)?;
        let mut oids = read_overflow_oids(&guard.read());
        let pos = oids.binary_search(oid).unwrap_err();
        oids.insert(pos, *oid);
        {
            let mut data = guard.write();
            write_overflow_oids(&mut data, &oids);
        }
        guard.mark_dirty();
        return Ok(());
    }
}

/// Walk the chain at `head` collecting every ObjectId in order.
pub(crate) fn chain_oids(td: &Thread, vol_no: u16, head: u32) -> Result<Vec<ObjectId>, StratumError> {
    let mut out = Vec::new();
    let mut pid = PageId::new(vol_no, head);
    loop {
        let guard = td.buffer().get_train(&pid, BufferClass::Page)?;
        check_type(&guard.read(), PAGE_TYPE_OVERFLOW, &pid)?;
        out.extend(read_overflow_oids(&guard.read()));
        let next = read_header(&guard.read()).next;
        if next.is_nil() {
            return Ok(out);
        }
        pid = next;
    }
}

/// Remove `oid` from the chain. Returns the possibly-new head (the
/// head page can empty out and be freed) and the remaining count.
fn delete_oid_from_chain(
    td: &Thread,
    leaf: &PageId,
    head: u32,
    oid: &ObjectId,
) -> Result<(u32, usize), StratumError> {
    let mut pid = PageId::new(leaf.vol_no, head);
    let mut new_head = head;

    loop {
        let guard = td.buffer().get_train(&pid, BufferClass::Page)?;
        check_type(&guard.read(), PAGE_TYPE_OVERFLOW, &pid)?;
        let hdr = read_header(&guard.read());
        let mut oids = read_overflow_oids(&guard.read());

        match oids.binary_search(oid) {
            Err(_) => {
                if hdr.next.is_nil() {
                    return Err(StratumError::new(
                        ErrorKind::NotFound,
                        &format!("oid {} not in chain", oid),
                    ));
                }
                pid = hdr.next;
                continue;
            }
            Ok(pos) => {
                oids.remove(pos);

                if oids.is_empty() {
                    // unlink and free this page
                    if !hdr.prev.is_nil() {
                        let prev = td.buffer().get_train(&hdr.prev, BufferClass::Page)?;
                        {
                            let mut data = prev.write();
                            let mut h = read_header(&data);
                            h.next = hdr.next;
                            write_header(&mut data, &h);
                        }
                        prev.mark_dirty();
                    } else {
                        new_head = hdr.next.page_no;
                    }
                    if !hdr.next.is_nil() {
                        let next = td.buffer().get_train(&hdr.next, BufferClass::Page)?;
                        {
                            let mut data = next.write();
                            let mut h = read_header(&data);
                            h.prev = hdr.prev;
                            write_header(&mut data, &h);
                        }
                        next.mark_dirty();
                    }
                    drop(guard);
                    td.buffer().discard(&pid, BufferClass::Page)?;
                    free_page(td, &pid)?;
                } else {
                    {
                        let mut data = guard.write();
                        write_overflow_oids(&mut data, &oids);
                    }
                    guard.mark_dirty();
                }

                let count = if new_head == u32::MAX {
                    0
                } else {
                    chain_oids(td, leaf.vol_no, new_head)?.len()
                };
                return Ok((new_head, count));
            }
        }
    }
}

// ---- delete ----

/// Remove `(kval, oid)` from the index rooted at `root`.
pub fn delete(
    td: &Thread,
    scope: &AllocScope,
    root: &PageId,
    kdesc: &KeyDesc,
    kval: &KeyValue,
    oid: &ObjectId,
) -> StratumResult {
    check_key(kdesc, kval)?;
    debug!("btree delete: root {}, oid {}", root, oid);

    let latch = td.tree_latch(root);
    let _guard = latch.write().unwrap();

    delete_rec(td, scope, root, kdesc, kval, oid, true)?;
    Ok(())
}

fn delete_rec(
    td: &Thread,
    scope: &AllocScope,
    pid: &PageId,
    kdesc: &KeyDesc,
    kval: &KeyValue,
    oid: &ObjectId,
    is_root: bool,
) -> Result<bool, StratumError> {
    let guard = td.buffer().get_train(pid, BufferClass::Page)?;
    let hdr = read_header(&guard.read());

    if hdr.is_type(PAGE_TYPE_LEAF) {
        leaf_delete(td, scope, &guard, pid, kdesc, kval, oid)?;
        return Ok(!is_root && is_underfull(&guard.read(), LEAF_DATA_START));
    }

    if !hdr.is_type(PAGE_TYPE_INTERNAL) {
        return Err(StratumError::new(
            ErrorKind::BadBtreePage(*pid),
            &format!("delete: header {}", page::dump_prefix(&guard.read())),
        ));
    }

    let (child_no, child_slot) = internal_child_for(&guard.read(), kdesc, kval)?;
    let child = PageId::new(pid.vol_no, child_no);
    let child_underfull = delete_rec(td, scope, &child, kdesc, kval, oid, false)?;

    if child_underfull {
        fix_child_underflow(td, &guard, pid, kdesc, child_slot)?;
    }

    if is_root && read_header(&guard.read()).n_slots == 0 {
        collapse_root(td, &guard, pid)?;
        return Ok(false);
    }

    Ok(!is_root && is_underfull(&guard.read(), INTERNAL_DATA_START))
}

fn leaf_delete(
    td: &Thread,
    _scope: &AllocScope,
    guard: &crate::buffer::FrameGuard,
    pid: &PageId,
    kdesc: &KeyDesc,
    kval: &KeyValue,
    oid: &ObjectId,
) -> StratumResult {
    let (found, slot) = search_leaf(&guard.read(), kdesc, kval)?;
    if !found {
        return Err(StratumError::new(
            ErrorKind::NotFound,
            &format!("key {:?} not found", kval),
        ));
    }

    let entry = read_leaf_entry(&guard.read(), slot);
    match entry.payload {
        LeafPayload::Inline(mut oids) => {
            let pos = oids.binary_search(oid).map_err(|_| {
                StratumError::new(ErrorKind::NotFound, &format!("oid {} not found", oid))
            })?;
            oids.remove(pos);

            if oids.is_empty() {
                let mut data = guard.write();
                page::delete_entry(&mut data, slot, &leaf_entry_len);
            } else {
                let new_entry = build_leaf_entry(&entry.key, &LeafPayload::Inline(oids));
                let mut data = guard.write();
                page::resize_entry(&mut data, LEAF_DATA_START, slot, new_entry.len(), &leaf_entry_len)?;
                write_leaf_entry(&mut data, slot, &new_entry);
            }
            guard.mark_dirty();
            Ok(())
        }
        LeafPayload::Overflow(head) => {
            let (new_head, count) = delete_oid_from_chain(td, pid, head, oid)?;

            if count == 0 {
                let mut data = guard.write();
                page::delete_entry(&mut data, slot, &leaf_entry_len);
                guard.mark_dirty();
                return Ok(());
            }

            let inline_len = {
                let klen = entry.key.len();
                4 + crate::utils::aligned_length(klen) + count * OBJECT_ID_SIZE
            };
            if inline_len <= collapse_threshold(guard.read().len())
                && page::total_free(&guard.read(), 0) + 8 >= inline_len
            {
                // chain fits inline again
                let oids = chain_oids(td, pid.vol_no, new_head)?;
                let new_entry = build_leaf_entry(&entry.key, &LeafPayload::Inline(oids));
                {
                    let mut data = guard.write();
                    page::resize_entry(
                        &mut data,
                        LEAF_DATA_START,
                        slot,
                        new_entry.len(),
                        &leaf_entry_len,
                    )?;
                    write_leaf_entry(&mut data, slot, &new_entry);
                }
                guard.mark_dirty();
                free_chain(td, pid.vol_no, new_head)?;
                return Ok(());
            }

            if new_head != head {
                let new_entry = build_leaf_entry(&entry.key, &LeafPayload::Overflow(new_head));
                let mut data = guard.write();
                page::resize_entry(&mut data, LEAF_DATA_START, slot, new_entry.len(), &leaf_entry_len)?;
                write_leaf_entry(&mut data, slot, &new_entry);
                guard.mark_dirty();
            }
            Ok(())
        }
    }
}

fn free_chain(td: &Thread, vol_no: u16, head: u32) -> StratumResult {
    let mut pid = PageId::new(vol_no, head);
    loop {
        let next = {
            let guard = td.buffer().get_train(&pid, BufferClass::Page)?;
            let next = read_header(&guard.read()).next;
            next
        };
        td.buffer().discard(&pid, BufferClass::Page)?;
        free_page(td, &pid)?;
        if next.is_nil() {
            return Ok(());
        }
        pid = next;
    }
}

/// A child of `parent` went underfull: redistribute with a sibling or
/// merge the pair, adjusting the separator between them.
fn fix_child_underflow(
    td: &Thread,
    parent: &crate::buffer::FrameGuard,
    parent_pid: &PageId,
    kdesc: &KeyDesc,
    child_slot: Option<usize>,
) -> StratumResult {
    // normalize to (left, right, sep_slot): the pair to rebalance and
    // the parent entry separating them
    let (left_no, right_no, sep_slot) = {
        let data = parent.read();
        let n = read_header(&data).n_slots as usize;
        match child_slot {
            None => {
                if n == 0 {
                    return Ok(()); // lone child, nothing to borrow from
                }
                let (right, _) = read_internal_entry(&data, 0);
                (internal_p0(&data), right, 0usize)
            }
            Some(i) => {
                let (child, _) = read_internal_entry(&data, i);
                let left = if i == 0 {
                    internal_p0(&data)
                } else {
                    read_internal_entry(&data, i - 1).0
                };
                (left, child, i)
            }
        }
    };

    let left_pid = PageId::new(parent_pid.vol_no, left_no);
    let right_pid = PageId::new(parent_pid.vol_no, right_no);
    let left = td.buffer().get_train(&left_pid, BufferClass::Page)?;
    let right = td.buffer().get_train(&right_pid, BufferClass::Page)?;

    let leaves = read_header(&left.read()).is_type(PAGE_TYPE_LEAF);
    let merged = if leaves {
        rebalance_leaves(td, parent, &left, &right, left_pid, right_pid, sep_slot)?
    } else {
        rebalance_internals(td, parent, kdesc, &left, &right, left_pid, right_pid, sep_slot)?
    };

    drop(left);
    drop(right);
    if merged {
        td.buffer().discard(&right_pid, BufferClass::Page)?;
        free_page(td, &right_pid)?;
    }
    Ok(())
}

fn rebalance_leaves(
    td: &Thread,
    parent: &crate::buffer::FrameGuard,
    left: &crate::buffer::FrameGuard,
    right: &crate::buffer::FrameGuard,
    left_pid: PageId,
    right_pid: PageId,
    sep_slot: usize,
) -> Result<bool, StratumError> {
    let collect = |g: &crate::buffer::FrameGuard| -> Vec<Vec<u8>> {
        let data = g.read();
        let n = read_header(&data).n_slots as usize;
        (0..n)
            .map(|i| {
                let off = page::slot_offset(&data, i);
                let len = leaf_entry_len(&data[off..]);
                data[off..off + len].to_vec()
            })
            .collect()
    };

    let mut entries = collect(left);
    let right_entries = collect(right);
    entries.extend(right_entries);

    let page_len = left.read().len();
    let stored: usize = entries
        .iter()
        .map(|e| crate::utils::aligned_length(e.len()) + page::SLOT_SIZE)
        .sum();
    let capacity = data_capacity(page_len, LEAF_DATA_START);

    let (left_hdr, right_hdr) = (read_header(&left.read()), read_header(&right.read()));

    if stored <= capacity * 9 / 10 {
        // merge right into left, unlink right from the chain
        {
            let mut data = left.write();
            rewrite_leaf(
                &mut data,
                left_pid,
                left_hdr.type_flags,
                right_hdr.next,
                left_hdr.prev,
                &entries,
            )?;
        }
        left.mark_dirty();

        if !right_hdr.next.is_nil() {
            let after = td.buffer().get_train(&right_hdr.next, BufferClass::Page)?;
            {
                let mut data = after.write();
                let mut h = read_header(&data);
                h.prev = left_pid;
                write_header(&mut data, &h);
            }
            after.mark_dirty();
        }

        {
            let mut data = parent.write();
            page::delete_entry(&mut data, sep_slot, &internal_entry_len);
        }
        parent.mark_dirty();
        return Ok(true);
    }

    // redistribute: split the combined list at half the bytes
    let total: usize = entries
        .iter()
        .map(|e| crate::utils::aligned_length(e.len()))
        .sum();
    let mut acc = 0usize;
    let mut mid = entries.len();
    for (i, e) in entries.iter().enumerate() {
        acc += crate::utils::aligned_length(e.len());
        if acc * 2 >= total {
            mid = i + 1;
            break;
        }
    }
    let mid = mid.max(1).min(entries.len() - 1);
    let new_right = entries.split_off(mid);

    let sep = {
        let mut r = crate::io::StratumReader::new(&new_right[0]);
        let klen = r.read_u16() as usize;
        r.skip(2);
        KeyValue::from_bytes(r.read_bytes(klen))
    };

    {
        let mut data = left.write();
        rewrite_leaf(
            &mut data,
            left_pid,
            left_hdr.type_flags,
            right_pid,
            left_hdr.prev,
            &entries,
        )?;
    }
    left.mark_dirty();
    {
        let mut data = right.write();
        rewrite_leaf(
            &mut data,
            right_pid,
            right_hdr.type_flags,
            right_hdr.next,
            left_pid,
            &new_right,
        )?;
    }
    right.mark_dirty();

    // refresh the separator to the new right page's first key
    {
        let mut data = parent.write();
        page::delete_entry(&mut data, sep_slot, &internal_entry_len);
        let e = build_internal_entry(right_pid.page_no, &sep);
        page::insert_entry(&mut data, INTERNAL_DATA_START, sep_slot, &e, &internal_entry_len)?;
    }
    parent.mark_dirty();
    Ok(false)
}

fn rebalance_internals(
    td: &Thread,
    parent: &crate::buffer::FrameGuard,
    _kdesc: &KeyDesc,
    left: &crate::buffer::FrameGuard,
    right: &crate::buffer::FrameGuard,
    left_pid: PageId,
    right_pid: PageId,
    sep_slot: usize,
) -> Result<bool, StratumError> {
    let sep_key = {
        let data = parent.read();
        read_internal_entry(&data, sep_slot).1
    };

    let collect = |g: &crate::buffer::FrameGuard| -> (u32, Vec<(u32, KeyValue)>) {
        let data = g.read();
        let n = read_header(&data).n_slots as usize;
        (
            internal_p0(&data),
            (0..n).map(|i| read_internal_entry(&data, i)).collect(),
        )
    };

    let (left_p0, left_entries) = collect(left);
    let (right_p0, right_entries) = collect(right);

    // combined view: left entries, the separator pulled down onto
    // right's leftmost child, then right's entries
    let mut entries = left_entries;
    entries.push((right_p0, sep_key));
    entries.extend(right_entries);

    let page_len = left.read().len();
    let stored: usize = entries
        .iter()
        .map(|(_, k)| crate::utils::aligned_length(6 + k.len()) + page::SLOT_SIZE)
        .sum();
    let capacity = data_capacity(page_len, INTERNAL_DATA_START);

    let left_flags = read_header(&left.read()).type_flags;

    if stored <= capacity * 9 / 10 {
        {
            let mut data = left.write();
            rewrite_internal(&mut data, left_pid, left_flags, left_p0, &entries)?;
        }
        left.mark_dirty();

        {
            let mut data = parent.write();
            page::delete_entry(&mut data, sep_slot, &internal_entry_len);
        }
        parent.mark_dirty();
        return Ok(true);
    }

    let mid = entries.len() / 2;
    let (new_right_p0, new_sep) = entries[mid].clone();
    let new_right_entries: Vec<(u32, KeyValue)> = entries.split_off(mid + 1);
    entries.pop();

    {
        let mut data = left.write();
        rewrite_internal(&mut data, left_pid, left_flags, left_p0, &entries)?;
    }
    left.mark_dirty();
    {
        let right_flags = read_header(&right.read()).type_flags;
        let mut data = right.write();
        rewrite_internal(&mut data, right_pid, right_flags, new_right_p0, &new_right_entries)?;
    }
    right.mark_dirty();

    {
        let mut data = parent.write();
        page::delete_entry(&mut data, sep_slot, &internal_entry_len);
        let e = build_internal_entry(right_pid.page_no, &new_sep);
        page::insert_entry(&mut data, INTERNAL_DATA_START, sep_slot, &e, &internal_entry_len)?;
    }
    parent.mark_dirty();
    Ok(false)
}

/// The root is internal with no separators left: pull its only child
/// up into the root page so the root id stays stable.
fn collapse_root(
    td: &Thread,
    root_guard: &crate::buffer::FrameGuard,
    root: &PageId,
) -> StratumResult {
    let child_pid = PageId::new(root.vol_no, internal_p0(&root_guard.read()));
    let child = td.buffer().get_train(&child_pid, BufferClass::Page)?;

    {
        let child_data = child.read();
        let mut data = root_guard.write();
        data.copy_from_slice(&child_data);
        let mut hdr = read_header(&data);
        hdr.type_flags |= PAGE_TYPE_ROOT;
        hdr.pid = *root;
        write_header(&mut data, &hdr);
    }
    root_guard.mark_dirty();

    drop(child);
    td.buffer().discard(&child_pid, BufferClass::Page)?;
    free_page(td, &child_pid)?;
    debug!("root {} collapsed onto child {}", root, child_pid);
    Ok(())
}

// ---- statistics ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageInfoKind {
    Internal,
    Leaf,
    Overflow,
}

#[derive(Debug, Clone, Copy)]
pub struct PageInfo {
    pub kind: PageInfoKind,
    pub n_slots: u16,
    pub free: u16,
    pub unused: u16,
}

/// Depth-first page statistics, bounded by `capacity`. Overflow
/// chains are visited from the leaf entries referencing them.
pub fn get_statistics(
    td: &Thread,
    root: &PageId,
    capacity: usize,
) -> Result<Vec<PageInfo>, StratumError> {
    let latch = td.tree_latch(root);
    let _guard = latch.read().unwrap();

    let mut out = Vec::new();
    stats_rec(td, root, capacity, &mut out)?;
    Ok(out)
}

fn stats_rec(
    td: &Thread,
    pid: &PageId,
    capacity: usize,
    out: &mut Vec<PageInfo>,
) -> StratumResult {
    if out.len() >= capacity {
        return Err(StratumError::new(
            ErrorKind::BadParameter,
            "statistics capacity exhausted",
        ));
    }

    let guard = td.buffer().get_train(pid, BufferClass::Page)?;
    let data = guard.read();
    let hdr = read_header(&data);

    if hdr.is_type(PAGE_TYPE_INTERNAL) {
        out.push(PageInfo {
            kind: PageInfoKind::Internal,
            n_slots: hdr.n_slots,
            free: hdr.free,
            unused: hdr.unused,
        });
        let mut children = vec![internal_p0(&data)];
        for slot in 0..hdr.n_slots as usize {
            children.push(read_internal_entry(&data, slot).0);
        }
        drop(data);
        drop(guard);
        for child in children {
            stats_rec(td, &PageId::new(pid.vol_no, child), capacity, out)?;
        }
    } else if hdr.is_type(PAGE_TYPE_LEAF) {
        out.push(PageInfo {
            kind: PageInfoKind::Leaf,
            n_slots: hdr.n_slots,
            free: hdr.free,
            unused: hdr.unused,
        });
        let mut chains = Vec::new();
        for slot in 0..hdr.n_slots as usize {
            if let LeafPayload::Overflow(head) = read_leaf_entry(&data, slot).payload {
                chains.push(head);
            }
        }
        drop(data);
        drop(guard);
        for head in chains {
            stats_rec(td, &PageId::new(pid.vol_no, head), capacity, out)?;
        }
    } else if hdr.is_type(PAGE_TYPE_OVERFLOW) {
        let n_objects = hdr.n_slots;
        out.push(PageInfo {
            kind: PageInfoKind::Overflow,
            n_slots: n_objects,
            free: n_objects * OBJECT_ID_SIZE as u16,
            unused: 0,
        });
        let next = hdr.next;
        drop(data);
        drop(guard);
        if !next.is_nil() {
            stats_rec(td, &next, capacity, out)?;
        }
    } else {
        return Err(StratumError::new(
            ErrorKind::BadBtreePage(*pid),
            &format!("statistics: header {}", page::dump_prefix(&data)),
        ));
    }
    Ok(())
}

/// Read the full logical ObjectId list of a leaf entry.
pub(crate) fn entry_oids(
    td: &Thread,
    pid: &PageId,
    entry: &LeafEntry,
) -> Result<Vec<ObjectId>, StratumError> {
    match &entry.payload {
        LeafPayload::Inline(oids) => Ok(oids.clone()),
        LeafPayload::Overflow(head) => chain_oids(td, pid.vol_no, *head),
    }
}
