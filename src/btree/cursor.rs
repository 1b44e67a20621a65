//! Index scans. A cursor points at one `(key, ObjectId)` position in
//! a leaf; forward scans follow the leaf chain's next links, backward
//! scans follow prev.

use log::debug;

use crate::{
    buffer::BufferClass,
    error::{ErrorKind, StratumError},
    ids::{ObjectId, PageId},
    page::{read_header, PAGE_TYPE_INTERNAL, PAGE_TYPE_LEAF},
    process::Thread,
};

use super::{
    key::{check_key, compare_keys, KeyDesc, KeyValue},
    page::{internal_child_for, internal_p0, read_internal_entry, read_leaf_entry, search_leaf},
    tree::entry_oids,
};

/// Comparison operators for scan bounds. `Eof`/`Bof` open a scan at
/// the far end with no key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompOp {
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
    Eof,
    Bof,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CursorFlag {
    On,
    Eos,
}

#[derive(Debug, Clone)]
pub struct Cursor {
    pub flag: CursorFlag,
    pub pid: PageId,
    pub slot_no: usize,
    pub oid_no: usize,
    pub oid: ObjectId,
    pub key: KeyValue,
    forward: bool,
    stop_key: Option<KeyValue>,
    stop_op: CompOp,
}

impl Cursor {
    fn eos(forward: bool) -> Self {
        Self {
            flag: CursorFlag::Eos,
            pid: PageId::nil(),
            slot_no: 0,
            oid_no: 0,
            oid: ObjectId::nil(),
            key: KeyValue::from_bytes(Vec::new()),
            forward,
            stop_key: None,
            stop_op: CompOp::Eof,
        }
    }

    pub fn is_on(&self) -> bool {
        self.flag == CursorFlag::On
    }
}

/// Open a scan. `start_op` fixes the first position and the scan
/// direction: `Eq`/`Ge`/`Gt`/`Bof` scan forward, `Le`/`Lt`/`Eof`
/// backward. The stop condition is checked against every visited key.
pub fn fetch(
    td: &Thread,
    root: &PageId,
    kdesc: &KeyDesc,
    start_key: Option<&KeyValue>,
    start_op: CompOp,
    stop_key: Option<&KeyValue>,
    stop_op: CompOp,
) -> Result<Cursor, StratumError> {
    debug!("btree fetch: root {}, op {:?}", root, start_op);
    if let Some(k) = start_key {
        check_key(kdesc, k)?;
    }

    let latch = td.tree_latch(root);
    let _guard = latch.read().unwrap();

    let forward = matches!(start_op, CompOp::Eq | CompOp::Ge | CompOp::Gt | CompOp::Bof);

    let (pid, slot) = match start_op {
        CompOp::Bof => {
            let pid = extreme_leaf(td, root, false)?;
            (pid, Some(0))
        }
        CompOp::Eof => {
            let pid = extreme_leaf(td, root, true)?;
            let guard = td.buffer().get_train(&pid, BufferClass::Page)?;
            let n = read_header(&guard.read()).n_slots as usize;
            (pid, n.checked_sub(1))
        }
        _ => {
            let kval = start_key.ok_or_else(|| {
                StratumError::new(ErrorKind::BadParameter, "keyed fetch without a key")
            })?;
            let pid = descend_to_leaf(td, root, kdesc, kval)?;
            let guard = td.buffer().get_train(&pid, BufferClass::Page)?;
            let (found, lo) = search_leaf(&guard.read(), kdesc, kval)?;
            let slot = match start_op {
                CompOp::Eq => {
                    if !found {
                        return Ok(Cursor::eos(forward));
                    }
                    Some(lo)
                }
                CompOp::Ge => Some(lo),
                CompOp::Gt => {
                    if found {
                        Some(lo + 1)
                    } else {
                        Some(lo)
                    }
                }
                // last key <= kval is lo - 1 unless an equal key sits
                // at lo
                CompOp::Le => {
                    if found {
                        Some(lo)
                    } else {
                        lo.checked_sub(1)
                    }
                }
                CompOp::Lt => lo.checked_sub(1),
                _ => unreachable!(),
            };
            (pid, slot)
        }
    };

    let stop_key = stop_key.cloned();
    position(td, kdesc, pid, slot, forward, stop_key, stop_op)
}

/// Advance a cursor one ObjectId. The entry's logical oid list is
/// advanced by value, so a concurrent delete of the current position
/// does not skip survivors.
pub fn fetch_next(
    td: &Thread,
    root: &PageId,
    kdesc: &KeyDesc,
    cursor: &Cursor,
) -> Result<Cursor, StratumError> {
    if cursor.flag == CursorFlag::Eos {
        return Ok(cursor.clone());
    }

    let latch = td.tree_latch(root);
    let _guard = latch.read().unwrap();

    // re-anchor: the leaf may have split or merged since
    let (pid, slot_now) = {
        let guard = td.buffer().get_train(&cursor.pid, BufferClass::Page)?;
        let data = guard.read();
        let hdr = read_header(&data);
        let anchored = hdr.is_type(PAGE_TYPE_LEAF) && {
            let (found, slot) = search_leaf(&data, kdesc, &cursor.key)?;
            found && slot < hdr.n_slots as usize
        };
        if anchored {
            let (_, slot) = search_leaf(&data, kdesc, &cursor.key)?;
            (cursor.pid, Some(slot))
        } else {
            drop(data);
            drop(guard);
            let pid = descend_to_leaf(td, root, kdesc, &cursor.key)?;
            let guard = td.buffer().get_train(&pid, BufferClass::Page)?;
            let (found, slot) = search_leaf(&guard.read(), kdesc, &cursor.key)?;
            if found {
                (pid, Some(slot))
            } else {
                // the whole key is gone; fall to the neighbor slot
                (pid, if cursor.forward { Some(slot) } else { slot.checked_sub(1) })
            }
        }
    };

    let slot = match slot_now {
        Some(s) => s,
        None => {
            return step_page(td, kdesc, pid, cursor.forward, cursor.stop_key.clone(), cursor.stop_op);
        }
    };

    // same key: advance within its oid list
    let guard = td.buffer().get_train(&pid, BufferClass::Page)?;
    let n_slots = read_header(&guard.read()).n_slots as usize;
    if slot >= n_slots {
        drop(guard);
        return step_page(td, kdesc, pid, cursor.forward, cursor.stop_key.clone(), cursor.stop_op);
    }
    let entry = read_leaf_entry(&guard.read(), slot);
    let same_key = compare_keys(kdesc, &entry.key, &cursor.key)? == std::cmp::Ordering::Equal;
    drop(guard);

    if same_key {
        let oids = entry_oids(td, &pid, &entry)?;
        let next_no = if cursor.forward {
            match oids.binary_search(&cursor.oid) {
                Ok(i) => Some(i + 1),
                Err(i) => Some(i),
            }
            .filter(|&i| i < oids.len())
        } else {
            match oids.binary_search(&cursor.oid) {
                Ok(i) => i.checked_sub(1),
                Err(i) => i.checked_sub(1),
            }
        };
        if let Some(oid_no) = next_no {
            let mut c = cursor.clone();
            c.pid = pid;
            c.slot_no = slot;
            c.oid_no = oid_no;
            c.oid = oids[oid_no];
            return Ok(c);
        }
    }

    // move to the neighboring entry
    let next_slot = if cursor.forward {
        if same_key { Some(slot + 1) } else { Some(slot) }
    } else {
        if same_key { slot.checked_sub(1) } else { Some(slot) }
    };

    let n = {
        let guard = td.buffer().get_train(&pid, BufferClass::Page)?;
        let n_slots = read_header(&guard.read()).n_slots as usize;
        n_slots
    };
    match next_slot {
        Some(s) if s < n => position(
            td,
            kdesc,
            pid,
            Some(s),
            cursor.forward,
            cursor.stop_key.clone(),
            cursor.stop_op,
        ),
        _ => step_page(td, kdesc, pid, cursor.forward, cursor.stop_key.clone(), cursor.stop_op),
    }
}

/// Move to the first non-empty neighbor leaf and position at its near
/// end.
fn step_page(
    td: &Thread,
    kdesc: &KeyDesc,
    from: PageId,
    forward: bool,
    stop_key: Option<KeyValue>,
    stop_op: CompOp,
) -> Result<Cursor, StratumError> {
    let mut pid = {
        let guard = td.buffer().get_train(&from, BufferClass::Page)?;
        let hdr = read_header(&guard.read());
        if forward {
            hdr.next
        } else {
            hdr.prev
        }
    };

    loop {
        if pid.is_nil() {
            return Ok(Cursor::eos(forward));
        }
        let guard = td.buffer().get_train(&pid, BufferClass::Page)?;
        let hdr = read_header(&guard.read());
        let n = hdr.n_slots as usize;
        if n > 0 {
            let slot = if forward { 0 } else { n - 1 };
            drop(guard);
            return position(td, kdesc, pid, Some(slot), forward, stop_key, stop_op);
        }
        pid = if forward { hdr.next } else { hdr.prev };
    }
}

/// Build an `On` cursor at `(pid, slot)`, or walk to a neighbor page
/// when `slot` is out of range; applies the stop condition.
fn position(
    td: &Thread,
    kdesc: &KeyDesc,
    pid: PageId,
    slot: Option<usize>,
    forward: bool,
    stop_key: Option<KeyValue>,
    stop_op: CompOp,
) -> Result<Cursor, StratumError> {
    let slot = match slot {
        None => return step_page(td, kdesc, pid, forward, stop_key, stop_op),
        Some(s) => s,
    };

    let entry = {
        let guard = td.buffer().get_train(&pid, BufferClass::Page)?;
        let data = guard.read();
        let n = read_header(&data).n_slots as usize;
        if slot >= n {
            drop(data);
            drop(guard);
            return step_page(td, kdesc, pid, forward, stop_key, stop_op);
        }
        read_leaf_entry(&data, slot)
    };

    if !stop_allows(kdesc, &entry.key, forward, &stop_key, stop_op)? {
        return Ok(Cursor::eos(forward));
    }

    let oids = entry_oids(td, &pid, &entry)?;
    let oid_no = if forward { 0 } else { oids.len() - 1 };
    Ok(Cursor {
        flag: CursorFlag::On,
        pid,
        slot_no: slot,
        oid_no,
        oid: oids[oid_no],
        key: entry.key,
        forward,
        stop_key,
        stop_op,
    })
}

fn stop_allows(
    kdesc: &KeyDesc,
    key: &KeyValue,
    forward: bool,
    stop_key: &Option<KeyValue>,
    stop_op: CompOp,
) -> Result<bool, StratumError> {
    let stop = match stop_key {
        None => return Ok(true),
        Some(s) => s,
    };
    let ord = compare_keys(kdesc, key, stop)?;
    let ok = if forward {
        match stop_op {
            CompOp::Eq => ord == std::cmp::Ordering::Equal,
            CompOp::Lt => ord == std::cmp::Ordering::Less,
            CompOp::Le => ord != std::cmp::Ordering::Greater,
            _ => true,
        }
    } else {
        match stop_op {
            CompOp::Eq => ord == std::cmp::Ordering::Equal,
            CompOp::Gt => ord == std::cmp::Ordering::Greater,
            CompOp::Ge => ord != std::cmp::Ordering::Less,
            _ => true,
        }
    };
    Ok(ok)
}

fn descend_to_leaf(
    td: &Thread,
    root: &PageId,
    kdesc: &KeyDesc,
    kval: &KeyValue,
) -> Result<PageId, StratumError> {
    let mut pid = *root;
    loop {
        let guard = td.buffer().get_train(&pid, BufferClass::Page)?;
        let data = guard.read();
        let hdr = read_header(&data);
        if hdr.is_type(PAGE_TYPE_LEAF) {
            return Ok(pid);
        }
        if !hdr.is_type(PAGE_TYPE_INTERNAL) {
            return Err(StratumError::new(
                ErrorKind::BadBtreePage(pid),
                "descend hit a non-btree page",
            ));
        }
        let (child, _) = internal_child_for(&data, kdesc, kval)?;
        pid = PageId::new(pid.vol_no, child);
    }
}

/// Leftmost (`rightmost = false`) or rightmost leaf of the tree.
fn extreme_leaf(td: &Thread, root: &PageId, rightmost: bool) -> Result<PageId, StratumError> {
    let mut pid = *root;
    loop {
        let guard = td.buffer().get_train(&pid, BufferClass::Page)?;
        let data = guard.read();
        let hdr = read_header(&data);
        if hdr.is_type(PAGE_TYPE_LEAF) {
            return Ok(pid);
        }
        if !hdr.is_type(PAGE_TYPE_INTERNAL) {
            return Err(StratumError::new(
                ErrorKind::BadBtreePage(pid),
                "descend hit a non-btree page",
            ));
        }
        let child = if rightmost && hdr.n_slots > 0 {
            read_internal_entry(&data, hdr.n_slots as usize - 1).0
        } else {
            internal_p0(&data)
        };
        pid = PageId::new(pid.vol_no, child);
    }
}
