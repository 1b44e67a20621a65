//! Redo handlers: pure, idempotent functions from (page, log record)
//! to page. Recovery applies them single-threaded; a handler applied
//! twice leaves the page as after the first application.

use crate::{
    error::{ErrorKind, StratumError},
    ids::{ObjectId, PageId, OBJECT_ID_SIZE},
    io::{StratumReader, StratumWriter},
    page::{resize_entry, slot_offset},
    types::StratumResult,
    utils::aligned_length,
};

use crate::btree::page::{leaf_entry_len, LEAF_DATA_START};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogRecordKind {
    BtreeInsertOidIntoLeafEntry,
    BtreeDeleteOidFromLeafEntry,
}

/// A physiological log record: the operation kind, the page it
/// touches, and the operation's image payloads.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub kind: LogRecordKind,
    pub pid: PageId,
    pub images: Vec<Vec<u8>>,
}

/// Image payload shared by the leaf-entry OID handlers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OidInLeafEntryImage {
    pub slot_no: u16,
    pub oid_array_elem_no: u16,
    pub oid: ObjectId,
}

impl OidInLeafEntryImage {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = StratumWriter::new();
        w.write_u16(self.slot_no);
        w.write_u16(self.oid_array_elem_no);
        w.write(&self.oid);
        w.to_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StratumError> {
        if bytes.len() < 4 + OBJECT_ID_SIZE {
            return Err(StratumError::new(
                ErrorKind::BadParameter,
                "truncated oid image",
            ));
        }
        let mut r = StratumReader::new(bytes);
        Ok(Self {
            slot_no: r.read_u16(),
            oid_array_elem_no: r.read_u16(),
            oid: r.read(),
        })
    }
}

impl LogRecord {
    pub fn insert_oid_into_leaf_entry(
        pid: PageId,
        slot_no: u16,
        oid_array_elem_no: u16,
        oid: ObjectId,
    ) -> Self {
        Self {
            kind: LogRecordKind::BtreeInsertOidIntoLeafEntry,
            pid,
            images: vec![OidInLeafEntryImage {
                slot_no,
                oid_array_elem_no,
                oid,
            }
            .encode()],
        }
    }

    pub fn delete_oid_from_leaf_entry(
        pid: PageId,
        slot_no: u16,
        oid_array_elem_no: u16,
        oid: ObjectId,
    ) -> Self {
        Self {
            kind: LogRecordKind::BtreeDeleteOidFromLeafEntry,
            pid,
            images: vec![OidInLeafEntryImage {
                slot_no,
                oid_array_elem_no,
                oid,
            }
            .encode()],
        }
    }
}

/// Apply a log record to its page.
pub fn apply(page: &mut [u8], rec: &LogRecord) -> StratumResult {
    match rec.kind {
        LogRecordKind::BtreeInsertOidIntoLeafEntry => redo_btree_insert_oid_into_leaf_entry(page, rec),
        LogRecordKind::BtreeDeleteOidFromLeafEntry => redo_btree_delete_oid_from_leaf_entry(page, rec),
    }
}

struct LeafEntryPos {
    entry_off: usize,
    n_objects: i16,
    oid_array_off: usize,
}

fn locate_leaf_entry(page: &[u8], slot_no: u16) -> LeafEntryPos {
    let entry_off = slot_offset(page, slot_no as usize);
    let mut r = StratumReader::new(&page[entry_off..]);
    let klen = r.read_u16() as usize;
    let n_objects = r.read_i16();
    LeafEntryPos {
        entry_off,
        n_objects,
        oid_array_off: entry_off + 4 + aligned_length(klen),
    }
}

/// Redo inserting an ObjectId into a leaf entry's inline array.
///
/// Image: `{slot_no, oid_array_elem_no, oid}`. The entry grows by one
/// ObjectId, later array elements shift right, and `n_objects` is
/// bumped. Re-applying to a page that already holds the ObjectId at
/// that position is a no-op.
pub fn redo_btree_insert_oid_into_leaf_entry(page: &mut [u8], rec: &LogRecord) -> StratumResult {
    if rec.images.is_empty() {
        return Err(StratumError::new(ErrorKind::BadParameter, "missing image"));
    }
    let image = OidInLeafEntryImage::decode(&rec.images[0])?;

    let pos = locate_leaf_entry(page, image.slot_no);
    if pos.n_objects < 0 {
        return Err(StratumError::new(
            ErrorKind::BadBtreePage(rec.pid),
            "redo target entry is in overflow mode",
        ));
    }
    let n = pos.n_objects as usize;
    let elem = image.oid_array_elem_no as usize;
    if elem > n {
        return Err(StratumError::new(
            ErrorKind::BadParameter,
            "oid array position beyond entry",
        ));
    }

    // already applied?
    if elem < n {
        let off = pos.oid_array_off + elem * OBJECT_ID_SIZE;
        let existing: ObjectId = StratumReader::new(&page[off..]).read();
        if existing == image.oid {
            return Ok(());
        }
    }

    let entry_len = leaf_entry_len(&page[pos.entry_off..]);
    resize_entry(
        page,
        LEAF_DATA_START,
        image.slot_no as usize,
        entry_len + OBJECT_ID_SIZE,
        &leaf_entry_len,
    )?;
    // the entry may have moved
    let pos = locate_leaf_entry(page, image.slot_no);

    let array = pos.oid_array_off;
    let elem_off = array + elem * OBJECT_ID_SIZE;
    let tail = array + n * OBJECT_ID_SIZE;
    page.copy_within(elem_off..tail, elem_off + OBJECT_ID_SIZE);

    let mut w = StratumWriter::new();
    w.write(&image.oid);
    page[elem_off..elem_off + OBJECT_ID_SIZE].copy_from_slice(&w.to_bytes());

    let n_objects_off = pos.entry_off + 2;
    page[n_objects_off..n_objects_off + 2]
        .copy_from_slice(&((pos.n_objects + 1) as i16).to_le_bytes());
    Ok(())
}

/// Redo removing an ObjectId from a leaf entry's inline array; the
/// inverse of the insert handler, and equally idempotent.
pub fn redo_btree_delete_oid_from_leaf_entry(page: &mut [u8], rec: &LogRecord) -> StratumResult {
    if rec.images.is_empty() {
        return Err(StratumError::new(ErrorKind::BadParameter, "missing image"));
    }
    let image = OidInLeafEntryImage::decode(&rec.images[0])?;

    let pos = locate_leaf_entry(page, image.slot_no);
    if pos.n_objects < 0 {
        return Err(StratumError::new(
            ErrorKind::BadBtreePage(rec.pid),
            "redo target entry is in overflow mode",
        ));
    }
    let n = pos.n_objects as usize;
    let elem = image.oid_array_elem_no as usize;

    // already applied?
    if elem >= n {
        return Ok(());
    }
    let off = pos.oid_array_off + elem * OBJECT_ID_SIZE;
    let existing: ObjectId = StratumReader::new(&page[off..]).read();
    if existing != image.oid {
        return Ok(());
    }

    let tail = pos.oid_array_off + n * OBJECT_ID_SIZE;
    page.copy_within(off + OBJECT_ID_SIZE..tail, off);

    let entry_len = leaf_entry_len(&page[pos.entry_off..]);
    let n_objects_off = pos.entry_off + 2;
    page[n_objects_off..n_objects_off + 2]
        .copy_from_slice(&((pos.n_objects - 1) as i16).to_le_bytes());
    resize_entry(
        page,
        LEAF_DATA_START,
        image.slot_no as usize,
        entry_len - OBJECT_ID_SIZE,
        &leaf_entry_len,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::key::KeyValue;
    use crate::btree::page::{build_leaf_entry, read_leaf_entry, LeafPayload};
    use crate::page::{init_page, insert_entry, PAGE_TYPE_LEAF};

    fn leaf_with_oids(oids: &[ObjectId]) -> Vec<u8> {
        let mut page = vec![0u8; 1024];
        init_page(&mut page, PAGE_TYPE_LEAF, PageId::new(1, 7), LEAF_DATA_START);
        let entry = build_leaf_entry(
            &KeyValue::from_i32(5),
            &LeafPayload::Inline(oids.to_vec()),
        );
        insert_entry(&mut page, LEAF_DATA_START, 0, &entry, &leaf_entry_len).unwrap();
        page
    }

    #[test]
    fn test_insert_oid_redo() {
        let a = ObjectId::new(1, 10, 0, 1);
        let c = ObjectId::new(1, 30, 0, 3);
        let mut page = leaf_with_oids(&[a, c]);

        let b = ObjectId::new(1, 20, 0, 2);
        let rec = LogRecord::insert_oid_into_leaf_entry(PageId::new(1, 7), 0, 1, b);
        apply(&mut page, &rec).unwrap();

        match read_leaf_entry(&page, 0).payload {
            LeafPayload::Inline(oids) => assert_eq!(oids, vec![a, b, c]),
            _ => panic!("expected inline"),
        }
    }

    #[test]
    fn test_insert_oid_redo_is_idempotent() {
        let a = ObjectId::new(1, 10, 0, 1);
        let c = ObjectId::new(1, 30, 0, 3);
        let mut page = leaf_with_oids(&[a, c]);

        let b = ObjectId::new(1, 20, 0, 2);
        let rec = LogRecord::insert_oid_into_leaf_entry(PageId::new(1, 7), 0, 1, b);
        apply(&mut page, &rec).unwrap();
        let once = page.clone();
        apply(&mut page, &rec).unwrap();
        assert_eq!(page, once);
    }

    #[test]
    fn test_delete_oid_redo_is_idempotent() {
        let a = ObjectId::new(1, 10, 0, 1);
        let b = ObjectId::new(1, 20, 0, 2);
        let c = ObjectId::new(1, 30, 0, 3);
        let mut page = leaf_with_oids(&[a, b, c]);

        let rec = LogRecord::delete_oid_from_leaf_entry(PageId::new(1, 7), 0, 1, b);
        apply(&mut page, &rec).unwrap();
        let once = page.clone();
        apply(&mut page, &rec).unwrap();
        assert_eq!(page, once);

        match read_leaf_entry(&page, 0).payload {
            LeafPayload::Inline(oids) => assert_eq!(oids, vec![a, c]),
            _ => panic!("expected inline"),
        }
    }
}
