use std::fmt;

use crate::io::{Decodeable, Encodeable, StratumReader, StratumWriter};

/// Identifier of a page: the volume it lives on and its global page
/// number inside that volume's data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId {
    pub vol_no: u16,
    pub page_no: u32,
}

/// A train is identified by its first page.
pub type TrainId = PageId;

pub const PAGE_ID_SIZE: usize = 6;

impl PageId {
    pub fn new(vol_no: u16, page_no: u32) -> Self {
        Self { vol_no, page_no }
    }

    /// The "no page" sentinel used by on-disk links.
    pub fn nil() -> Self {
        Self {
            vol_no: u16::MAX,
            page_no: u32::MAX,
        }
    }

    pub fn is_nil(&self) -> bool {
        self.page_no == u32::MAX
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {})", self.vol_no, self.page_no)
    }
}

impl Encodeable for PageId {
    fn encode_to(&self, writer: &mut StratumWriter) {
        writer.write_u16(self.vol_no);
        writer.write_u32(self.page_no);
    }
}

impl Decodeable for PageId {
    fn decode_from(reader: &mut StratumReader<'_>) -> Self {
        let vol_no = reader.read_u16();
        let page_no = reader.read_u32();
        Self { vol_no, page_no }
    }
}

/// Identifier of a stored object: the page and slot holding it, plus a
/// unique tag that detects slot reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    pub vol_no: u16,
    pub page_no: u32,
    pub slot_no: u16,
    pub unique: u32,
}

pub const OBJECT_ID_SIZE: usize = 12;

impl ObjectId {
    pub fn new(vol_no: u16, page_no: u32, slot_no: u16, unique: u32) -> Self {
        Self {
            vol_no,
            page_no,
            slot_no,
            unique,
        }
    }

    pub fn nil() -> Self {
        Self {
            vol_no: u16::MAX,
            page_no: u32::MAX,
            slot_no: u16::MAX,
            unique: 0,
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.vol_no, self.page_no, self.slot_no, self.unique
        )
    }
}

impl Encodeable for ObjectId {
    fn encode_to(&self, writer: &mut StratumWriter) {
        writer.write_u16(self.vol_no);
        writer.write_u32(self.page_no);
        writer.write_u16(self.slot_no);
        writer.write_u32(self.unique);
    }
}

impl Decodeable for ObjectId {
    fn decode_from(reader: &mut StratumReader<'_>) -> Self {
        let vol_no = reader.read_u16();
        let page_no = reader.read_u32();
        let slot_no = reader.read_u16();
        let unique = reader.read_u32();
        Self {
            vol_no,
            page_no,
            slot_no,
            unique,
        }
    }
}

/// Logical identifier of an object file on a data volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    pub vol_no: u16,
    pub serial: u32,
}

impl FileId {
    pub fn new(vol_no: u16, serial: u32) -> Self {
        Self { vol_no, serial }
    }
}

/// Logical identifier of an index. Stays fixed across root page
/// changes; the physical root is resolved through the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexId {
    pub vol_no: u16,
    pub serial: u32,
}

impl IndexId {
    pub fn new(vol_no: u16, serial: u32) -> Self {
        Self { vol_no, serial }
    }
}

/// Physical identifier of an index: its root page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalIndexId {
    pub vol_no: u16,
    pub root_page_no: u32,
}

impl PhysicalIndexId {
    pub fn new(vol_no: u16, root_page_no: u32) -> Self {
        Self {
            vol_no,
            root_page_no,
        }
    }

    pub fn root(&self) -> PageId {
        PageId::new(self.vol_no, self.root_page_no)
    }
}
