//! Raw disk manager: multi-device volumes, extent-based page
//! allocation, and page/train I/O.

mod alloc;
mod volume;

pub use alloc::{AllocMap, FillFactorPolicy};
pub use volume::{
    DiskManager, Volume, VolumeHeader, VolumeKind, MAX_NUM_VOLS, VOLUME_MAGIC_DATA,
    VOLUME_MAGIC_LOG,
};

use std::sync::atomic::{AtomicUsize, Ordering};

pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Pages per train. Train I/O moves this many contiguous pages at once.
pub const TRAIN_PAGES: usize = 4;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_PAGE_SIZE);

pub fn page_size() -> usize {
    PAGE_SIZE.load(Ordering::Relaxed)
}

/// Change the page size. Only sensible before any volume is formatted;
/// tests shrink pages to force deep trees out of small datasets.
pub fn set_page_size(size: usize) {
    PAGE_SIZE.store(size, Ordering::Relaxed);
}

/// A train size is either a single page or a full train.
pub fn valid_train_size(size: usize) -> bool {
    size == 1 || size == TRAIN_PAGES
}

/// Allocation context of an object file: where its pages come from.
/// Derived from the owning file's catalog entry.
#[derive(Debug, Clone, Copy)]
pub struct AllocScope {
    pub vol_no: u16,
    pub first_ext: u32,
    pub fill_factor: u16,
}

impl AllocScope {
    pub fn new(vol_no: u16, first_ext: u32, fill_factor: u16) -> Self {
        Self {
            vol_no,
            first_ext,
            fill_factor,
        }
    }
}
