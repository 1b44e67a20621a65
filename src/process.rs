//! Per-process and per-thread state.
//!
//! A `Process` owns the shared tables: the volume table, the buffer
//! pools, per-volume catalog anchors, and the recovery manager's log
//! state. A `Thread` is obtained from `Process::attach` and passed to
//! every operation; it carries the resources that must not be shared
//! (the train-sized bounce buffer).

use std::{
    cell::{RefCell, RefMut},
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use once_cell::sync::OnceCell;

use crate::{
    buffer::{BufferConfig, BufferPool},
    catalog::{CatalogAnchors, TempIndexEntry},
    disk::{page_size, DiskManager, TRAIN_PAGES},
    ids::PageId,
    recovery::LogState,
    types::Pod,
};

pub struct Process {
    disk: Arc<DiskManager>,
    buffer: Arc<BufferPool>,

    /// One latch per index root; mutations hold it exclusive, scans
    /// shared.
    tree_latches: Mutex<HashMap<PageId, Arc<RwLock<()>>>>,

    log_state: Pod<Option<LogState>>,
    catalogs: Pod<HashMap<u16, CatalogAnchors>>,
    temp_indexes: Pod<Vec<TempIndexEntry>>,
}

static GLOBAL: OnceCell<Arc<Process>> = OnceCell::new();

impl Process {
    pub fn new(config: BufferConfig) -> Arc<Process> {
        let disk = Arc::new(DiskManager::new());
        let buffer = Arc::new(BufferPool::new(disk.clone(), config));
        Arc::new(Process {
            disk,
            buffer,
            tree_latches: Mutex::new(HashMap::new()),
            log_state: Arc::new(RwLock::new(None)),
            catalogs: Arc::new(RwLock::new(HashMap::new())),
            temp_indexes: Arc::new(RwLock::new(Vec::new())),
        })
    }

    /// Shared process for callers that want a single engine per OS
    /// process.
    pub fn global() -> &'static Arc<Process> {
        GLOBAL.get_or_init(|| Process::new(BufferConfig::default()))
    }

    pub fn attach(self: &Arc<Self>) -> Thread {
        Thread {
            process: self.clone(),
            train_scratch: RefCell::new(Vec::new()),
        }
    }

    pub fn disk(&self) -> &DiskManager {
        &self.disk
    }

    pub fn buffer(&self) -> &BufferPool {
        &self.buffer
    }

    pub fn tree_latch(&self, root: &PageId) -> Arc<RwLock<()>> {
        let mut latches = self.tree_latches.lock().unwrap();
        latches
            .entry(*root)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub(crate) fn drop_tree_latch(&self, root: &PageId) {
        self.tree_latches.lock().unwrap().remove(root);
    }

    pub(crate) fn log_state(&self) -> &RwLock<Option<LogState>> {
        &self.log_state
    }

    pub(crate) fn catalogs(&self) -> &RwLock<HashMap<u16, CatalogAnchors>> {
        &self.catalogs
    }

    pub(crate) fn temp_indexes(&self) -> &RwLock<Vec<TempIndexEntry>> {
        &self.temp_indexes
    }
}

/// A thread's handle on the engine. Not `Sync`: each thread attaches
/// its own.
pub struct Thread {
    process: Arc<Process>,
    train_scratch: RefCell<Vec<u8>>,
}

impl Thread {
    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    pub fn disk(&self) -> &DiskManager {
        self.process.disk()
    }

    pub fn buffer(&self) -> &BufferPool {
        self.process.buffer()
    }

    pub fn tree_latch(&self, root: &PageId) -> Arc<RwLock<()>> {
        self.process.tree_latch(root)
    }

    /// Train-sized bounce buffer for raw train I/O.
    pub fn train_scratch(&self) -> RefMut<'_, Vec<u8>> {
        let mut buf = self.train_scratch.borrow_mut();
        buf.resize(TRAIN_PAGES * page_size(), 0);
        buf
    }
}
