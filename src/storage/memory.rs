//! Page memory: the resident set of page frames with per-page latches.
//!
//! Every page a structure touches lives in a frame keyed by its effective id
//! (partition and index), so all rotations of a page share one frame and one
//! latch. Frames are never evicted. When a backing file is configured, pages
//! missing from memory are loaded from it on first access and `flush` writes
//! modified frames back.

use crate::storage::disk::{PageManager, PAGE_SIZE};
use crate::storage::error::StorageError;
use crate::storage::page::{PageId, COMMON_HEADER_END};
use anyhow::{bail, Result};
use dashmap::DashMap;
use log::debug;
use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    Mutex, RawRwLock, RwLock,
};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

const POLICY_UNSET: u8 = 0;
const POLICY_TRUE: u8 = 1;
const POLICY_FALSE: u8 = 2;

#[derive(Debug, Clone)]
pub struct PageMemoryConfig {
    pub page_size: usize,
    /// Partition stamped into every allocated page id.
    pub partition: u16,
}

impl Default for PageMemoryConfig {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            partition: 0,
        }
    }
}

struct Frame {
    buf: Arc<RwLock<Box<[u8]>>>,
    /// Modified since the last checkpoint.
    dirty: AtomicBool,
    /// Modified since the last flush to the backing file.
    unflushed: AtomicBool,
    full_page_wal: AtomicU8,
}

impl Frame {
    fn new(buf: Box<[u8]>) -> Self {
        Self {
            buf: Arc::new(RwLock::new(buf)),
            dirty: AtomicBool::new(false),
            unflushed: AtomicBool::new(false),
            full_page_wal: AtomicU8::new(POLICY_UNSET),
        }
    }
}

#[derive(Clone)]
pub struct PageMemory {
    inner: Arc<PageMemoryInner>,
}

struct PageMemoryInner {
    config: PageMemoryConfig,
    frames: DashMap<PageId, Arc<Frame>>,
    next_index: AtomicU32,
    page_manager: Option<Mutex<PageManager>>,
}

impl PageMemory {
    /// Purely in-memory page memory.
    pub fn new(config: PageMemoryConfig) -> Result<Self> {
        Self::with_manager(config, None, 0)
    }

    /// Page memory over a new, empty page file.
    pub fn create(path: &Path, config: PageMemoryConfig) -> Result<Self> {
        let pm = PageManager::create(path, config.page_size)?;
        Self::with_manager(config, Some(pm), 0)
    }

    /// Page memory over an existing page file. Pages are loaded lazily.
    pub fn open(path: &Path, config: PageMemoryConfig) -> Result<Self> {
        let pm = PageManager::open(path, config.page_size)?;
        let pages = pm.num_pages()?;
        Self::with_manager(config, Some(pm), pages)
    }

    fn with_manager(
        config: PageMemoryConfig,
        page_manager: Option<PageManager>,
        next_index: u32,
    ) -> Result<Self> {
        if config.page_size <= COMMON_HEADER_END * 2 {
            return Err(StorageError::PageSizeTooSmall(config.page_size).into());
        }
        Ok(Self {
            inner: Arc::new(PageMemoryInner {
                config,
                frames: DashMap::new(),
                next_index: AtomicU32::new(next_index),
                page_manager: page_manager.map(Mutex::new),
            }),
        })
    }

    pub fn page_size(&self) -> usize {
        self.inner.config.page_size
    }

    pub fn partition(&self) -> u16 {
        self.inner.config.partition
    }

    /// Number of page slots handed out so far.
    pub fn allocated_pages(&self) -> u32 {
        self.inner.next_index.load(Ordering::SeqCst)
    }

    /// Allocates a brand-new zeroed page with the given flag.
    pub fn allocate_page(&self, flag: u8) -> Result<PageId> {
        let index = self.inner.next_index.fetch_add(1, Ordering::SeqCst);
        if index == u32::MAX {
            bail!("Page index space exhausted");
        }
        let page_id = PageId::new(self.inner.config.partition, flag, index);
        let buf = vec![0u8; self.inner.config.page_size].into_boxed_slice();
        self.inner
            .frames
            .insert(page_id.effective(), Arc::new(Frame::new(buf)));
        Ok(page_id)
    }

    fn frame(&self, page_id: PageId) -> Result<Arc<Frame>> {
        let key = page_id.effective();
        if let Some(frame) = self.inner.frames.get(&key) {
            return Ok(frame.value().clone());
        }

        let Some(pm) = &self.inner.page_manager else {
            return Err(StorageError::PageNotFound(page_id).into());
        };
        if page_id.index() >= self.allocated_pages() {
            return Err(StorageError::PageNotFound(page_id).into());
        }

        let mut buf = vec![0u8; self.inner.config.page_size].into_boxed_slice();
        pm.lock().read_page(page_id, &mut buf)?;

        // Another thread may have loaded it meanwhile; keep whichever landed first.
        let frame = self
            .inner
            .frames
            .entry(key)
            .or_insert_with(|| Arc::new(Frame::new(buf)))
            .value()
            .clone();
        Ok(frame)
    }

    /// Acquires the shared latch of a page.
    pub fn read(&self, page_id: PageId) -> Result<PageReadGuard> {
        let frame = self.frame(page_id)?;
        let guard = frame.buf.read_arc();
        Ok(PageReadGuard { page_id, guard })
    }

    /// Acquires the exclusive latch of a page.
    pub fn write(&self, page_id: PageId) -> Result<PageWriteGuard> {
        let frame = self.frame(page_id)?;
        let guard = frame.buf.write_arc();
        Ok(PageWriteGuard {
            page_id,
            frame,
            guard,
            written: false,
        })
    }

    /// Writes every frame modified since the last flush to the backing file.
    pub fn flush(&self) -> Result<()> {
        let Some(pm) = &self.inner.page_manager else {
            return Ok(());
        };
        let frames: Vec<(PageId, Arc<Frame>)> = self
            .inner
            .frames
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut pm = pm.lock();
        let mut written = 0usize;
        for (page_id, frame) in frames {
            if frame.unflushed.swap(false, Ordering::SeqCst) {
                let buf = frame.buf.read();
                pm.write_page(page_id, &buf)?;
                written += 1;
            }
        }
        pm.sync()?;
        debug!("Flushed {} pages", written);
        Ok(())
    }

    /// Flushes and starts a new checkpoint period: every page counts as clean
    /// again and per-page WAL policies are reset.
    pub fn checkpoint(&self) -> Result<()> {
        self.flush()?;
        for frame in self.inner.frames.iter() {
            frame.dirty.store(false, Ordering::SeqCst);
            frame.full_page_wal.store(POLICY_UNSET, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Shared latch on a page.
pub struct PageReadGuard {
    page_id: PageId,
    guard: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
}

impl PageReadGuard {
    /// Id the page was acquired by. May differ from the id inside the buffer
    /// if the page was recycled.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for PageReadGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

/// Exclusive latch on a page. Marks the page dirty on release if the buffer
/// was borrowed mutably.
pub struct PageWriteGuard {
    page_id: PageId,
    frame: Arc<Frame>,
    guard: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
    written: bool,
}

impl PageWriteGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Whether the page was modified earlier in the current checkpoint period.
    pub fn is_dirty(&self) -> bool {
        self.frame.dirty.load(Ordering::SeqCst)
    }

    /// `Some(true)` forces full page images, `Some(false)` forces delta
    /// records, `None` leaves the decision to the dirty state.
    pub fn full_page_wal_policy(&self) -> Option<bool> {
        match self.frame.full_page_wal.load(Ordering::SeqCst) {
            POLICY_TRUE => Some(true),
            POLICY_FALSE => Some(false),
            _ => None,
        }
    }

    pub fn set_full_page_wal_policy(&self, policy: Option<bool>) {
        let v = match policy {
            Some(true) => POLICY_TRUE,
            Some(false) => POLICY_FALSE,
            None => POLICY_UNSET,
        };
        self.frame.full_page_wal.store(v, Ordering::SeqCst);
    }
}

impl Deref for PageWriteGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.written = true;
        &mut self.guard
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        if self.written {
            self.frame.dirty.store(true, Ordering::SeqCst);
            self.frame.unflushed.store(true, Ordering::SeqCst);
        }
    }
}
