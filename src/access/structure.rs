//! Shared plumbing of the paged data structures: page memory, WAL sink and
//! the reuse list pages are allocated from.

use anyhow::Result;
use std::fmt;
use std::sync::Arc;

use crate::access::freelist::ReuseList;
use crate::storage::handler;
use crate::storage::memory::{PageMemory, PageWriteGuard};
use crate::storage::page::{PageId, FLAG_IDX};
use crate::storage::wal::{DeltaRecord, WalSink};

/// Collection of free page ids travelling between a structure and a reuse
/// list.
pub trait ReuseBag {
    fn add_free_page(&mut self, page_id: PageId);

    fn poll_free_page(&mut self) -> Option<PageId>;

    fn is_empty(&self) -> bool;

    fn len(&self) -> usize;
}

/// Vector backed bag, polled from the back.
#[derive(Debug, Default, Clone)]
pub struct LongListBag(Vec<PageId>);

impl LongListBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page_ids(&self) -> &[PageId] {
        &self.0
    }
}

impl ReuseBag for LongListBag {
    fn add_free_page(&mut self, page_id: PageId) {
        self.0.push(page_id);
    }

    fn poll_free_page(&mut self) -> Option<PageId> {
        self.0.pop()
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Bag holding at most one page.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingletonBag(Option<PageId>);

impl SingletonBag {
    pub fn new(page_id: PageId) -> Self {
        Self(Some(page_id))
    }
}

impl ReuseBag for SingletonBag {
    fn add_free_page(&mut self, page_id: PageId) {
        debug_assert!(self.0.is_none(), "singleton bag is full");
        self.0 = Some(page_id);
    }

    fn poll_free_page(&mut self) -> Option<PageId> {
        self.0.take()
    }

    fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    fn len(&self) -> usize {
        usize::from(self.0.is_some())
    }
}

/// Handle shared by a tree or list: where its pages live, where their
/// mutations are logged and where freed pages go.
#[derive(Clone)]
pub struct DataStructure {
    mem: PageMemory,
    wal: Option<Arc<dyn WalSink>>,
    reuse_list: Option<Arc<dyn ReuseList>>,
}

impl DataStructure {
    pub fn new(
        mem: PageMemory,
        wal: Option<Arc<dyn WalSink>>,
        reuse_list: Option<Arc<dyn ReuseList>>,
    ) -> Self {
        Self {
            mem,
            wal,
            reuse_list,
        }
    }

    pub fn mem(&self) -> &PageMemory {
        &self.mem
    }

    pub fn wal(&self) -> Option<&dyn WalSink> {
        self.wal.as_deref()
    }

    pub fn reuse_list(&self) -> Option<&Arc<dyn ReuseList>> {
        self.reuse_list.as_ref()
    }

    pub fn page_size(&self) -> usize {
        self.mem.page_size()
    }

    /// Takes a page from the bag, then from the reuse list, and only then
    /// allocates a fresh one.
    pub fn allocate_page(&self, bag: Option<&mut (dyn ReuseBag + '_)>) -> Result<PageId> {
        if let Some(page_id) = bag.and_then(|bag| bag.poll_free_page()) {
            return Ok(page_id.change_type(FLAG_IDX));
        }
        if let Some(reuse_list) = &self.reuse_list {
            if let Some(page_id) = reuse_list.take_recycled_page()? {
                return Ok(page_id.change_type(FLAG_IDX));
            }
        }
        self.allocate_page_no_reuse()
    }

    pub fn allocate_page_no_reuse(&self) -> Result<PageId> {
        self.mem.allocate_page(FLAG_IDX)
    }

    /// Logs `record` for `page` when the page needs a delta.
    pub fn log(&self, page: &PageWriteGuard, record: impl FnOnce() -> DeltaRecord) -> Result<()> {
        handler::log_delta(self.wal(), page, record)
    }
}

impl fmt::Debug for DataStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStructure")
            .field("page_size", &self.page_size())
            .field("wal", &self.wal.is_some())
            .field("reuse_list", &self.reuse_list.is_some())
            .finish()
    }
}
