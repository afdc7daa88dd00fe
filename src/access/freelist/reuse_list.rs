use anyhow::Result;
use std::sync::Arc;

use crate::access::freelist::pages_list::PagesList;
use crate::access::structure::{DataStructure, ReuseBag};
use crate::storage::memory::PageMemory;
use crate::storage::page::PageId;
use crate::storage::wal::WalSink;

const REUSE_BUCKET: usize = 0;

/// Pool of recycled pages shared by the structures of a page memory.
pub trait ReuseList: Send + Sync {
    /// Moves every page of the bag into the pool.
    fn add_for_recycle(&self, bag: &mut dyn ReuseBag) -> Result<()>;

    /// Takes a recycled page, `None` if the pool is empty.
    fn take_recycled_page(&self) -> Result<Option<PageId>>;

    fn recycled_pages_count(&self) -> Result<usize>;
}

/// A pages list with a single reuse bucket. Its own node pages are always
/// freshly allocated.
pub struct ReuseListImpl {
    list: PagesList,
}

impl ReuseListImpl {
    pub fn new(
        name: impl Into<String>,
        mem: PageMemory,
        wal: Option<Arc<dyn WalSink>>,
        meta_page_id: PageId,
        init_new: bool,
    ) -> Result<Self> {
        let structure = DataStructure::new(mem, wal, None);
        let list = PagesList::new(name, structure, 1, Some(REUSE_BUCKET), meta_page_id, init_new)?;
        Ok(Self { list })
    }

    /// Allocates a meta page and creates an empty reuse list on it.
    pub fn create(name: impl Into<String>, mem: PageMemory, wal: Option<Arc<dyn WalSink>>) -> Result<Self> {
        let structure = DataStructure::new(mem.clone(), wal.clone(), None);
        let meta_page_id = structure.allocate_page_no_reuse()?;
        Self::new(name, mem, wal, meta_page_id, true)
    }

    pub fn meta_page_id(&self) -> PageId {
        self.list.meta_page_id()
    }

    pub fn save_metadata(&self) -> Result<()> {
        self.list.save_metadata()
    }

    pub fn pages_list(&self) -> &PagesList {
        &self.list
    }
}

impl ReuseList for ReuseListImpl {
    fn add_for_recycle(&self, bag: &mut dyn ReuseBag) -> Result<()> {
        self.list.put_bag(bag, REUSE_BUCKET)
    }

    fn take_recycled_page(&self) -> Result<Option<PageId>> {
        self.list.take_empty_page(REUSE_BUCKET, None)
    }

    fn recycled_pages_count(&self) -> Result<usize> {
        self.list.stored_pages_count(REUSE_BUCKET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::structure::{LongListBag, SingletonBag};
    use crate::storage::memory::PageMemoryConfig;

    fn memory() -> Result<PageMemory> {
        PageMemory::new(PageMemoryConfig {
            page_size: 256,
            partition: 0,
        })
    }

    #[test]
    fn test_recycle_and_take() -> Result<()> {
        let mem = memory()?;
        let reuse = ReuseListImpl::create("reuse", mem.clone(), None)?;
        assert_eq!(reuse.take_recycled_page()?, None);

        let page = mem.allocate_page(crate::storage::page::FLAG_IDX)?;
        reuse.add_for_recycle(&mut SingletonBag::new(page))?;
        assert_eq!(reuse.recycled_pages_count()?, 1);

        assert_eq!(reuse.take_recycled_page()?, Some(page));
        assert_eq!(reuse.recycled_pages_count()?, 0);
        assert_eq!(reuse.take_recycled_page()?, None);
        Ok(())
    }

    #[test]
    fn test_structure_allocates_from_reuse_list() -> Result<()> {
        let mem = memory()?;
        let reuse: Arc<dyn ReuseList> = Arc::new(ReuseListImpl::create("reuse", mem.clone(), None)?);
        let structure = DataStructure::new(mem.clone(), None, Some(reuse.clone()));

        let mut bag = LongListBag::new();
        for _ in 0..10 {
            bag.add_free_page(structure.allocate_page_no_reuse()?);
        }
        reuse.add_for_recycle(&mut bag)?;
        let allocated = mem.allocated_pages();

        for _ in 0..10 {
            structure.allocate_page(None)?;
        }
        // All ten came out of the reuse list.
        assert_eq!(mem.allocated_pages(), allocated);
        structure.allocate_page(None)?;
        assert_eq!(mem.allocated_pages(), allocated + 1);
        Ok(())
    }

    #[test]
    fn test_reopen() -> Result<()> {
        let mem = memory()?;
        let reuse = ReuseListImpl::create("reuse", mem.clone(), None)?;
        let mut bag = LongListBag::new();
        for _ in 0..50 {
            bag.add_free_page(mem.allocate_page(crate::storage::page::FLAG_IDX)?);
        }
        reuse.add_for_recycle(&mut bag)?;
        reuse.save_metadata()?;
        let count = reuse.recycled_pages_count()?;

        let reopened = ReuseListImpl::new("reuse", mem, None, reuse.meta_page_id(), false)?;
        assert_eq!(reopened.recycled_pages_count()?, count);
        let mut taken = 0;
        while reopened.take_recycled_page()?.is_some() {
            taken += 1;
        }
        assert_eq!(taken, 50);
        Ok(())
    }
}
