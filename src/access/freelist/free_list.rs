use anyhow::{ensure, Result};

use crate::access::freelist::pages_list::PagesList;
use crate::access::structure::DataStructure;
use crate::storage::memory::PageWriteGuard;
use crate::storage::page::{DataPageIo, PageId, PageInit};

/// Data pages grouped by free space. Node pages it frees go to the reuse
/// list of its structure.
pub struct FreeList {
    list: PagesList,
    shift: u32,
}

impl FreeList {
    pub fn new(
        name: impl Into<String>,
        structure: DataStructure,
        buckets: usize,
        meta_page_id: PageId,
        init_new: bool,
    ) -> Result<Self> {
        ensure!(
            buckets.is_power_of_two(),
            "Free list buckets must be a power of two, got {}",
            buckets
        );
        let page_size = structure.page_size();
        ensure!(
            page_size.is_power_of_two() && page_size >= buckets,
            "Page size {} cannot be split into {} buckets",
            page_size,
            buckets
        );
        let shift = page_size.trailing_zeros() - buckets.trailing_zeros();
        let list = PagesList::new(name, structure, buckets, None, meta_page_id, init_new)?;
        Ok(Self { list, shift })
    }

    /// Bucket holding pages with `free_space` bytes available.
    pub fn bucket(&self, free_space: usize) -> usize {
        (free_space >> self.shift).min(self.list.buckets() - 1)
    }

    /// Files the latched data page under the bucket of its free space.
    /// Returns the bucket used.
    pub fn put_data_page(&self, data_page: &mut PageWriteGuard) -> Result<usize> {
        let bucket = self.bucket(DataPageIo.free_space(data_page));
        self.list.put_data_page(data_page, bucket)?;
        Ok(bucket)
    }

    /// Takes the latched data page out of `bucket`.
    pub fn remove_data_page(&self, data_page: &mut PageWriteGuard, bucket: usize) -> Result<bool> {
        self.list.remove_data_page(data_page, bucket)
    }

    /// Takes some data page with at least `required` bytes free.
    pub fn take_page(&self, required: usize, init: Option<&dyn PageInit>) -> Result<Option<PageId>> {
        for bucket in self.bucket(required)..self.list.buckets() {
            if let Some(page_id) = self.list.take_empty_page(bucket, init)? {
                return Ok(Some(page_id));
            }
        }
        Ok(None)
    }

    pub fn save_metadata(&self) -> Result<()> {
        self.list.save_metadata()
    }

    pub fn pages_list(&self) -> &PagesList {
        &self.list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::freelist::{ReuseList, ReuseListImpl};
    use crate::storage::handler;
    use crate::storage::memory::{PageMemory, PageMemoryConfig};
    use crate::storage::page::FLAG_DATA;
    use std::sync::Arc;

    fn setup() -> Result<(PageMemory, Arc<ReuseListImpl>, FreeList)> {
        let mem = PageMemory::new(PageMemoryConfig {
            page_size: 256,
            partition: 0,
        })?;
        let reuse = Arc::new(ReuseListImpl::create("reuse", mem.clone(), None)?);
        let reuse_dyn: Arc<dyn ReuseList> = reuse.clone();
        let structure = DataStructure::new(mem.clone(), None, Some(reuse_dyn));
        let meta = structure.allocate_page_no_reuse()?;
        let free = FreeList::new("free", structure, 8, meta, true)?;
        Ok((mem, reuse, free))
    }

    fn data_page(mem: &PageMemory, free_space: usize) -> Result<PageId> {
        let id = mem.allocate_page(FLAG_DATA)?;
        let mut page = mem.write(id)?;
        handler::init_page_locked(None, &mut page, id, &DataPageIo)?;
        DataPageIo.set_free_space(&mut page, free_space);
        Ok(id)
    }

    #[test]
    fn test_buckets_by_free_space() -> Result<()> {
        let (_, _, free) = setup()?;
        // 256 bytes over 8 buckets.
        assert_eq!(free.bucket(0), 0);
        assert_eq!(free.bucket(31), 0);
        assert_eq!(free.bucket(32), 1);
        assert_eq!(free.bucket(255), 7);
        assert_eq!(free.bucket(10_000), 7);
        Ok(())
    }

    #[test]
    fn test_take_page_with_room() -> Result<()> {
        let (mem, _, free) = setup()?;
        let small = data_page(&mem, 40)?;
        let large = data_page(&mem, 200)?;
        for id in [small, large] {
            let mut page = mem.write(id)?;
            free.put_data_page(&mut page)?;
        }

        assert_eq!(free.take_page(150, None)?, Some(large));
        assert_eq!(free.take_page(150, None)?, None);
        assert_eq!(free.take_page(10, None)?, Some(small));
        Ok(())
    }

    #[test]
    fn test_freed_nodes_go_to_reuse_list() -> Result<()> {
        let (mem, reuse, free) = setup()?;
        let id = data_page(&mem, 100)?;
        let bucket = {
            let mut page = mem.write(id)?;
            free.put_data_page(&mut page)?
        };
        assert_eq!(reuse.recycled_pages_count()?, 0);

        let mut page = mem.write(id)?;
        assert!(free.remove_data_page(&mut page, bucket)?);
        drop(page);
        // The emptied stripe node was recycled.
        assert_eq!(reuse.recycled_pages_count()?, 1);
        Ok(())
    }

    #[test]
    fn test_rejects_odd_bucket_count() -> Result<()> {
        let mem = PageMemory::new(PageMemoryConfig {
            page_size: 256,
            partition: 0,
        })?;
        let structure = DataStructure::new(mem, None, None);
        let meta = structure.allocate_page_no_reuse()?;
        assert!(FreeList::new("free", structure, 6, meta, true).is_err());
        Ok(())
    }
}
