//! B+Tree meta page: the first page of every level, root level last.

use crate::storage::page::page_io::{
    read_page_id, write_page_id, PageInit, PageIo, COMMON_HEADER_END, T_BPLUS_META,
};
use crate::storage::page::PageId;

const LVLS_OFF: usize = COMMON_HEADER_END;
const REFS_OFF: usize = LVLS_OFF + 1;

#[derive(Debug, Clone, Copy, Default)]
pub struct BPlusMetaIo;

impl BPlusMetaIo {
    pub const PAGE_IO: PageIo = PageIo::new(T_BPLUS_META, 1);

    pub fn init_new_page(&self, buf: &mut [u8], page_id: PageId) {
        Self::PAGE_IO.init_new_page(buf, page_id);
        self.set_levels_count(buf, 0);
    }

    /// Upper bound on tree height for this page size.
    pub fn max_levels(&self, page_size: usize) -> usize {
        ((page_size - REFS_OFF) / 8).min(u8::MAX as usize)
    }

    pub fn levels_count(&self, buf: &[u8]) -> usize {
        buf[LVLS_OFF] as usize
    }

    fn set_levels_count(&self, buf: &mut [u8], lvls: usize) {
        debug_assert!(lvls <= u8::MAX as usize);
        buf[LVLS_OFF] = lvls as u8;
    }

    /// Root level, `-1` for a meta page without any root.
    pub fn root_level(&self, buf: &[u8]) -> i32 {
        self.levels_count(buf) as i32 - 1
    }

    fn offset(lvl: usize) -> usize {
        REFS_OFF + lvl * 8
    }

    pub fn first_page_id(&self, buf: &[u8], lvl: usize) -> PageId {
        debug_assert!(lvl < self.levels_count(buf));
        read_page_id(buf, Self::offset(lvl))
    }

    fn set_first_page_id(&self, buf: &mut [u8], lvl: usize, page_id: PageId) {
        write_page_id(buf, Self::offset(lvl), page_id)
    }

    /// Resets the meta page to a single-level tree rooted at `root_id`.
    pub fn init_root(&self, buf: &mut [u8], root_id: PageId) {
        self.set_levels_count(buf, 1);
        self.set_first_page_id(buf, 0, root_id);
    }

    /// Adds a level on top; `root_id` becomes the new root.
    pub fn add_root(&self, buf: &mut [u8], root_id: PageId) {
        let lvl = self.levels_count(buf);
        self.set_levels_count(buf, lvl + 1);
        self.set_first_page_id(buf, lvl, root_id);
    }

    /// Drops the top level.
    pub fn cut_root(&self, buf: &mut [u8]) {
        let lvls = self.levels_count(buf);
        debug_assert!(lvls > 1);
        self.set_levels_count(buf, lvls - 1);
    }
}

impl PageInit for BPlusMetaIo {
    fn page_io(&self) -> PageIo {
        Self::PAGE_IO
    }

    fn init_new_page(&self, buf: &mut [u8], page_id: PageId) {
        BPlusMetaIo::init_new_page(self, buf, page_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::page_io;

    #[test]
    fn test_root_lifecycle() {
        let io = BPlusMetaIo;
        let mut buf = vec![0u8; 256];
        io.init_new_page(&mut buf, PageId(1));
        assert_eq!(io.root_level(&buf), -1);
        assert_eq!(page_io::page_type(&buf), T_BPLUS_META);

        io.init_root(&mut buf, PageId(2));
        assert_eq!(io.root_level(&buf), 0);
        assert_eq!(io.first_page_id(&buf, 0), PageId(2));

        io.add_root(&mut buf, PageId(3));
        io.add_root(&mut buf, PageId(4));
        assert_eq!(io.root_level(&buf), 2);
        assert_eq!(io.first_page_id(&buf, 2), PageId(4));

        io.cut_root(&mut buf);
        assert_eq!(io.levels_count(&buf), 2);
        assert_eq!(io.first_page_id(&buf, 1), PageId(3));
        assert_eq!(io.first_page_id(&buf, 0), PageId(2));
    }
}
