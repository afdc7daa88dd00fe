//! Header of a data page as far as free lists care about it.
//!
//! Row storage lives above this crate; the free list only needs to know
//! which list node references the page and how much room the page has.

use byteorder::{ByteOrder, LittleEndian};

use crate::storage::page::page_io::{
    read_page_id, write_page_id, PageInit, PageIo, COMMON_HEADER_END, T_DATA,
};
use crate::storage::page::PageId;

const FREE_LIST_PAGE_ID_OFF: usize = COMMON_HEADER_END;
const FREE_SPACE_OFF: usize = FREE_LIST_PAGE_ID_OFF + 8;
const ROWS_CNT_OFF: usize = FREE_SPACE_OFF + 2;
const DATA_OFF: usize = ROWS_CNT_OFF + 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct DataPageIo;

impl DataPageIo {
    pub const PAGE_IO: PageIo = PageIo::new(T_DATA, 1);

    pub fn init_new_page(&self, buf: &mut [u8], page_id: PageId) {
        Self::PAGE_IO.init_new_page(buf, page_id);
        self.set_free_list_page_id(buf, PageId::NONE);
        self.set_free_space(buf, buf.len() - DATA_OFF);
        self.set_rows_count(buf, 0);
    }

    /// Free list node currently referencing this page.
    pub fn free_list_page_id(&self, buf: &[u8]) -> PageId {
        read_page_id(buf, FREE_LIST_PAGE_ID_OFF)
    }

    pub fn set_free_list_page_id(&self, buf: &mut [u8], page_id: PageId) {
        write_page_id(buf, FREE_LIST_PAGE_ID_OFF, page_id)
    }

    pub fn free_space(&self, buf: &[u8]) -> usize {
        LittleEndian::read_u16(&buf[FREE_SPACE_OFF..]) as usize
    }

    pub fn set_free_space(&self, buf: &mut [u8], free: usize) {
        LittleEndian::write_u16(&mut buf[FREE_SPACE_OFF..], free.min(u16::MAX as usize) as u16);
    }

    pub fn rows_count(&self, buf: &[u8]) -> usize {
        LittleEndian::read_u16(&buf[ROWS_CNT_OFF..]) as usize
    }

    pub fn set_rows_count(&self, buf: &mut [u8], cnt: usize) {
        LittleEndian::write_u16(&mut buf[ROWS_CNT_OFF..], cnt as u16);
    }

    pub fn is_empty(&self, buf: &[u8]) -> bool {
        self.rows_count(buf) == 0
    }
}

impl PageInit for DataPageIo {
    fn page_io(&self) -> PageIo {
        Self::PAGE_IO
    }

    fn init_new_page(&self, buf: &mut [u8], page_id: PageId) {
        DataPageIo::init_new_page(self, buf, page_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_data_page() {
        let io = DataPageIo;
        let mut buf = vec![0u8; 1024];
        io.init_new_page(&mut buf, PageId(4));
        assert!(io.is_empty(&buf));
        assert_eq!(io.free_space(&buf), 1024 - DATA_OFF);
        assert!(io.free_list_page_id(&buf).is_none());

        io.set_free_list_page_id(&mut buf, PageId(9));
        io.set_rows_count(&mut buf, 2);
        assert_eq!(io.free_list_page_id(&buf), PageId(9));
        assert!(!io.is_empty(&buf));
    }
}
