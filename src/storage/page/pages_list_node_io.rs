//! Node page of a pages list stripe.
//!
//! ```text
//! +---------------+----------+------+-------+-------------
//! | common header | previous | next | count | page ids ...
//! |      40       |    8     |  8   |   2   |  8 each
//! +---------------+----------+------+-------+-------------
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::storage::page::page_io::{
    read_page_id, write_page_id, PageInit, PageIo, COMMON_HEADER_END, T_PAGE_LIST_NODE,
};
use crate::storage::page::PageId;

const PREV_PAGE_ID_OFF: usize = COMMON_HEADER_END;
const NEXT_PAGE_ID_OFF: usize = PREV_PAGE_ID_OFF + 8;
const CNT_OFF: usize = NEXT_PAGE_ID_OFF + 8;
const PAGE_IDS_OFF: usize = CNT_OFF + 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct PagesListNodeIo;

impl PagesListNodeIo {
    pub const PAGE_IO: PageIo = PageIo::new(T_PAGE_LIST_NODE, 1);

    pub fn init_new_page(&self, buf: &mut [u8], page_id: PageId) {
        Self::PAGE_IO.init_new_page(buf, page_id);
        self.set_empty(buf);
        self.set_previous_id(buf, PageId::NONE);
        self.set_next_id(buf, PageId::NONE);
    }

    fn set_empty(&self, buf: &mut [u8]) {
        self.set_count(buf, 0);
    }

    pub fn next_id(&self, buf: &[u8]) -> PageId {
        read_page_id(buf, NEXT_PAGE_ID_OFF)
    }

    pub fn set_next_id(&self, buf: &mut [u8], next_id: PageId) {
        write_page_id(buf, NEXT_PAGE_ID_OFF, next_id)
    }

    pub fn previous_id(&self, buf: &[u8]) -> PageId {
        read_page_id(buf, PREV_PAGE_ID_OFF)
    }

    pub fn set_previous_id(&self, buf: &mut [u8], prev_id: PageId) {
        write_page_id(buf, PREV_PAGE_ID_OFF, prev_id)
    }

    pub fn count(&self, buf: &[u8]) -> usize {
        LittleEndian::read_u16(&buf[CNT_OFF..]) as usize
    }

    fn set_count(&self, buf: &mut [u8], cnt: usize) {
        LittleEndian::write_u16(&mut buf[CNT_OFF..], cnt as u16);
    }

    pub fn capacity(&self, page_size: usize) -> usize {
        (page_size - PAGE_IDS_OFF) / 8
    }

    pub fn is_empty(&self, buf: &[u8]) -> bool {
        self.count(buf) == 0
    }

    fn offset(idx: usize) -> usize {
        PAGE_IDS_OFF + idx * 8
    }

    pub fn page_at(&self, buf: &[u8], idx: usize) -> PageId {
        read_page_id(buf, Self::offset(idx))
    }

    fn set_page_at(&self, buf: &mut [u8], idx: usize, page_id: PageId) {
        write_page_id(buf, Self::offset(idx), page_id)
    }

    /// Appends a page id. Returns the slot it landed in, or `None` when the
    /// node is full.
    pub fn add_page(&self, buf: &mut [u8], page_id: PageId) -> Option<usize> {
        let cnt = self.count(buf);
        if cnt == self.capacity(buf.len()) {
            return None;
        }
        self.set_page_at(buf, cnt, page_id);
        self.set_count(buf, cnt + 1);
        Some(cnt)
    }

    /// Removes the given id keeping the order of the others. Returns `false`
    /// if the node does not hold it.
    pub fn remove_page(&self, buf: &mut [u8], page_id: PageId) -> bool {
        let cnt = self.count(buf);
        let Some(idx) = (0..cnt).find(|&i| self.page_at(buf, i) == page_id) else {
            return false;
        };
        if idx + 1 < cnt {
            let src = Self::offset(idx + 1);
            let end = Self::offset(cnt);
            buf.copy_within(src..end, Self::offset(idx));
        }
        self.set_count(buf, cnt - 1);
        true
    }

    /// Pops the last page id, `None` when the node is empty.
    pub fn take_any_page(&self, buf: &mut [u8]) -> Option<PageId> {
        let cnt = self.count(buf);
        if cnt == 0 {
            return None;
        }
        let page_id = self.page_at(buf, cnt - 1);
        self.set_count(buf, cnt - 1);
        Some(page_id)
    }
}

impl PageInit for PagesListNodeIo {
    fn page_io(&self) -> PageIo {
        Self::PAGE_IO
    }

    fn init_new_page(&self, buf: &mut [u8], page_id: PageId) {
        PagesListNodeIo::init_new_page(self, buf, page_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(page_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; page_size];
        PagesListNodeIo.init_new_page(&mut buf, PageId(1));
        buf
    }

    #[test]
    fn test_links() {
        let io = PagesListNodeIo;
        let mut buf = node(128);
        assert!(io.previous_id(&buf).is_none());
        io.set_previous_id(&mut buf, PageId(5));
        io.set_next_id(&mut buf, PageId(6));
        assert_eq!(io.previous_id(&buf), PageId(5));
        assert_eq!(io.next_id(&buf), PageId(6));
    }

    #[test]
    fn test_add_until_full() {
        let io = PagesListNodeIo;
        let mut buf = node(PAGE_IDS_OFF + 3 * 8);
        assert_eq!(io.capacity(buf.len()), 3);
        assert_eq!(io.add_page(&mut buf, PageId(10)), Some(0));
        assert_eq!(io.add_page(&mut buf, PageId(11)), Some(1));
        assert_eq!(io.add_page(&mut buf, PageId(12)), Some(2));
        assert_eq!(io.add_page(&mut buf, PageId(13)), None);
        assert_eq!(io.count(&buf), 3);
    }

    #[test]
    fn test_remove_keeps_order() {
        let io = PagesListNodeIo;
        let mut buf = node(256);
        for id in 10..15 {
            io.add_page(&mut buf, PageId(id));
        }
        assert!(io.remove_page(&mut buf, PageId(12)));
        assert!(!io.remove_page(&mut buf, PageId(12)));
        let ids: Vec<u64> = (0..io.count(&buf)).map(|i| io.page_at(&buf, i).0).collect();
        assert_eq!(ids, vec![10, 11, 13, 14]);

        assert_eq!(io.take_any_page(&mut buf), Some(PageId(14)));
        assert_eq!(io.count(&buf), 3);
    }

    #[test]
    fn test_take_from_empty() {
        let io = PagesListNodeIo;
        let mut buf = node(128);
        assert!(io.is_empty(&buf));
        assert_eq!(io.take_any_page(&mut buf), None);
    }
}
