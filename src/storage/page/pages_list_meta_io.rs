//! Meta page chain of a pages list: the stripe tails of every bucket.
//!
//! ```text
//! +---------------+-------+--------------+--------------------------------
//! | common header | count | next meta id | (bucket u16, tail id u64) ...
//! |      40       |   2   |      8       |   10 bytes each
//! +---------------+-------+--------------+--------------------------------
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::storage::page::page_io::{
    read_page_id, write_page_id, PageInit, PageIo, COMMON_HEADER_END, T_PAGE_LIST_META,
};
use crate::storage::page::PageId;

const CNT_OFF: usize = COMMON_HEADER_END;
const NEXT_META_PAGE_OFF: usize = CNT_OFF + 2;
const ITEMS_OFF: usize = NEXT_META_PAGE_OFF + 8;
const ITEM_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, Default)]
pub struct PagesListMetaIo;

impl PagesListMetaIo {
    pub const PAGE_IO: PageIo = PageIo::new(T_PAGE_LIST_META, 1);

    pub fn init_new_page(&self, buf: &mut [u8], page_id: PageId) {
        Self::PAGE_IO.init_new_page(buf, page_id);
        self.set_count(buf, 0);
        self.set_next_meta_page_id(buf, PageId::NONE);
    }

    pub fn count(&self, buf: &[u8]) -> usize {
        LittleEndian::read_u16(&buf[CNT_OFF..]) as usize
    }

    fn set_count(&self, buf: &mut [u8], cnt: usize) {
        LittleEndian::write_u16(&mut buf[CNT_OFF..], cnt as u16);
    }

    pub fn next_meta_page_id(&self, buf: &[u8]) -> PageId {
        read_page_id(buf, NEXT_META_PAGE_OFF)
    }

    pub fn set_next_meta_page_id(&self, buf: &mut [u8], page_id: PageId) {
        write_page_id(buf, NEXT_META_PAGE_OFF, page_id)
    }

    pub fn capacity(&self, page_size: usize) -> usize {
        (page_size - ITEMS_OFF) / ITEM_SIZE
    }

    pub fn reset_count(&self, buf: &mut [u8]) {
        self.set_count(buf, 0);
    }

    /// Appends as many `tails[from..]` of `bucket` as fit. Returns how many
    /// were written.
    pub fn add_tails(&self, buf: &mut [u8], bucket: usize, tails: &[PageId], from: usize) -> usize {
        let cnt = self.count(buf);
        let cap = self.capacity(buf.len());
        if cnt == cap {
            return 0;
        }
        let written = (tails.len() - from).min(cap - cnt);
        for (i, tail) in tails[from..from + written].iter().enumerate() {
            let off = ITEMS_OFF + (cnt + i) * ITEM_SIZE;
            LittleEndian::write_u16(&mut buf[off..], bucket as u16);
            write_page_id(buf, off + 2, *tail);
        }
        self.set_count(buf, cnt + written);
        written
    }

    /// Reads every `(bucket, tail)` entry of this page.
    pub fn bucket_tails(&self, buf: &[u8]) -> Vec<(usize, PageId)> {
        (0..self.count(buf))
            .map(|i| {
                let off = ITEMS_OFF + i * ITEM_SIZE;
                let bucket = LittleEndian::read_u16(&buf[off..]) as usize;
                (bucket, read_page_id(buf, off + 2))
            })
            .collect()
    }
}

impl PageInit for PagesListMetaIo {
    fn page_io(&self) -> PageIo {
        Self::PAGE_IO
    }

    fn init_new_page(&self, buf: &mut [u8], page_id: PageId) {
        PagesListMetaIo::init_new_page(self, buf, page_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_read_tails() {
        let io = PagesListMetaIo;
        let mut buf = vec![0u8; 256];
        io.init_new_page(&mut buf, PageId(1));

        let tails = [PageId(10), PageId(11)];
        assert_eq!(io.add_tails(&mut buf, 3, &tails, 0), 2);
        assert_eq!(io.add_tails(&mut buf, 7, &[PageId(20)], 0), 1);

        assert_eq!(
            io.bucket_tails(&buf),
            vec![(3, PageId(10)), (3, PageId(11)), (7, PageId(20))]
        );
    }

    #[test]
    fn test_add_tails_stops_at_capacity() {
        let io = PagesListMetaIo;
        let mut buf = vec![0u8; ITEMS_OFF + 2 * ITEM_SIZE];
        io.init_new_page(&mut buf, PageId(1));
        let tails: Vec<PageId> = (1..=5).map(PageId).collect();

        assert_eq!(io.add_tails(&mut buf, 0, &tails, 0), 2);
        assert_eq!(io.add_tails(&mut buf, 0, &tails, 2), 0);

        let mut next = vec![0u8; ITEMS_OFF + 4 * ITEM_SIZE];
        io.init_new_page(&mut next, PageId(2));
        assert_eq!(io.add_tails(&mut next, 0, &tails, 2), 3);
        assert_eq!(io.bucket_tails(&next)[0], (0, PageId(3)));
    }
}
