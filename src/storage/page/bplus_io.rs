//! Layout of B+Tree inner and leaf pages.
//!
//! Both kinds share a small header after the common one:
//!
//! ```text
//! +---------------+-------+------------+-----------+-------------
//! | common header | count | forward id | remove id | items ...
//! |      40       |   2   |     8      |     8     |
//! +---------------+-------+------------+-----------+-------------
//! ```
//!
//! Leaf items are packed rows. Inner items interleave child links with keys:
//! `left(0) key(0) left(1) key(1) ... left(cnt)`, where `right(i)` and
//! `left(i + 1)` are the same slot. An inner page with zero keys still routes
//! to its single child `left(0)`.

use byteorder::{ByteOrder, LittleEndian};

use crate::storage::page::page_io::{
    read_page_id, write_page_id, PageInit, PageIo, COMMON_HEADER_END, T_BPLUS_INNER, T_BPLUS_LEAF,
};
use crate::storage::page::PageId;

const CNT_OFF: usize = COMMON_HEADER_END;
const FORWARD_OFF: usize = CNT_OFF + 2;
const REMOVE_ID_OFF: usize = FORWARD_OFF + 8;
/// First byte of the item area.
pub const ITEMS_OFF: usize = REMOVE_ID_OFF + 8;

const LINK_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Inner,
    Leaf,
}

/// Codec for one kind of tree page with a fixed item size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BPlusIo {
    kind: PageKind,
    item_size: usize,
    max_count: usize,
}

impl BPlusIo {
    /// Builds the codec for a page kind. `cap` lowers the natural capacity of
    /// the page, it never raises it.
    pub fn new(kind: PageKind, item_size: usize, page_size: usize, cap: Option<usize>) -> Self {
        let natural = match kind {
            PageKind::Leaf => page_size.saturating_sub(ITEMS_OFF) / item_size,
            PageKind::Inner => {
                page_size.saturating_sub(ITEMS_OFF + LINK_SIZE) / (item_size + LINK_SIZE)
            }
        };
        let max_count = match cap {
            Some(cap) => natural.min(cap),
            None => natural,
        };
        Self {
            kind,
            item_size,
            max_count,
        }
    }

    pub fn kind(&self) -> PageKind {
        self.kind
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == PageKind::Leaf
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn page_io(&self) -> PageIo {
        match self.kind {
            PageKind::Inner => PageIo::new(T_BPLUS_INNER, 1),
            PageKind::Leaf => PageIo::new(T_BPLUS_LEAF, 1),
        }
    }

    pub fn init_new_page(&self, buf: &mut [u8], page_id: PageId) {
        self.page_io().init_new_page(buf, page_id);
        set_count(buf, 0);
        set_forward(buf, PageId::NONE);
        set_remove_id(buf, 0);
    }

    pub fn count(&self, buf: &[u8]) -> usize {
        count(buf)
    }

    pub fn set_count(&self, buf: &mut [u8], cnt: usize) {
        set_count(buf, cnt)
    }

    pub fn forward(&self, buf: &[u8]) -> PageId {
        forward(buf)
    }

    pub fn set_forward(&self, buf: &mut [u8], page_id: PageId) {
        set_forward(buf, page_id)
    }

    pub fn remove_id(&self, buf: &[u8]) -> u64 {
        remove_id(buf)
    }

    pub fn set_remove_id(&self, buf: &mut [u8], rmv_id: u64) {
        set_remove_id(buf, rmv_id)
    }

    /// Byte offset of the item (key) at `idx`.
    pub fn item_offset(&self, idx: usize) -> usize {
        match self.kind {
            PageKind::Leaf => ITEMS_OFF + idx * self.item_size,
            PageKind::Inner => ITEMS_OFF + LINK_SIZE + idx * (self.item_size + LINK_SIZE),
        }
    }

    pub fn item<'a>(&self, buf: &'a [u8], idx: usize) -> &'a [u8] {
        let off = self.item_offset(idx);
        &buf[off..off + self.item_size]
    }

    pub fn item_mut<'a>(&self, buf: &'a mut [u8], idx: usize) -> &'a mut [u8] {
        let off = self.item_offset(idx);
        &mut buf[off..off + self.item_size]
    }

    /// Overwrites the item at `idx` with already encoded bytes.
    pub fn store(&self, buf: &mut [u8], idx: usize, item: &[u8]) {
        self.item_mut(buf, idx).copy_from_slice(&item[..self.item_size]);
    }

    fn left_offset(&self, idx: usize) -> usize {
        debug_assert!(!self.is_leaf());
        ITEMS_OFF + idx * (self.item_size + LINK_SIZE)
    }

    /// Child link left of the key at `idx`. `left(cnt)` is the rightmost child.
    pub fn left(&self, buf: &[u8], idx: usize) -> PageId {
        read_page_id(buf, self.left_offset(idx))
    }

    pub fn set_left(&self, buf: &mut [u8], idx: usize, page_id: PageId) {
        write_page_id(buf, self.left_offset(idx), page_id)
    }

    pub fn right(&self, buf: &[u8], idx: usize) -> PageId {
        self.left(buf, idx + 1)
    }

    pub fn set_right(&self, buf: &mut [u8], idx: usize, page_id: PageId) {
        self.set_left(buf, idx + 1, page_id)
    }

    fn block_size(&self) -> usize {
        match self.kind {
            PageKind::Leaf => self.item_size,
            PageKind::Inner => self.item_size + LINK_SIZE,
        }
    }

    /// Moves `cnt` items (with their right links) inside one page.
    fn shift_items(&self, buf: &mut [u8], src_idx: usize, dst_idx: usize, cnt: usize) {
        if cnt == 0 {
            return;
        }
        let src = self.item_offset(src_idx);
        let len = cnt * self.block_size();
        buf.copy_within(src..src + len, self.item_offset(dst_idx));
    }

    /// Copies `cnt` items from one page to another; `cp_left` also copies the
    /// left link of the first item.
    fn copy_items(
        &self,
        src: &[u8],
        dst: &mut [u8],
        src_idx: usize,
        dst_idx: usize,
        cnt: usize,
        cp_left: bool,
    ) {
        if cp_left && !self.is_leaf() {
            let left = self.left(src, src_idx);
            self.set_left(dst, dst_idx, left);
        }
        if cnt == 0 {
            return;
        }
        let src_off = self.item_offset(src_idx);
        let dst_off = self.item_offset(dst_idx);
        let len = cnt * self.block_size();
        dst[dst_off..dst_off + len].copy_from_slice(&src[src_off..src_off + len]);
    }

    /// Inserts an encoded item at `idx`. On inner pages `right_id` becomes the
    /// right child of the new key.
    pub fn insert(&self, buf: &mut [u8], idx: usize, item: &[u8], right_id: PageId) {
        let cnt = self.count(buf);
        self.shift_items(buf, idx, idx + 1, cnt - idx);
        self.set_count(buf, cnt + 1);
        self.store(buf, idx, item);
        if !self.is_leaf() {
            self.set_right(buf, idx, right_id);
        }
    }

    /// Removes the item at `idx`. On inner pages the right link goes with it.
    pub fn remove(&self, buf: &mut [u8], idx: usize, cnt: usize) {
        debug_assert!(idx < cnt);
        let cnt = cnt - 1;
        self.shift_items(buf, idx + 1, idx, cnt - idx);
        self.set_count(buf, cnt);
    }

    /// Initializes `fwd_buf` as the forward half of a split at `mid`.
    pub fn split_forward_page(
        &self,
        buf: &[u8],
        fwd_id: PageId,
        fwd_buf: &mut [u8],
        mid: usize,
        cnt: usize,
    ) {
        self.init_new_page(fwd_buf, fwd_id);
        let moved = cnt - mid;
        self.copy_items(buf, fwd_buf, mid, 0, moved, true);
        self.set_count(fwd_buf, moved);
        self.set_forward(fwd_buf, self.forward(buf));
        // A retry must still happen for readers that saw an inner replace on the split page.
        self.set_remove_id(fwd_buf, self.remove_id(buf));
    }

    pub fn split_existing_page(&self, buf: &mut [u8], mid: usize, fwd_id: PageId) {
        self.set_count(buf, mid);
        self.set_forward(buf, fwd_id);
    }

    /// Moves everything from `right` into `left`. On inner pages the separator
    /// key comes down from the parent, unless an empty branch is being merged,
    /// in which case the separator is dropped and the left page keeps its own
    /// rightmost link.
    ///
    /// Returns `false` when the merged page would not fit.
    pub fn merge(
        &self,
        prnt_io: &BPlusIo,
        prnt: &[u8],
        prnt_idx: usize,
        left: &mut [u8],
        right: &[u8],
        empty_branch: bool,
    ) -> bool {
        let mut left_cnt = self.count(left);
        let right_cnt = self.count(right);
        let mut new_cnt = left_cnt + right_cnt;
        let move_down = !self.is_leaf() && !empty_branch;
        if move_down {
            new_cnt += 1;
        }
        if new_cnt > self.max_count {
            debug_assert!(!empty_branch);
            return false;
        }

        self.set_count(left, new_cnt);
        if move_down {
            let key = prnt_io.item(prnt, prnt_idx);
            self.store(left, left_cnt, key);
            left_cnt += 1;
        }
        self.copy_items(right, left, 0, left_cnt, right_cnt, move_down);
        self.set_forward(left, self.forward(right));

        let rmv_id = self.remove_id(right);
        if rmv_id > self.remove_id(left) {
            self.set_remove_id(left, rmv_id);
        }
        true
    }

    /// Initializes a new root with a single key over two children.
    pub fn init_new_root(
        &self,
        buf: &mut [u8],
        root_id: PageId,
        left_id: PageId,
        key: &[u8],
        right_id: PageId,
    ) {
        debug_assert!(!self.is_leaf());
        self.init_new_page(buf, root_id);
        self.set_count(buf, 1);
        self.set_left(buf, 0, left_id);
        self.store(buf, 0, key);
        self.set_right(buf, 0, right_id);
    }
}

impl PageInit for BPlusIo {
    fn page_io(&self) -> PageIo {
        BPlusIo::page_io(self)
    }

    fn init_new_page(&self, buf: &mut [u8], page_id: PageId) {
        BPlusIo::init_new_page(self, buf, page_id)
    }
}

pub fn count(buf: &[u8]) -> usize {
    LittleEndian::read_u16(&buf[CNT_OFF..]) as usize
}

pub fn set_count(buf: &mut [u8], cnt: usize) {
    debug_assert!(cnt <= u16::MAX as usize);
    LittleEndian::write_u16(&mut buf[CNT_OFF..], cnt as u16);
}

pub fn forward(buf: &[u8]) -> PageId {
    read_page_id(buf, FORWARD_OFF)
}

pub fn set_forward(buf: &mut [u8], page_id: PageId) {
    write_page_id(buf, FORWARD_OFF, page_id)
}

pub fn remove_id(buf: &[u8]) -> u64 {
    LittleEndian::read_u64(&buf[REMOVE_ID_OFF..])
}

pub fn set_remove_id(buf: &mut [u8], rmv_id: u64) {
    LittleEndian::write_u64(&mut buf[REMOVE_ID_OFF..], rmv_id)
}
