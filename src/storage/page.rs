pub mod bplus_io;
pub mod bplus_meta_io;
pub mod data_page_io;
pub mod page_io;
pub mod pages_list_meta_io;
pub mod pages_list_node_io;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use bplus_io::{BPlusIo, PageKind};
pub use bplus_meta_io::BPlusMetaIo;
pub use data_page_io::DataPageIo;
pub use page_io::{PageInit, PageIo, COMMON_HEADER_END};
pub use pages_list_meta_io::PagesListMetaIo;
pub use pages_list_node_io::PagesListNodeIo;

/// Flag for pages holding user data.
pub const FLAG_DATA: u8 = 1;
/// Flag for pages holding index structures (tree pages, list nodes, meta pages).
pub const FLAG_IDX: u8 = 2;

const PAGE_IDX_MASK: u64 = 0xFFFF_FFFF;
const PART_ID_SHIFT: u32 = 32;
const PART_ID_MASK: u64 = 0xFFFF;
const FLAG_SHIFT: u32 = 48;
const FLAG_MASK: u64 = 0xFF;
const ROTATION_SHIFT: u32 = 56;
const EFFECTIVE_MASK: u64 = (1 << FLAG_SHIFT) - 1;
const ROTATION_MASK: u64 = 0xFF << ROTATION_SHIFT;

/// 64-bit page identifier.
///
/// Layout, from the low bits up: 32 bits of page index, 16 bits of partition,
/// 8 bits of flag and 8 bits of rotation. The rotation is bumped every time a
/// page is recycled, so a reference taken before the recycle no longer matches
/// the id stored inside the page buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PageId(pub u64);

impl PageId {
    /// The null page id.
    pub const NONE: PageId = PageId(0);

    pub fn new(partition: u16, flag: u8, index: u32) -> Self {
        PageId(
            ((flag as u64) << FLAG_SHIFT) | ((partition as u64) << PART_ID_SHIFT) | index as u64,
        )
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn index(self) -> u32 {
        (self.0 & PAGE_IDX_MASK) as u32
    }

    pub fn partition(self) -> u16 {
        ((self.0 >> PART_ID_SHIFT) & PART_ID_MASK) as u16
    }

    pub fn flag(self) -> u8 {
        ((self.0 >> FLAG_SHIFT) & FLAG_MASK) as u8
    }

    pub fn rotation(self) -> u8 {
        (self.0 >> ROTATION_SHIFT) as u8
    }

    /// Partition and index only. Every id of the same physical page, whatever
    /// its flag or rotation, shares it.
    pub fn effective(self) -> PageId {
        PageId(self.0 & EFFECTIVE_MASK)
    }

    /// Returns the id with the rotation counter advanced. Zero is skipped on
    /// wrap-around so the rotated id never equals a never-rotated one.
    pub fn rotate(self) -> PageId {
        let mut rotation = self.rotation().wrapping_add(1);
        if rotation == 0 {
            rotation = 1;
        }
        PageId((self.0 & !ROTATION_MASK) | ((rotation as u64) << ROTATION_SHIFT))
    }

    pub fn change_type(self, flag: u8) -> PageId {
        PageId((self.0 & !(FLAG_MASK << FLAG_SHIFT)) | ((flag as u64) << FLAG_SHIFT))
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_id_layout() {
        let id = PageId::new(7, FLAG_IDX, 42);
        assert_eq!(id.index(), 42);
        assert_eq!(id.partition(), 7);
        assert_eq!(id.flag(), FLAG_IDX);
        assert_eq!(id.rotation(), 0);
        assert!(!id.is_none());
        assert!(PageId::NONE.is_none());
    }

    #[test]
    fn test_rotation_keeps_effective_id() {
        let id = PageId::new(0, FLAG_IDX, 5);
        let rotated = id.rotate();
        assert_ne!(id, rotated);
        assert_eq!(rotated.rotation(), 1);
        assert_eq!(rotated.effective(), id.effective());
        assert_eq!(rotated.index(), 5);
        assert_eq!(rotated.flag(), FLAG_IDX);
    }

    #[test]
    fn test_rotation_skips_zero_on_wrap() {
        let mut id = PageId::new(0, FLAG_DATA, 1);
        for _ in 0..255 {
            id = id.rotate();
        }
        assert_eq!(id.rotation(), 255);
        let wrapped = id.rotate();
        assert_eq!(wrapped.rotation(), 1);
    }

    #[test]
    fn test_change_type() {
        let data = PageId::new(3, FLAG_DATA, 9).rotate();
        let idx = data.change_type(FLAG_IDX);
        assert_eq!(idx.flag(), FLAG_IDX);
        assert_eq!(idx.index(), 9);
        assert_eq!(idx.partition(), 3);
        assert_eq!(idx.rotation(), 1);
        assert_eq!(idx.effective(), data.effective());
    }
}
