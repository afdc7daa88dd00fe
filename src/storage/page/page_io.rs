//! Common page header shared by every page kind.
//!
//! ```text
//! +------+---------+-----+---------+----------+
//! | type | version | crc | page id | reserved |
//! |  2   |    2    |  4  |    8    |    24    |
//! +------+---------+-----+---------+----------+
//! ```
//!
//! All multi-byte fields are little endian.

use byteorder::{ByteOrder, LittleEndian};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;

const TYPE_OFF: usize = 0;
const VER_OFF: usize = 2;
const CRC_OFF: usize = 4;
const PAGE_ID_OFF: usize = 8;

/// First byte after the common header.
pub const COMMON_HEADER_END: usize = 40;

pub const T_DATA: u16 = 1;
pub const T_BPLUS_META: u16 = 2;
pub const T_PAGE_LIST_NODE: u16 = 3;
pub const T_PAGE_LIST_META: u16 = 4;
pub const T_BPLUS_INNER: u16 = 5;
pub const T_BPLUS_LEAF: u16 = 6;

/// Type and version of a page layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageIo {
    pub page_type: u16,
    pub version: u16,
}

impl PageIo {
    pub const fn new(page_type: u16, version: u16) -> Self {
        Self { page_type, version }
    }

    /// Reads the layout descriptor of an initialized page.
    pub fn for_page(buf: &[u8]) -> StorageResult<PageIo> {
        let io = PageIo::new(page_type(buf), version(buf));
        match io.page_type {
            T_DATA | T_BPLUS_META | T_PAGE_LIST_NODE | T_PAGE_LIST_META | T_BPLUS_INNER
            | T_BPLUS_LEAF
                if io.version == 1 =>
            {
                Ok(io)
            }
            _ => Err(StorageError::UnknownPageType {
                page_type: io.page_type,
                version: io.version,
                page_id: page_id(buf),
            }),
        }
    }

    /// Checks that the page holds the expected layout.
    pub fn expect(buf: &[u8], page_type: u16) -> StorageResult<()> {
        let found = self::page_type(buf);
        if found != page_type {
            return Err(StorageError::UnexpectedPageType {
                page_id: page_id(buf),
                expected: page_type,
                found,
            });
        }
        Ok(())
    }

    /// Zeroes the page and writes a fresh common header.
    pub fn init_new_page(&self, buf: &mut [u8], page_id: PageId) {
        buf.fill(0);
        LittleEndian::write_u16(&mut buf[TYPE_OFF..], self.page_type);
        LittleEndian::write_u16(&mut buf[VER_OFF..], self.version);
        LittleEndian::write_u32(&mut buf[CRC_OFF..], 0);
        set_page_id(buf, page_id);
    }
}

/// A page layout that knows how to format a fresh page.
pub trait PageInit {
    fn page_io(&self) -> PageIo;

    fn init_new_page(&self, buf: &mut [u8], page_id: PageId);
}

impl PageInit for PageIo {
    fn page_io(&self) -> PageIo {
        *self
    }

    fn init_new_page(&self, buf: &mut [u8], page_id: PageId) {
        PageIo::init_new_page(self, buf, page_id)
    }
}

pub fn page_type(buf: &[u8]) -> u16 {
    LittleEndian::read_u16(&buf[TYPE_OFF..])
}

pub fn version(buf: &[u8]) -> u16 {
    LittleEndian::read_u16(&buf[VER_OFF..])
}

pub fn page_id(buf: &[u8]) -> PageId {
    PageId(LittleEndian::read_u64(&buf[PAGE_ID_OFF..]))
}

pub fn set_page_id(buf: &mut [u8], page_id: PageId) {
    LittleEndian::write_u64(&mut buf[PAGE_ID_OFF..], page_id.0);
}

pub(crate) fn read_page_id(buf: &[u8], off: usize) -> PageId {
    PageId(LittleEndian::read_u64(&buf[off..]))
}

pub(crate) fn write_page_id(buf: &mut [u8], off: usize, page_id: PageId) {
    LittleEndian::write_u64(&mut buf[off..], page_id.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::FLAG_IDX;

    #[test]
    fn test_init_new_page() {
        let mut buf = vec![0xAAu8; 256];
        let id = PageId::new(0, FLAG_IDX, 3);
        PageIo::new(T_PAGE_LIST_NODE, 1).init_new_page(&mut buf, id);

        assert_eq!(page_type(&buf), T_PAGE_LIST_NODE);
        assert_eq!(version(&buf), 1);
        assert_eq!(page_id(&buf), id);
        assert!(buf[COMMON_HEADER_END..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_for_page_rejects_unknown_type() {
        let mut buf = vec![0u8; 128];
        PageIo::new(99, 1).init_new_page(&mut buf, PageId(1));
        assert!(PageIo::for_page(&buf).is_err());

        PageIo::new(T_BPLUS_LEAF, 1).init_new_page(&mut buf, PageId(1));
        assert_eq!(PageIo::for_page(&buf).unwrap().page_type, T_BPLUS_LEAF);
        assert!(PageIo::expect(&buf, T_BPLUS_INNER).is_err());
    }
}
