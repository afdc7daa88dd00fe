//! Row codecs: how a tree compares, stores and materializes its rows.
//!
//! The tree itself only moves fixed-size items around. A [`RowCodec`] gives
//! those bytes meaning, separately for leaf items (full rows) and inner items
//! (search keys, possibly full rows too).

use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;
use std::fmt;

use crate::storage::page::PageKind;

/// Row capability a [`BPlusTree`](super::BPlusTree) is parameterized over.
pub trait RowCodec: Send + Sync + 'static {
    type Row: Clone + fmt::Debug + Send + Sync;

    /// Size of one encoded item on pages of `kind`.
    fn item_size(&self, kind: PageKind) -> usize;

    /// Whether inner items hold complete rows, so a lookup may stop at an
    /// inner page. Such trees keep every inner key equal to the greatest row
    /// of its left subtree.
    fn can_get_row_from_inner(&self) -> bool;

    /// Orders the stored `item` against `row`.
    fn compare(&self, kind: PageKind, item: &[u8], row: &Self::Row) -> Ordering;

    /// Materializes the full row stored in `item`.
    fn get_row(&self, kind: PageKind, item: &[u8]) -> Result<Self::Row>;

    /// Builds a row usable as a search key from an item of either kind.
    fn lookup_row(&self, kind: PageKind, item: &[u8]) -> Self::Row;

    /// Encodes `row` into `item` for a page of `kind`.
    fn store(&self, kind: PageKind, row: &Self::Row, item: &mut [u8]);

    /// Encodes `row` into a fresh buffer.
    fn encode(&self, kind: PageKind, row: &Self::Row) -> Vec<u8> {
        let mut item = vec![0u8; self.item_size(kind)];
        self.store(kind, row, &mut item);
        item
    }
}

/// Plain `u64` rows; inner pages carry whole rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct U64Codec;

impl RowCodec for U64Codec {
    type Row = u64;

    fn item_size(&self, _kind: PageKind) -> usize {
        8
    }

    fn can_get_row_from_inner(&self) -> bool {
        true
    }

    fn compare(&self, _kind: PageKind, item: &[u8], row: &u64) -> Ordering {
        LittleEndian::read_u64(item).cmp(row)
    }

    fn get_row(&self, _kind: PageKind, item: &[u8]) -> Result<u64> {
        Ok(LittleEndian::read_u64(item))
    }

    fn lookup_row(&self, _kind: PageKind, item: &[u8]) -> u64 {
        LittleEndian::read_u64(item)
    }

    fn store(&self, _kind: PageKind, row: &u64, item: &mut [u8]) {
        LittleEndian::write_u64(item, *row);
    }
}

/// Key/value pair ordered by key alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeyValue {
    pub key: u64,
    pub value: u64,
}

impl KeyValue {
    pub fn new(key: u64, value: u64) -> Self {
        Self { key, value }
    }

    /// Search row for `key`; the value is ignored by comparisons.
    pub fn lookup(key: u64) -> Self {
        Self { key, value: 0 }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// [`KeyValue`] rows. Leaves store key and value, inner pages only the key,
/// so every lookup ends at a leaf.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyValueCodec;

impl RowCodec for KeyValueCodec {
    type Row = KeyValue;

    fn item_size(&self, kind: PageKind) -> usize {
        match kind {
            PageKind::Leaf => 16,
            PageKind::Inner => 8,
        }
    }

    fn can_get_row_from_inner(&self) -> bool {
        false
    }

    fn compare(&self, _kind: PageKind, item: &[u8], row: &KeyValue) -> Ordering {
        LittleEndian::read_u64(item).cmp(&row.key)
    }

    fn get_row(&self, kind: PageKind, item: &[u8]) -> Result<KeyValue> {
        if kind == PageKind::Inner {
            bail!("Inner pages of a key/value tree hold keys only");
        }
        Ok(KeyValue {
            key: LittleEndian::read_u64(item),
            value: LittleEndian::read_u64(&item[8..]),
        })
    }

    fn lookup_row(&self, _kind: PageKind, item: &[u8]) -> KeyValue {
        KeyValue::lookup(LittleEndian::read_u64(item))
    }

    fn store(&self, kind: PageKind, row: &KeyValue, item: &mut [u8]) {
        LittleEndian::write_u64(item, row.key);
        if kind == PageKind::Leaf {
            LittleEndian::write_u64(&mut item[8..], row.value);
        }
    }
}
