//! Forward range cursor.

use anyhow::Result;
use std::collections::VecDeque;

use super::{fix, BPlusTree, Descent, RowCodec, Search};
use crate::storage::handler;
use crate::storage::page::{BPlusIo, PageId};

/// Rows copied out of one leaf, and the leaf to continue with.
pub(super) struct Batch<R> {
    pub(super) rows: VecDeque<R>,
    pub(super) next_page_id: PageId,
}

impl<R> Batch<R> {
    pub(super) fn empty() -> Self {
        Self {
            rows: VecDeque::new(),
            next_page_id: PageId::NONE,
        }
    }
}

/// Descent to the leaf holding the lower bound. Never stops above a leaf.
pub(super) struct GetCursor<'a, R> {
    pub(super) d: Descent,
    pub(super) lower: &'a R,
    pub(super) upper: Option<&'a R>,
    pub(super) batch: Option<Batch<R>>,
}

impl<C: RowCodec> Search<C> for GetCursor<'_, C::Row> {
    fn descent(&mut self) -> &mut Descent {
        &mut self.d
    }

    fn row(&self) -> &C::Row {
        self.lower
    }

    fn found(
        &mut self,
        tree: &BPlusTree<C>,
        io: &BPlusIo,
        buf: &[u8],
        idx: usize,
        lvl: usize,
    ) -> Result<bool> {
        if lvl != 0 {
            return Ok(false);
        }
        self.batch = Some(tree.fill_batch(io, buf, idx, self.upper)?);
        Ok(true)
    }

    fn not_found(
        &mut self,
        tree: &BPlusTree<C>,
        io: &BPlusIo,
        buf: &[u8],
        idx: usize,
        lvl: usize,
    ) -> Result<bool> {
        <Self as Search<C>>::found(self, tree, io, buf, idx, lvl)
    }
}

/// One-shot cursor returned by [`BPlusTree::find`].
///
/// Rows are buffered a leaf at a time. When the next leaf turns out to be
/// recycled by a concurrent merge, the cursor searches again for the first
/// row after the last one it returned.
pub struct ForwardCursor<'t, C: RowCodec> {
    tree: &'t BPlusTree<C>,
    lower: Option<C::Row>,
    upper: Option<C::Row>,
    last: Option<C::Row>,
    rows: VecDeque<C::Row>,
    next_page_id: PageId,
    failed: bool,
}

impl<'t, C: RowCodec> ForwardCursor<'t, C> {
    pub(super) fn new(tree: &'t BPlusTree<C>, lower: Option<C::Row>, upper: Option<C::Row>) -> Self {
        Self {
            tree,
            lower,
            upper,
            last: None,
            rows: VecDeque::new(),
            next_page_id: PageId::NONE,
            failed: false,
        }
    }

    /// Positions the cursor on the first row after the last returned one, or
    /// on the lower bound when nothing was returned yet.
    pub(super) fn init(&mut self) -> Result<()> {
        let upper = self.upper.as_ref();
        let batch = match (&self.last, &self.lower) {
            (Some(last), _) => self.tree.find_batch(last, 1, upper)?,
            (None, Some(lower)) => self.tree.find_batch(lower, -1, upper)?,
            (None, None) => self.tree.first_batch(upper)?,
        };
        self.rows = batch.rows;
        self.next_page_id = batch.next_page_id;
        Ok(())
    }

    /// First row of a forward leaf we may return. Rows moved there by
    /// concurrent merges and re-inserts can sort before the last returned row
    /// or even below the lower bound.
    fn start_idx(&self, io: &BPlusIo, buf: &[u8]) -> usize {
        let cnt = io.count(buf);
        match (&self.last, &self.lower) {
            (Some(last), _) => fix(self.tree.find_insertion_point(io, buf, cnt, last, 1)),
            (None, Some(lower)) => fix(self.tree.find_insertion_point(io, buf, cnt, lower, -1)),
            (None, None) => 0,
        }
    }

    fn next_page(&mut self) -> Result<bool> {
        loop {
            if self.next_page_id.is_none() {
                return Ok(false);
            }
            let page_id = self.next_page_id;
            let batch = {
                let page = self.tree.mem().read(page_id)?;
                if handler::check_page_id(page_id, &page) {
                    let io = self.tree.io_for(&page)?;
                    let start = self.start_idx(&io, &page);
                    Some(self.tree.fill_batch(&io, &page, start, self.upper.as_ref())?)
                } else {
                    None
                }
            };
            match batch {
                Some(batch) => {
                    self.rows = batch.rows;
                    self.next_page_id = batch.next_page_id;
                }
                None => self.init()?,
            }
            if !self.rows.is_empty() {
                return Ok(true);
            }
        }
    }

    /// Next row in order, `None` once the range is exhausted.
    pub fn next_row(&mut self) -> Result<Option<C::Row>> {
        if self.rows.is_empty() && !self.next_page()? {
            return Ok(None);
        }
        let row = self.rows.pop_front();
        if let Some(row) = &row {
            self.last = Some(row.clone());
        }
        Ok(row)
    }
}

impl<C: RowCodec> Iterator for ForwardCursor<'_, C> {
    type Item = Result<C::Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let res = self.next_row().transpose();
        if matches!(res, Some(Err(_))) {
            self.failed = true;
        }
        res
    }
}
