//! Insert or replace.
//!
//! The descent is the shared search. Only the page that changes is latched
//! exclusively. A split leaves the split page latched as the put's tail while
//! the separator is inserted one level up, so no one can see the new forward
//! page without its parent link for long.

use anyhow::Result;
use log::{debug, trace};

use super::{BPlusTree, Descent, Flag, Outcome, RowCodec, Search, TreeError};
use crate::access::structure::ReuseBag;
use crate::storage::memory::PageWriteGuard;
use crate::storage::page::{BPlusIo, BPlusMetaIo, PageId};
use crate::storage::wal::DeltaRecord;

pub(super) struct Put<'b, C: RowCodec> {
    d: Descent,
    /// Row to insert at `btm_lvl`: the new row, then each split's separator.
    row: C::Row,
    /// Right child of `row` on inner levels.
    right_id: PageId,
    old_row: Option<C::Row>,
    /// Split page of the level below, held until its separator is in place.
    tail: Option<PageWriteGuard>,
    btm_lvl: usize,
    need_replace_inner: Flag,
    bag: Option<&'b mut dyn ReuseBag>,
    finished: bool,
}

impl<'b, C: RowCodec> Put<'b, C> {
    fn new(row: C::Row, bag: Option<&'b mut dyn ReuseBag>) -> Self {
        Self {
            d: Descent::default(),
            row,
            right_id: PageId::NONE,
            old_row: None,
            tail: None,
            btm_lvl: 0,
            need_replace_inner: Flag::False,
            bag,
            finished: false,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.right_id = PageId::NONE;
        self.tail = None;
    }

    /// Keeps `page` latched while its separator goes up, releasing the
    /// previous tail.
    fn set_tail(&mut self, page: PageWriteGuard) {
        self.tail = Some(page);
    }
}

impl<C: RowCodec> Search<C> for Put<'_, C> {
    fn descent(&mut self) -> &mut Descent {
        &mut self.d
    }

    fn row(&self) -> &C::Row {
        &self.row
    }

    fn found(
        &mut self,
        tree: &BPlusTree<C>,
        _io: &BPlusIo,
        _buf: &[u8],
        _idx: usize,
        lvl: usize,
    ) -> Result<bool> {
        if lvl == 0 {
            return Ok(true);
        }
        if lvl == self.btm_lvl {
            // Our own split page sits right below; separators are unique.
            return Err(TreeError::invariant(format!(
                "Separator {:?} already present at level {}",
                self.row, lvl
            ))
            .into());
        }
        // The inner copy of the row must be replaced on the way down.
        if tree.codec.can_get_row_from_inner() && self.need_replace_inner == Flag::False {
            self.need_replace_inner = Flag::True;
        }
        Ok(false)
    }

    fn not_found(
        &mut self,
        _tree: &BPlusTree<C>,
        _io: &BPlusIo,
        _buf: &[u8],
        _idx: usize,
        lvl: usize,
    ) -> Result<bool> {
        Ok(lvl == self.btm_lvl)
    }
}

impl<C: RowCodec> BPlusTree<C> {
    /// Inserts `row`, or replaces the row with an equal key. Returns the
    /// replaced row.
    pub fn put(&self, row: C::Row) -> Result<Option<C::Row>> {
        self.do_put(row, None)
    }

    /// Like [`put`](Self::put), taking pages for splits from `bag` first.
    pub fn put_with_bag(&self, row: C::Row, bag: &mut dyn ReuseBag) -> Result<Option<C::Row>> {
        self.do_put(row, Some(bag))
    }

    fn do_put(&self, row: C::Row, bag: Option<&mut dyn ReuseBag>) -> Result<Option<C::Row>> {
        self.check_destroyed()?;
        let ctx_row = format!("{:?}", row);
        let mut p = Put::new(row, bag);
        self.put_loop(&mut p)
            .map_err(|e| TreeError::wrap(e, || format!("Runtime failure on row: {}", ctx_row)))?;
        Ok(p.old_row)
    }

    fn put_loop(&self, p: &mut Put<'_, C>) -> Result<()> {
        loop {
            self.init_descent(&mut p.d)?;
            let (root_id, root_lvl) = (p.d.root_id, p.d.root_lvl);
            match self.put_down(p, root_id, PageId::NONE, root_lvl)? {
                Outcome::Retry | Outcome::RetryRoot => self.check_put_interrupted(p)?,
                Outcome::Found if !p.finished => self.check_put_interrupted(p)?,
                _ => {
                    debug_assert!(p.finished);
                    return Ok(());
                }
            }
        }
    }

    /// A split separator on its way up is never abandoned, or the new page
    /// would stay without a parent link.
    fn check_put_interrupted(&self, p: &Put<'_, C>) -> Result<()> {
        if p.btm_lvl == 0 {
            self.check_interrupted()?;
        }
        Ok(())
    }

    fn put_down(
        &self,
        p: &mut Put<'_, C>,
        page_id: PageId,
        fwd_id: PageId,
        lvl: usize,
    ) -> Result<Outcome> {
        loop {
            p.d.page_id = page_id;
            p.d.fwd_id = fwd_id;

            match self.search(p, lvl)? {
                Outcome::GoDown | Outcome::GoDownX => {
                    let (child_id, child_fwd_id) = (p.d.page_id, p.d.fwd_id);

                    if p.need_replace_inner == Flag::True {
                        p.need_replace_inner = Flag::False;
                        let res = self.replace(p, page_id, lvl)?;
                        if res != Outcome::Found {
                            return Ok(res);
                        }
                        p.need_replace_inner = Flag::Done;
                    }

                    let res = self.put_down(p, child_id, child_fwd_id, lvl - 1)?;
                    if res == Outcome::RetryRoot || p.finished {
                        return Ok(res);
                    }
                    // Retry below, or a split separator to insert at this level.
                    if res == Outcome::Retry {
                        self.check_put_interrupted(p)?;
                    }
                }
                Outcome::Found => return self.replace(p, page_id, lvl),
                Outcome::NotFound => return self.insert(p, page_id, fwd_id, lvl),
                res => return Ok(res),
            }
        }
    }

    /// Overwrites the equal row on `page_id`.
    fn replace(&self, p: &mut Put<'_, C>, page_id: PageId, lvl: usize) -> Result<Outcome> {
        let mut page = self.mem().write(page_id)?;
        let io = match self.checked_io(page_id, &page, p.d.rmv_id, lvl)? {
            Ok(io) => io,
            Err(res) => return Ok(res),
        };
        let cnt = io.count(&page);
        let idx = self.find_insertion_point(&io, &page, cnt, &p.row, 0);
        if idx < 0 {
            return Ok(Outcome::Retry);
        }
        let idx = idx as usize;

        if lvl == 0 {
            p.old_row = Some(self.codec.get_row(io.kind(), io.item(&page, idx))?);
        }
        let item = self.codec.encode(io.kind(), &p.row);
        io.store(&mut page, idx, &item);
        self.structure.log(&page, || DeltaRecord::Replace {
            page_id,
            idx: idx as u16,
            item,
        })?;

        if lvl == 0 {
            p.finish();
        }
        Ok(Outcome::Found)
    }

    /// Inserts `p.row` on `page_id`, splitting it if it is full.
    fn insert(
        &self,
        p: &mut Put<'_, C>,
        page_id: PageId,
        fwd_id: PageId,
        lvl: usize,
    ) -> Result<Outcome> {
        let mut page = self.mem().write(page_id)?;
        let io = match self.checked_io(page_id, &page, p.d.rmv_id, lvl)? {
            Ok(io) => io,
            Err(res) => return Ok(res),
        };
        let cnt = io.count(&page);
        let idx = self.find_insertion_point(&io, &page, cnt, &p.row, 0);
        if idx >= 0 {
            return Err(TreeError::invariant(format!(
                "Duplicate row in index: {:?} on page {}",
                p.row, page_id
            ))
            .into());
        }
        let idx = super::fix(idx);
        // The page split after we read its parent and the row belongs further right.
        if idx == cnt && io.forward(&page) != fwd_id {
            return Ok(Outcome::Retry);
        }

        match self.insert_into(p, page_id, &mut page, &io, idx, lvl)? {
            Some(move_up) => {
                p.btm_lvl += 1;
                p.row = move_up;
                p.right_id = io.forward(&page);
                p.set_tail(page);
            }
            None => p.finish(),
        }
        Ok(Outcome::Found)
    }

    /// Returns the separator to insert one level up if the page was split.
    fn insert_into(
        &self,
        p: &mut Put<'_, C>,
        page_id: PageId,
        page: &mut PageWriteGuard,
        io: &BPlusIo,
        idx: usize,
        lvl: usize,
    ) -> Result<Option<C::Row>> {
        if io.count(page) == io.max_count() {
            return self.insert_with_split(p, page_id, page, io, idx, lvl);
        }
        self.insert_simple(p, page_id, page, io, idx)?;
        Ok(None)
    }

    fn insert_simple(
        &self,
        p: &Put<'_, C>,
        page_id: PageId,
        page: &mut PageWriteGuard,
        io: &BPlusIo,
        idx: usize,
    ) -> Result<()> {
        let item = self.codec.encode(io.kind(), &p.row);
        io.insert(page, idx, &item, p.right_id);
        self.structure.log(page, || DeltaRecord::Insert {
            page_id,
            idx: idx as u16,
            item,
            right_id: p.right_id,
        })
    }

    fn insert_with_split(
        &self,
        p: &mut Put<'_, C>,
        page_id: PageId,
        page: &mut PageWriteGuard,
        io: &BPlusIo,
        idx: usize,
        lvl: usize,
    ) -> Result<Option<C::Row>> {
        let fwd_id = self.structure.allocate_page(p.bag.as_deref_mut())?;
        let mut fwd = self.mem().write(fwd_id)?;
        // The forward page is new, so every change to it needs a delta.
        fwd.set_full_page_wal_policy(Some(false));

        let had_fwd = !io.forward(page).is_none();
        let mid_shift = self.split_page(page_id, page, io, fwd_id, &mut fwd, idx)?;

        let cnt = io.count(page);
        if idx < cnt || (idx == cnt && !mid_shift) {
            self.insert_simple(p, page_id, page, io, idx)?;
            // The new row is the separator going up, its right child starts
            // the forward page.
            if idx == cnt && !io.is_leaf() {
                io.set_left(&mut fwd, 0, p.right_id);
                self.structure.log(&fwd, || DeltaRecord::FixLeftmostChild {
                    page_id: fwd_id,
                    right_id: p.right_id,
                })?;
            }
        } else {
            self.insert_simple(p, fwd_id, &mut fwd, io, idx - cnt)?;
        }

        let cnt = io.count(page);
        let move_up = self.codec.lookup_row(io.kind(), io.item(page, cnt - 1));
        if !io.is_leaf() {
            // The separator leaves the inner page; its right link is already
            // the forward page's leftmost child.
            io.set_count(page, cnt - 1);
            self.structure.log(page, || DeltaRecord::FixCount {
                page_id,
                count: (cnt - 1) as u16,
            })?;
        }
        trace!(
            "Split page {} of tree {} at level {} into {}",
            page_id,
            self.name,
            lvl,
            fwd_id
        );

        if !had_fwd && lvl == self.root_level_unchecked()? {
            self.add_root(p, page_id, fwd_id, &move_up, lvl)?;
            return Ok(None);
        }
        Ok(Some(move_up))
    }

    /// Moves the upper half of `page` to `fwd`. The split point moves one to
    /// the right when the row goes there, so both halves stay usable.
    fn split_page(
        &self,
        page_id: PageId,
        page: &mut PageWriteGuard,
        io: &BPlusIo,
        fwd_id: PageId,
        fwd: &mut PageWriteGuard,
        idx: usize,
    ) -> Result<bool> {
        let cnt = io.count(page);
        let mut mid = cnt >> 1;
        let mut mid_shift = false;
        if idx > mid {
            mid += 1;
            mid_shift = true;
        }

        io.split_forward_page(page, fwd_id, fwd, mid, cnt);
        self.structure.log(fwd, || DeltaRecord::SplitForwardPage {
            page_id: fwd_id,
            forward_id: fwd_id,
            source_page_id: page_id,
            mid: mid as u16,
            count: cnt as u16,
        })?;

        io.split_existing_page(page, mid, fwd_id);
        self.structure.log(page, || DeltaRecord::SplitExistingPage {
            page_id,
            mid: mid as u16,
            forward_id: fwd_id,
        })?;
        Ok(mid_shift)
    }

    fn root_level_unchecked(&self) -> Result<usize> {
        let meta = self.mem().read(self.meta_page_id)?;
        Ok(BPlusMetaIo.root_level(&meta).max(0) as usize)
    }

    /// Grows the tree by one level over the two halves of a split root.
    fn add_root(
        &self,
        p: &mut Put<'_, C>,
        left_id: PageId,
        right_id: PageId,
        move_up: &C::Row,
        lvl: usize,
    ) -> Result<()> {
        let new_root_id = self.structure.allocate_page(p.bag.as_deref_mut())?;
        let mut root = self.mem().write(new_root_id)?;
        root.set_full_page_wal_policy(Some(false));

        let item = self.codec.encode(self.inner_io.kind(), move_up);
        self.inner_io
            .init_new_root(&mut root, new_root_id, left_id, &item, right_id);
        self.structure.log(&root, || DeltaRecord::NewRootInit {
            page_id: new_root_id,
            new_root_id,
            left_id,
            item,
            right_id,
        })?;

        let mut meta = self.mem().write(self.meta_page_id)?;
        BPlusMetaIo.add_root(&mut meta, new_root_id);
        self.structure.log(&meta, || DeltaRecord::MetaPageAddRoot {
            page_id: self.meta_page_id,
            root_id: new_root_id,
        })?;

        debug!(
            "Tree {} grew to root level {} with root {}",
            self.name,
            lvl + 1,
            new_root_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::btree::{BPlusTreeConfig, KeyValue, KeyValueCodec, TreeContext, U64Codec};
    use crate::access::structure::{DataStructure, LongListBag};
    use crate::storage::memory::{PageMemory, PageMemoryConfig};
    use crate::storage::page::FLAG_IDX;
    use crate::storage::wal::{MemoryWal, WalSink};
    use std::sync::Arc;

    fn tree_with<C: RowCodec>(
        codec: C,
        wal: Option<Arc<MemoryWal>>,
    ) -> Result<(PageMemory, BPlusTree<C>)> {
        let mem = PageMemory::new(PageMemoryConfig {
            page_size: 512,
            partition: 0,
        })?;
        let wal = wal.map(|w| w as Arc<dyn WalSink>);
        let tree = BPlusTree::create(
            BPlusTreeConfig {
                name: "put".to_string(),
                max_items_per_page: Some(4),
            },
            DataStructure::new(mem.clone(), wal, None),
            Arc::new(TreeContext::new()),
            codec,
        )?;
        Ok((mem, tree))
    }

    #[test]
    fn test_root_split() -> Result<()> {
        let (_, tree) = tree_with(U64Codec, None)?;
        for k in 1..=4 {
            tree.put(k)?;
        }
        assert_eq!(tree.root_level()?, 0);
        tree.put(5)?;
        assert_eq!(tree.root_level()?, 1);
        tree.validate_tree()?;
        assert_eq!(tree.size()?, 5);
        Ok(())
    }

    #[test]
    fn test_ascending_and_descending_inserts() -> Result<()> {
        let (_, tree) = tree_with(U64Codec, None)?;
        for k in 0..300 {
            tree.put(k)?;
        }
        for k in (1000..1300).rev() {
            tree.put(k)?;
        }
        tree.validate_tree()?;
        assert_eq!(tree.size()?, 600);
        Ok(())
    }

    #[test]
    fn test_replace_updates_inner_copy() -> Result<()> {
        let (_, tree) = tree_with(U64Codec, None)?;
        for k in 0..50 {
            assert_eq!(tree.put(k)?, None);
        }
        // Replacing with an equal row walks every inner copy on the way.
        for k in 0..50 {
            assert_eq!(tree.put(k)?, Some(k));
        }
        tree.validate_tree()?;
        assert_eq!(tree.size()?, 50);
        Ok(())
    }

    #[test]
    fn test_split_pages_come_from_bag() -> Result<()> {
        let (mem, tree) = tree_with(KeyValueCodec, None)?;
        for k in 0..4 {
            tree.put(KeyValue::new(k, k))?;
        }
        let mut bag = LongListBag::new();
        bag.add_free_page(mem.allocate_page(FLAG_IDX)?);
        bag.add_free_page(mem.allocate_page(FLAG_IDX)?);
        let allocated = mem.allocated_pages();

        tree.put_with_bag(KeyValue::new(4, 4), &mut bag)?;
        assert!(bag.is_empty());
        assert_eq!(mem.allocated_pages(), allocated);
        assert_eq!(tree.root_level()?, 1);
        tree.validate_tree()?;
        Ok(())
    }

    #[test]
    fn test_split_logs_deltas_for_new_pages() -> Result<()> {
        let wal = Arc::new(MemoryWal::new());
        let (_, tree) = tree_with(U64Codec, Some(wal.clone()))?;
        for k in 1..=5 {
            tree.put(k)?;
        }
        let records: Vec<DeltaRecord> = wal.records().into_iter().map(|r| r.record).collect();
        assert!(records
            .iter()
            .any(|r| matches!(r, DeltaRecord::SplitForwardPage { mid: 3, count: 4, .. })));
        assert!(records
            .iter()
            .any(|r| matches!(r, DeltaRecord::NewRootInit { .. })));
        Ok(())
    }
}
