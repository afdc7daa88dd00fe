//! Remove with merges.
//!
//! A remove that may leave a leaf empty, or that takes away the row an inner
//! key copies, keeps the pages it will change latched in a tail. The tail
//! grows one level at a time from the leaf up, every level an exact page
//! plus at most one sibling (back or forward) so that a merge partner is
//! always held. Latches are taken back before forward and child before
//! parent.
//!
//! Frames live in an arena owned by the operation and refer to each other
//! by index: `down` goes to the exact frame one level lower, `sibling` to
//! the neighbor held on the same level.

use anyhow::Result;
use log::{debug, trace};

use super::{fix, BPlusTree, Descent, Flag, Outcome, RowCodec, Search, TreeError};
use crate::access::structure::{LongListBag, ReuseBag};
use crate::storage::handler;
use crate::storage::memory::PageWriteGuard;
use crate::storage::page::{BPlusIo, BPlusMetaIo, PageId, PageKind};
use crate::storage::wal::DeltaRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Back,
    Exact,
    Forward,
}

struct Frame {
    page_id: PageId,
    page: PageWriteGuard,
    io: BPlusIo,
    kind: FrameKind,
    lvl: usize,
    /// Cached insertion point of the removed row.
    idx: Option<isize>,
    sibling: Option<usize>,
    down: Option<usize>,
}

impl Frame {
    fn count(&self) -> usize {
        self.io.count(&self.page)
    }
}

fn released(i: usize) -> anyhow::Error {
    TreeError::invariant(format!("Tail frame {} is not held", i)).into()
}

pub(super) struct Remove<'b, C: RowCodec> {
    d: Descent,
    row: C::Row,
    ceil: bool,
    removed: Option<C::Row>,
    finished: bool,
    need_replace_inner: Flag,
    need_merge_empty_branch: Flag,
    frames: Vec<Option<Frame>>,
    tail: Option<usize>,
    /// Freed pages when the caller gave no bag.
    free_pages: LongListBag,
    bag: Option<&'b mut dyn ReuseBag>,
}

impl<C: RowCodec> Search<C> for Remove<'_, C> {
    fn descent(&mut self) -> &mut Descent {
        &mut self.d
    }

    fn row(&self) -> &C::Row {
        &self.row
    }

    fn found(
        &mut self,
        _tree: &BPlusTree<C>,
        _io: &BPlusIo,
        _buf: &[u8],
        _idx: usize,
        lvl: usize,
    ) -> Result<bool> {
        Ok(lvl == 0)
    }

    fn not_found(
        &mut self,
        _tree: &BPlusTree<C>,
        _io: &BPlusIo,
        _buf: &[u8],
        _idx: usize,
        lvl: usize,
    ) -> Result<bool> {
        Ok(lvl == 0)
    }
}

impl<'b, C: RowCodec> Remove<'b, C> {
    fn new(row: C::Row, ceil: bool, bag: Option<&'b mut dyn ReuseBag>) -> Self {
        Self {
            d: Descent::default(),
            row,
            ceil,
            removed: None,
            finished: false,
            need_replace_inner: Flag::False,
            need_merge_empty_branch: Flag::False,
            frames: Vec::new(),
            tail: None,
            free_pages: LongListBag::new(),
            bag,
        }
    }

    fn finish(&mut self) -> Result<()> {
        if self.tail.is_some() {
            return Err(TreeError::invariant("Remove finished with a locked tail").into());
        }
        self.finished = true;
        Ok(())
    }

    fn bag_mut(&mut self) -> &mut dyn ReuseBag {
        if let Some(bag) = self.bag.as_mut() {
            return &mut **bag;
        }
        &mut self.free_pages
    }

    fn frame(&self, i: usize) -> Result<&Frame> {
        self.frames
            .get(i)
            .and_then(Option::as_ref)
            .ok_or_else(|| released(i))
    }

    fn frame_mut(&mut self, i: usize) -> Result<&mut Frame> {
        self.frames
            .get_mut(i)
            .and_then(Option::as_mut)
            .ok_or_else(|| released(i))
    }

    /// Takes a frame out of the arena to borrow it next to others.
    fn take_frame(&mut self, i: usize) -> Result<Frame> {
        self.frames
            .get_mut(i)
            .and_then(Option::take)
            .ok_or_else(|| released(i))
    }

    fn put_frame(&mut self, i: usize, frame: Frame) {
        self.frames[i] = Some(frame);
    }

    fn top(&self) -> Result<usize> {
        self.tail
            .ok_or_else(|| TreeError::invariant("Remove has no tail").into())
    }

    fn add_tail(
        &mut self,
        page_id: PageId,
        page: PageWriteGuard,
        io: BPlusIo,
        lvl: usize,
        kind: FrameKind,
    ) -> Result<usize> {
        let i = self.frames.len();
        self.frames.push(Some(Frame {
            page_id,
            page,
            io,
            kind,
            lvl,
            idx: None,
            sibling: None,
            down: None,
        }));

        let Some(t) = self.tail else {
            self.tail = Some(i);
            return Ok(i);
        };
        let (t_lvl, t_down) = {
            let f = self.frame(t)?;
            (f.lvl, f.down)
        };
        if t_lvl == lvl {
            if kind == FrameKind::Exact {
                // The exact frame owns the link down.
                self.frame_mut(t)?.down = None;
                let f = self.frame_mut(i)?;
                f.down = t_down;
                f.sibling = Some(t);
                self.tail = Some(i);
            } else {
                self.frame_mut(t)?.sibling = Some(i);
            }
        } else if t_lvl + 1 == lvl {
            self.frame_mut(i)?.down = Some(t);
            self.tail = Some(i);
        } else {
            return Err(TreeError::invariant(format!(
                "Cannot add level {} on top of tail at level {}",
                lvl, t_lvl
            ))
            .into());
        }
        Ok(i)
    }

    /// Whether `page_id` at `lvl` is already latched by this remove.
    fn is_tail(&self, page_id: PageId, lvl: usize) -> bool {
        let mut t = self.tail;
        while let Some(f) = t.and_then(|i| self.frame(i).ok()) {
            if f.lvl < lvl {
                return false;
            }
            if f.lvl == lvl {
                if f.page_id == page_id {
                    return true;
                }
                return f
                    .sibling
                    .and_then(|s| self.frame(s).ok())
                    .is_some_and(|s| s.page_id == page_id);
            }
            t = f.down;
        }
        false
    }

    /// Exact frame at `lvl` under `t`.
    fn get_tail(&self, t: usize, lvl: usize) -> Result<usize> {
        let mut i = t;
        loop {
            let f = self.frame(i)?;
            if f.lvl == lvl {
                return Ok(i);
            }
            i = f.down.ok_or_else(|| {
                TreeError::invariant(format!("Tail has no frame at level {}", lvl))
            })?;
        }
    }

    fn left_child(&self, t: usize) -> Result<Option<usize>> {
        let Some(down) = self.frame(t)?.down else {
            return Ok(None);
        };
        match self.frame(down)?.sibling {
            Some(s) if self.frame(s)?.kind == FrameKind::Back => Ok(Some(s)),
            _ => Ok(Some(down)),
        }
    }

    fn right_child(&self, t: usize) -> Result<Option<usize>> {
        let Some(down) = self.frame(t)?.down else {
            return Ok(None);
        };
        match self.frame(down)?.sibling {
            Some(s) if self.frame(s)?.kind == FrameKind::Forward => Ok(Some(s)),
            _ => Ok(Some(down)),
        }
    }

    /// Both children of `t` in the tail, if it holds two.
    fn children(&self, t: usize) -> Result<Option<(usize, usize)>> {
        match (self.left_child(t)?, self.right_child(t)?) {
            (Some(l), Some(r)) if l != r => Ok(Some((l, r))),
            _ => Ok(None),
        }
    }

    fn release_tail(&mut self) {
        self.frames.clear();
        self.tail = None;
    }

    /// Frames reachable from `start` through down and sibling links.
    fn chain(&self, start: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut t = Some(start);
        while let Some(i) = t {
            let Ok(f) = self.frame(i) else {
                break;
            };
            out.push(i);
            out.extend(f.sibling);
            t = f.down;
        }
        out
    }

    fn release_chain(&mut self, start: usize) {
        for i in self.chain(start) {
            self.frames[i] = None;
        }
    }

    /// Releases everything except the part of the tail under `new_tail`.
    fn keep_only(&mut self, new_tail: usize) {
        let keep = self.chain(new_tail);
        for (i, slot) in self.frames.iter_mut().enumerate() {
            if !keep.contains(&i) {
                *slot = None;
            }
        }
        self.tail = Some(new_tail);
    }

    /// Insertion point of the removed row on an exact frame, cached until
    /// the frame changes.
    fn insertion_point(&mut self, tree: &BPlusTree<C>, t: usize) -> Result<isize> {
        let f = self.frame(t)?;
        if let Some(idx) = f.idx {
            return Ok(idx);
        }
        let idx = tree.find_insertion_point(&f.io, &f.page, f.count(), &self.row, 0);
        self.frame_mut(t)?.idx = Some(idx);
        Ok(idx)
    }

    /// Index of the child link to follow on `t` for the removed row.
    fn child_idx(&mut self, tree: &BPlusTree<C>, t: usize) -> Result<usize> {
        let cnt = self.frame(t)?.count();
        let idx = fix(self.insertion_point(tree, t)?);
        Ok(if idx == cnt && cnt > 0 { idx - 1 } else { idx })
    }

    fn is_child(&self, prnt: usize, child: usize, idx: usize, cnt: usize, right: bool) -> Result<bool> {
        let idx = if right && cnt != 0 { idx + 1 } else { idx };
        let p = self.frame(prnt)?;
        Ok(p.io.left(&p.page, idx) == self.frame(child)?.page_id)
    }

    fn check_children(&self, prnt: usize, left: usize, right: usize, idx: usize) -> Result<bool> {
        let p = self.frame(prnt)?;
        if idx >= p.count() {
            return Ok(false);
        }
        Ok(p.io.left(&p.page, idx) == self.frame(left)?.page_id
            && p.io.right(&p.page, idx) == self.frame(right)?.page_id)
    }

    /// The pages latched under the tail top must still be its children.
    /// Concurrent changes may have moved them while the upper level was
    /// unlatched.
    fn validate_tail(&mut self, tree: &BPlusTree<C>) -> Result<bool> {
        let t = self.top()?;
        let Some(down) = self.frame(t)?.down else {
            return Ok(true);
        };
        let cnt = self.frame(t)?.count();
        let Some((left, right)) = self.children(t)? else {
            // Only one page held below.
            let idx = self.child_idx(tree, t)?;
            return Ok(self.is_child(t, down, idx, cnt, false)?
                || self.is_child(t, down, idx, cnt, true)?);
        };

        if cnt != 0 {
            let idx = self.child_idx(tree, t)?;
            if self.is_child(t, left, idx, cnt, false)? && self.is_child(t, right, idx, cnt, true)? {
                return Ok(true);
            }
        }

        // Otherwise the children must straddle the tail and its sibling.
        let Some(s) = self.frame(t)?.sibling else {
            return Ok(false);
        };
        let idx = cnt.saturating_sub(1);
        if self.frame(s)?.kind == FrameKind::Forward {
            return Ok(self.is_child(t, left, idx, cnt, true)? && self.is_child(s, right, 0, 0, false)?);
        }
        if !self.is_child(t, right, 0, 0, false)? {
            return Ok(false);
        }
        let s_cnt = self.frame(s)?.count();
        self.is_child(s, left, s_cnt.saturating_sub(1), s_cnt, true)
    }

    /// Releases latches so the remove can be retried from a lower point.
    /// Returns `false` when the tail is too short to retry from, in which
    /// case the remove ends with what it has done.
    fn release_for_retry(&mut self, t: usize) -> Result<bool> {
        if self.frame(t)?.lvl <= 1 {
            if self.removed.is_some() {
                return Err(TreeError::invariant("Retrying a remove that already removed").into());
            }
            // Set up again when the leaf is latched next time.
            self.need_replace_inner = Flag::False;
            self.need_merge_empty_branch = Flag::False;
            self.release_tail();
            return Ok(true);
        }

        if let Some(down) = self.frame(t)?.down {
            if let Some(new_tail) = self.frame(down)?.down {
                self.frame_mut(down)?.down = None;
                self.keep_only(new_tail);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn remove_data_row_from_leaf(
        &mut self,
        tree: &BPlusTree<C>,
        page_id: PageId,
        page: &mut PageWriteGuard,
        io: &BPlusIo,
        cnt: usize,
        idx: usize,
    ) -> Result<()> {
        if self.removed.is_some() {
            return Err(TreeError::invariant("Row already removed").into());
        }
        self.removed = Some(tree.codec.get_row(io.kind(), io.item(page, idx))?);
        tree.remove_item(page_id, page, io, cnt, idx)
    }

    fn remove_data_row_from_leaf_tail(&mut self, tree: &BPlusTree<C>, t: usize) -> Result<()> {
        let leaf = self.get_tail(t, 0)?;
        let idx = self.insertion_point(tree, leaf)?;
        if idx < 0 {
            return Err(TreeError::invariant("Removed row is gone from the latched leaf").into());
        }
        let mut f = self.take_frame(leaf)?;
        let cnt = f.count();
        let res = self.remove_data_row_from_leaf(tree, f.page_id, &mut f.page, &f.io, cnt, idx as usize);
        self.put_frame(leaf, f);
        res
    }

    /// Recycles the page of frame `t`. A released frame leaves the tail.
    fn free_page(&mut self, tree: &BPlusTree<C>, t: usize, release: bool) -> Result<()> {
        let wal = tree.structure.wal();
        let f = self.frame_mut(t)?;
        let recycled = handler::recycle_page(wal, f.page_id, &mut f.page)?;
        if release {
            self.frames[t] = None;
        }
        self.bag_mut().add_free_page(recycled);
        Ok(())
    }

    fn do_merge(&mut self, tree: &BPlusTree<C>, prnt: usize, left: usize, right: usize) -> Result<bool> {
        let prnt_cnt = self.frame(prnt)?.count();
        let prnt_idx = self.child_idx(tree, prnt)?;

        // Below the first merge of an empty branch the pages are not linked
        // from the parent anymore, so the children check only holds on top.
        if self.need_merge_empty_branch != Flag::Ready
            && !self.check_children(prnt, left, right, prnt_idx)?
        {
            return Ok(false);
        }
        let empty_branch = matches!(self.need_merge_empty_branch, Flag::True | Flag::Ready);

        let (prnt_id, right_id) = (self.frame(prnt)?.page_id, self.frame(right)?.page_id);
        let mut l = self.take_frame(left)?;
        let merged = {
            let (p, r) = (self.frame(prnt)?, self.frame(right)?);
            l.io.merge(&p.io, &p.page, prnt_idx, &mut l.page, &r.page, empty_branch)
        };
        if !merged {
            self.put_frame(left, l);
            return Ok(false);
        }

        l.idx = None;
        let logged = tree.structure.log(&l.page, || DeltaRecord::Merge {
            page_id: l.page_id,
            parent_id: prnt_id,
            parent_idx: prnt_idx as u16,
            right_id,
            empty_branch,
        });
        let left_id = l.page_id;
        self.put_frame(left, l);
        logged?;

        self.frame_mut(prnt)?.idx = None;
        // An empty branch keeps its separator below the top merge.
        if self.need_merge_empty_branch != Flag::Ready {
            let mut p = self.take_frame(prnt)?;
            let res = tree.remove_item(p.page_id, &mut p.page, &p.io, prnt_cnt, prnt_idx);
            self.put_frame(prnt, p);
            res?;
        }

        // Nothing links to the right page anymore.
        self.free_page(tree, right, true)?;
        trace!(
            "Merged page {} into {} on tree {}",
            right_id,
            left_id,
            tree.name
        );
        Ok(true)
    }

    /// Merges the two children of `prnt` held in the tail.
    fn merge(&mut self, tree: &BPlusTree<C>, prnt: usize) -> Result<bool> {
        // A routing parent does not own the forward child.
        if self.frame(prnt)?.count() == 0 && self.need_merge_empty_branch != Flag::Ready {
            return Ok(false);
        }
        let Some((left, right)) = self.children(prnt)? else {
            return Ok(false);
        };
        let right_down = self.frame(right)?.down;
        if !self.do_merge(tree, prnt, left, right)? {
            return Ok(false);
        }

        let l = self.frame_mut(left)?;
        if l.kind == FrameKind::Back {
            l.down = right_down;
            l.kind = FrameKind::Exact;
            l.sibling = None;
            self.frame_mut(prnt)?.down = Some(left);
        } else {
            l.sibling = None;
        }
        Ok(true)
    }

    /// Top-down merge of a branch that became empty. Returns the frame to
    /// retry from if the join point is not what the tail expects.
    fn merge_empty_branch(&mut self, tree: &BPlusTree<C>) -> Result<Option<usize>> {
        let mut t = self.top()?;

        // Lowest non-empty inner page on the branch.
        let mut t0 = self.frame(t)?.down;
        loop {
            let i = t0.ok_or_else(|| TreeError::invariant("Empty branch without a leaf"))?;
            let f = self.frame(i)?;
            if f.lvl == 0 {
                break;
            }
            if f.count() != 0 {
                t = i;
            }
            t0 = f.down;
        }

        let idx = self.child_idx(tree, t)?;
        let joined = match self.children(t)? {
            Some((left, right)) => self.check_children(t, left, right, idx)?,
            None => false,
        };
        if !joined {
            return Ok(Some(t));
        }

        // Make the branch really empty before merging it.
        self.remove_data_row_from_leaf_tail(tree, t)?;

        while self.frame(t)?.lvl != 0 {
            if !self.merge(tree, t)? {
                return Err(TreeError::invariant(format!(
                    "Failed to merge empty branch at level {}",
                    self.frame(t)?.lvl
                ))
                .into());
            }
            if self.need_merge_empty_branch == Flag::True {
                self.need_merge_empty_branch = Flag::Ready;
            }
            t = self
                .frame(t)?
                .down
                .ok_or_else(|| TreeError::invariant("Empty branch ended above the leaf"))?;
        }
        Ok(None)
    }

    fn merge_bottom_up(&mut self, tree: &BPlusTree<C>, t: usize) -> Result<()> {
        let down = self.frame(t)?.down;
        let down_sibling = match down {
            Some(d) => self.frame(d)?.sibling,
            None => None,
        };
        let (Some(down), Some(_)) = (down, down_sibling) else {
            // Nothing to merge here; the row still has to go.
            if self.removed.is_none() {
                self.remove_data_row_from_leaf_tail(tree, t)?;
            }
            return Ok(());
        };
        self.merge_bottom_up(tree, down)?;
        self.merge(tree, t)?;
        Ok(())
    }

    /// Puts the new greatest row of the left subtree into the inner page
    /// that copied the removed row.
    fn replace_inner(&mut self, tree: &BPlusTree<C>) -> Result<()> {
        let mut inner = self.top()?;
        let inner_idx = loop {
            let idx = self.insertion_point(tree, inner)?;
            if idx >= 0 {
                break idx as usize;
            }
            let f = self.frame(inner)?;
            // A merge took the inner key away.
            if f.lvl == 1 {
                return Ok(());
            }
            inner = f
                .down
                .ok_or_else(|| TreeError::invariant("Inner key not found in tail"))?;
        };

        let leaf = self.get_tail(inner, 0)?;
        let (leaf_id, leaf_idx, item) = {
            let l = self.frame(leaf)?;
            let cnt = l.count();
            if cnt == 0 {
                return Err(TreeError::invariant("Empty leaf left after merges").into());
            }
            let row = tree.codec.lookup_row(l.io.kind(), l.io.item(&l.page, cnt - 1));
            (l.page_id, cnt - 1, tree.codec.encode(PageKind::Inner, &row))
        };

        // Taken under the inner page latch: anyone who read the old key sees
        // a newer id on the leaf.
        let rmv_id = tree.ctx.next_remove_id();

        let f = self.frame_mut(inner)?;
        f.io.store(&mut f.page, inner_idx, &item);
        f.io.set_remove_id(&mut f.page, rmv_id);
        let inner_id = f.page_id;
        tree.structure.log(&f.page, || DeltaRecord::InnerReplace {
            page_id: inner_id,
            dst_idx: inner_idx as u16,
            src_page_id: leaf_id,
            src_idx: leaf_idx as u16,
            remove_id: rmv_id,
        })?;

        let l = self.frame_mut(leaf)?;
        l.io.set_remove_id(&mut l.page, rmv_id);
        tree.structure.log(&l.page, || DeltaRecord::FixRemoveId {
            page_id: leaf_id,
            remove_id: rmv_id,
        })?;
        Ok(())
    }
}

impl<C: RowCodec> BPlusTree<C> {
    /// Removes the row equal to `row`.
    pub fn remove(&self, row: &C::Row) -> Result<Option<C::Row>> {
        self.do_remove(row, false, None)
    }

    /// Removes the smallest row not below `row`. Freed pages go to `bag` if
    /// given, otherwise to the reuse list.
    pub fn remove_ceil(
        &self,
        row: &C::Row,
        mut bag: Option<&mut dyn ReuseBag>,
    ) -> Result<Option<C::Row>> {
        let removed = self.do_remove(row, true, bag.as_mut().map(|b| &mut **b as &mut dyn ReuseBag))?;
        if removed.is_some() {
            return Ok(removed);
        }
        // An outdated inner key can route the descent past the ceiling row.
        loop {
            let Some(ceil) = self.find(Some(row), None)?.next_row()? else {
                return Ok(None);
            };
            let removed =
                self.do_remove(&ceil, false, bag.as_mut().map(|b| &mut **b as &mut dyn ReuseBag))?;
            if removed.is_some() {
                return Ok(removed);
            }
            self.check_interrupted()?;
        }
    }

    fn do_remove(
        &self,
        row: &C::Row,
        ceil: bool,
        bag: Option<&mut dyn ReuseBag>,
    ) -> Result<Option<C::Row>> {
        self.check_destroyed()?;
        let mut r = Remove::new(row.clone(), ceil, bag);
        let res = self.remove_loop(&mut r);
        r.release_tail();
        let res = res.and_then(|()| self.reuse_free_pages(&mut r));
        res.map_err(|e| TreeError::wrap(e, || format!("Runtime failure on search row: {:?}", row)))?;
        Ok(r.removed)
    }

    fn reuse_free_pages(&self, r: &mut Remove<'_, C>) -> Result<()> {
        if r.bag.is_some() || r.free_pages.is_empty() {
            return Ok(());
        }
        match self.structure.reuse_list() {
            Some(reuse_list) => reuse_list.add_for_recycle(&mut r.free_pages),
            None => {
                debug!(
                    "Tree {} has no reuse list, dropping {} freed pages",
                    self.name,
                    r.free_pages.len()
                );
                Ok(())
            }
        }
    }

    /// Once the row is gone the remaining merges always run to the end.
    fn check_remove_interrupted(&self, r: &Remove<'_, C>) -> Result<()> {
        if r.removed.is_none() {
            self.check_interrupted()?;
        }
        Ok(())
    }

    fn remove_loop(&self, r: &mut Remove<'_, C>) -> Result<()> {
        loop {
            self.init_descent(&mut r.d)?;
            let (root_id, root_lvl) = (r.d.root_id, r.d.root_lvl);
            match self.remove_down(r, root_id, PageId::NONE, PageId::NONE, root_lvl)? {
                Outcome::Retry | Outcome::RetryRoot => self.check_remove_interrupted(r)?,
                _ => {
                    if !r.finished {
                        match self.finish_tail(r, true)? {
                            Outcome::Found => {}
                            Outcome::Retry => {
                                self.check_remove_interrupted(r)?;
                                continue;
                            }
                            res => {
                                return Err(TreeError::invariant(format!(
                                    "Unexpected {:?} finishing the tail at the root",
                                    res
                                ))
                                .into())
                            }
                        }
                    }
                    return Ok(());
                }
            }
        }
    }

    fn remove_down(
        &self,
        r: &mut Remove<'_, C>,
        page_id: PageId,
        back_id: PageId,
        fwd_id: PageId,
        lvl: usize,
    ) -> Result<Outcome> {
        if r.is_tail(page_id, lvl) {
            return Ok(Outcome::Found);
        }
        loop {
            r.d.page_id = page_id;
            r.d.fwd_id = fwd_id;
            r.d.back_id = back_id;

            let mut res = self.search(r, lvl)?;
            if res == Outcome::GoDownX {
                // The child's back page is the rightmost child of our back.
                res = self.ask_neighbor(r, back_id, true, page_id)?;
                if res != Outcome::Found {
                    return Ok(res);
                }
                res = Outcome::GoDown;
            }

            match res {
                Outcome::GoDown => {
                    let (child_id, child_back_id, child_fwd_id) = (r.d.page_id, r.d.back_id, r.d.fwd_id);
                    let mut res = self.remove_down(r, child_id, child_back_id, child_fwd_id, lvl - 1)?;
                    if res == Outcome::Retry {
                        self.check_remove_interrupted(r)?;
                        continue;
                    }
                    if res != Outcome::RetryRoot && !r.finished {
                        res = self.finish_tail(r, false)?;
                        if res == Outcome::NotFound {
                            res = self.lock_tail(r, page_id, back_id, fwd_id, lvl)?;
                        }
                    }
                    return Ok(res);
                }
                Outcome::NotFound if !r.ceil => {
                    r.finish()?;
                    return Ok(res);
                }
                Outcome::NotFound | Outcome::Found => {
                    let res = self.remove_from_leaf(r, page_id, back_id, fwd_id)?;
                    if res == Outcome::NotFound || (res == Outcome::Found && r.tail.is_none()) {
                        r.finish()?;
                    }
                    return Ok(res);
                }
                res => return Ok(res),
            }
        }
    }

    fn remove_from_leaf(
        &self,
        r: &mut Remove<'_, C>,
        leaf_id: PageId,
        back_id: PageId,
        fwd_id: PageId,
    ) -> Result<Outcome> {
        if back_id.is_none() {
            return self.do_remove_from_leaf(r, leaf_id, back_id, fwd_id);
        }

        // The back page is latched first, a merge will need it.
        let back = self.mem().write(back_id)?;
        let back_io = match self.checked_io(back_id, &back, r.d.rmv_id, 0)? {
            Ok(io) => io,
            Err(res) => return Ok(res),
        };
        if back_io.forward(&back) != leaf_id {
            return Ok(Outcome::Retry);
        }
        let res = self.do_remove_from_leaf(r, leaf_id, back_id, fwd_id)?;
        if res == Outcome::Found && r.tail.is_some() {
            r.add_tail(back_id, back, back_io, 0, FrameKind::Back)?;
        }
        Ok(res)
    }

    fn do_remove_from_leaf(
        &self,
        r: &mut Remove<'_, C>,
        leaf_id: PageId,
        back_id: PageId,
        fwd_id: PageId,
    ) -> Result<Outcome> {
        let mut page = self.mem().write(leaf_id)?;
        let io = match self.checked_io(leaf_id, &page, r.d.rmv_id, 0)? {
            Ok(io) => io,
            Err(res) => return Ok(res),
        };
        let cnt = io.count(&page);
        let mut idx = self.find_insertion_point(&io, &page, cnt, &r.row, 0);
        if idx < 0 {
            if !r.ceil {
                return Ok(Outcome::Retry);
            }
            let ceil_idx = fix(idx);
            if ceil_idx == cnt {
                return Ok(Outcome::NotFound);
            }
            idx = ceil_idx as isize;
        }
        let idx = idx as usize;

        // The leaf's last row has an inner copy unless this is the rightmost leaf.
        let need_replace_inner =
            self.codec.can_get_row_from_inner() && idx == cnt - 1 && !io.forward(&page).is_none();
        // Merge only pages that become empty and have a neighbor to merge with.
        let may_merge = cnt == 1 && (!fwd_id.is_none() || !back_id.is_none());

        if need_replace_inner || may_merge {
            if !fwd_id.is_none() && back_id.is_none() {
                let res = self.lock_forward(r, fwd_id, 0)?;
                if res != Outcome::Found {
                    return Ok(res);
                }
            }
            if cnt == 1 {
                r.need_merge_empty_branch = Flag::True;
            }
            if need_replace_inner {
                r.need_replace_inner = Flag::True;
            }
            let t = r.add_tail(leaf_id, page, io, 0, FrameKind::Exact)?;
            r.frame_mut(t)?.idx = Some(idx as isize);
            return Ok(Outcome::Found);
        }

        r.remove_data_row_from_leaf(self, leaf_id, &mut page, &io, cnt, idx)?;
        Ok(Outcome::Found)
    }

    fn lock_forward(&self, r: &mut Remove<'_, C>, fwd_id: PageId, lvl: usize) -> Result<Outcome> {
        let page = self.mem().write(fwd_id)?;
        let io = match self.checked_io(fwd_id, &page, r.d.rmv_id, lvl)? {
            Ok(io) => io,
            Err(res) => return Ok(res),
        };
        r.add_tail(fwd_id, page, io, lvl, FrameKind::Forward)?;
        Ok(Outcome::Found)
    }

    /// Adds `page_id` (and its back page, if the descent turned right) as
    /// the next tail level.
    fn lock_tail(
        &self,
        r: &mut Remove<'_, C>,
        page_id: PageId,
        back_id: PageId,
        fwd_id: PageId,
        lvl: usize,
    ) -> Result<Outcome> {
        if back_id.is_none() {
            return self.do_lock_tail(r, page_id, back_id, fwd_id, lvl);
        }

        let back = self.mem().write(back_id)?;
        let back_io = match self.checked_io(back_id, &back, r.d.rmv_id, lvl)? {
            Ok(io) => io,
            Err(res) => return Ok(res),
        };
        if back_io.forward(&back) != page_id {
            return Ok(Outcome::Retry);
        }
        let res = self.do_lock_tail(r, page_id, back_id, fwd_id, lvl)?;
        if res == Outcome::Found {
            r.add_tail(back_id, back, back_io, lvl, FrameKind::Back)?;
        }
        Ok(res)
    }

    fn do_lock_tail(
        &self,
        r: &mut Remove<'_, C>,
        page_id: PageId,
        back_id: PageId,
        fwd_id: PageId,
        lvl: usize,
    ) -> Result<Outcome> {
        let page = self.mem().write(page_id)?;
        let io = match self.checked_io(page_id, &page, r.d.rmv_id, lvl)? {
            Ok(io) => io,
            Err(res) => return Ok(res),
        };
        if io.forward(&page) != fwd_id {
            return Ok(Outcome::Retry);
        }
        // Without a back page we become the back of our forward.
        if !fwd_id.is_none() && back_id.is_none() {
            let res = self.lock_forward(r, fwd_id, lvl)?;
            if res != Outcome::Found {
                return Ok(res);
            }
        }
        r.add_tail(page_id, page, io, lvl, FrameKind::Exact)?;
        Ok(Outcome::Found)
    }

    /// Processes the tail after a new level was latched. `NotFound` asks the
    /// caller to latch one level more.
    fn finish_tail(&self, r: &mut Remove<'_, C>, root: bool) -> Result<Outcome> {
        let t = r.top()?;
        if r.frame(t)?.lvl == 0 {
            return Ok(Outcome::NotFound);
        }

        if !r.validate_tail(self)? {
            if r.release_for_retry(t)? {
                return Ok(Outcome::Retry);
            }
        } else {
            if r.need_replace_inner == Flag::True {
                if r.insertion_point(self, t)? >= 0 {
                    r.need_replace_inner = Flag::Ready;
                } else if root {
                    // A concurrent merge may have taken the inner key.
                    r.need_replace_inner = Flag::False;
                } else {
                    return Ok(Outcome::NotFound);
                }
            }

            if r.need_merge_empty_branch == Flag::True {
                // The join point cannot be a routing page.
                if r.frame(t)?.count() == 0 {
                    return Ok(Outcome::NotFound);
                }
                if let Some(bad) = r.merge_empty_branch(self)? {
                    if !r.release_for_retry(bad)? {
                        return Err(TreeError::invariant("Cannot retry an empty branch merge").into());
                    }
                    return Ok(Outcome::Retry);
                }
                r.need_merge_empty_branch = Flag::Done;
            }

            r.merge_bottom_up(self, t)?;

            if r.need_replace_inner == Flag::Ready {
                r.replace_inner(self)?;
                r.need_replace_inner = Flag::Done;
            }

            let (cnt, lvl, sibling, max) = {
                let f = r.frame(t)?;
                (f.count(), f.lvl, f.sibling, f.io.max_count())
            };
            let sibling_cnt = match sibling {
                Some(s) => Some(r.frame(s)?.count()),
                None => None,
            };
            if cnt == 0 && lvl != 0 && self.root_level()? == lvl {
                // The root lost its last key, its only child takes over.
                self.cut_root(lvl)?;
                r.free_page(self, t, false)?;
            } else if sibling_cnt.is_some_and(|s| cnt + s < max) {
                // Lower levels are merged, the next merge is one level up.
                if let Some(down) = r.frame(t)?.down {
                    r.release_chain(down);
                    r.frame_mut(t)?.down = None;
                }
                return Ok(Outcome::NotFound);
            }
        }

        if r.removed.is_none() {
            return Err(TreeError::invariant("Tail finished without removing the row").into());
        }
        r.release_tail();
        r.finish()?;
        Ok(Outcome::Found)
    }

    fn cut_root(&self, lvl: usize) -> Result<()> {
        let mut meta = self.mem().write(self.meta_page_id)?;
        let root_lvl = BPlusMetaIo.root_level(&meta);
        if root_lvl != lvl as i32 {
            return Err(TreeError::invariant(format!(
                "Cutting root level {} but the root is at {}",
                lvl, root_lvl
            ))
            .into());
        }
        BPlusMetaIo.cut_root(&mut meta);
        self.structure.log(&meta, || DeltaRecord::MetaPageCutRoot {
            page_id: self.meta_page_id,
        })?;
        debug!("Tree {} shrank to root level {}", self.name, lvl - 1);
        Ok(())
    }

    /// Removes item `idx` of `cnt` from a latched page.
    fn remove_item(
        &self,
        page_id: PageId,
        page: &mut PageWriteGuard,
        io: &BPlusIo,
        cnt: usize,
        idx: usize,
    ) -> Result<()> {
        io.remove(page, idx, cnt);
        self.structure.log(page, || DeltaRecord::Remove {
            page_id,
            idx: idx as u16,
            count: cnt as u16,
        })
    }
}
