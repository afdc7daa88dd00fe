//! Concurrent B+Tree over fixed-size items stored in pages.
//!
//! Lookups descend with shared latches taken one page at a time and no latch
//! coupling. Each step remembers the page the next level's page must point
//! forward to (the triangle check), so a concurrent split or merge shows up
//! as a mismatch and the step is retried. Inserts latch only the page they
//! change and walk back up with the split key. Removes keep a tail of
//! exclusively latched pages from the leaf up while merging. See `put` and
//! `remove` for those paths.
//!
//! Inner pages may keep full rows ([`RowCodec::can_get_row_from_inner`]). A
//! remove of the greatest row under an inner key replaces that key and stamps
//! a fresh remove id on both pages, so a lookup that read the old key sees a
//! newer id on the leaf and restarts from the root.

pub mod context;
pub mod cursor;
pub mod error;
mod put;
mod remove;
pub mod row;
mod validate;

use anyhow::Result;
use log::{debug, warn};
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

pub use context::TreeContext;
pub use cursor::ForwardCursor;
pub use error::TreeError;
pub use row::{KeyValue, KeyValueCodec, RowCodec, U64Codec};

use self::cursor::{Batch, GetCursor};
use crate::access::structure::{DataStructure, LongListBag, ReuseBag};
use crate::storage::error::StorageError;
use crate::storage::handler;
use crate::storage::memory::PageMemory;
use crate::storage::page::page_io::{self, T_BPLUS_INNER, T_BPLUS_LEAF};
use crate::storage::page::{BPlusIo, BPlusMetaIo, PageId, PageKind};
use crate::storage::wal::DeltaRecord;

/// Pages recycled by `destroy` are handed to the reuse list in batches of
/// this size.
const DESTROY_BATCH: usize = 128;

#[derive(Debug, Clone)]
pub struct BPlusTreeConfig {
    pub name: String,
    /// Lowers the number of items per page below what the page size allows.
    pub max_items_per_page: Option<usize>,
}

impl Default for BPlusTreeConfig {
    fn default() -> Self {
        Self {
            name: "tree".to_string(),
            max_items_per_page: None,
        }
    }
}

/// Outcome of one step of a descent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    GoDown,
    /// Go down, but the child's back page must first be asked from our own
    /// back page (we are an empty routing page).
    GoDownX,
    Found,
    NotFound,
    /// Re-read the page at this level.
    Retry,
    /// Restart from the root.
    RetryRoot,
}

/// Progress of a deferred part of a remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flag {
    False,
    True,
    Ready,
    Done,
}

/// Position of an operation in the tree.
#[derive(Debug, Clone, Copy, Default)]
struct Descent {
    rmv_id: u64,
    root_lvl: usize,
    root_id: PageId,
    page_id: PageId,
    /// Expected forward of `page_id`.
    fwd_id: PageId,
    /// Back page of `page_id`, known only after a right turn.
    back_id: PageId,
    /// How an equal row compares: `0` stops on it, `-1` lands before it and
    /// `1` after it.
    shift: i32,
}

impl Descent {
    fn with_shift(shift: i32) -> Self {
        Self {
            shift,
            ..Self::default()
        }
    }
}

/// Operation driven by the shared search step.
trait Search<C: RowCodec> {
    fn descent(&mut self) -> &mut Descent;

    fn row(&self) -> &C::Row;

    /// Exact match at `idx`. `true` stops the descent with `Found`.
    fn found(
        &mut self,
        tree: &BPlusTree<C>,
        io: &BPlusIo,
        buf: &[u8],
        idx: usize,
        lvl: usize,
    ) -> Result<bool>;

    /// No match, `idx` is the insertion point. `true` stops the descent
    /// with `NotFound`.
    fn not_found(
        &mut self,
        tree: &BPlusTree<C>,
        io: &BPlusIo,
        buf: &[u8],
        idx: usize,
        lvl: usize,
    ) -> Result<bool>;
}

/// Exact lookup of a single row.
struct GetOne<'r, R> {
    d: Descent,
    row: &'r R,
    res: Option<R>,
}

impl<C: RowCodec> Search<C> for GetOne<'_, C::Row> {
    fn descent(&mut self) -> &mut Descent {
        &mut self.d
    }

    fn row(&self) -> &C::Row {
        self.row
    }

    fn found(
        &mut self,
        tree: &BPlusTree<C>,
        io: &BPlusIo,
        buf: &[u8],
        idx: usize,
        lvl: usize,
    ) -> Result<bool> {
        if lvl != 0 && !tree.codec.can_get_row_from_inner() {
            return Ok(false);
        }
        self.res = Some(tree.codec.get_row(io.kind(), io.item(buf, idx))?);
        Ok(true)
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

/// Maps a negative insertion point to the index it encodes.
fn fix(idx: isize) -> usize {
    if idx < 0 {
        (-idx - 1) as usize
    } else {
        idx as usize
    }
}

pub struct BPlusTree<C: RowCodec> {
    name: String,
    structure: DataStructure,
    ctx: Arc<TreeContext>,
    codec: C,
    meta_page_id: PageId,
    leaf_io: BPlusIo,
    inner_io: BPlusIo,
    destroyed: AtomicBool,
}

impl<C: RowCodec> BPlusTree<C> {
    fn new(
        config: BPlusTreeConfig,
        structure: DataStructure,
        ctx: Arc<TreeContext>,
        codec: C,
        meta_page_id: PageId,
    ) -> Result<Self> {
        let page_size = structure.page_size();
        let cap = config.max_items_per_page;
        let leaf_io = BPlusIo::new(
            PageKind::Leaf,
            codec.item_size(PageKind::Leaf),
            page_size,
            cap,
        );
        let inner_io = BPlusIo::new(
            PageKind::Inner,
            codec.item_size(PageKind::Inner),
            page_size,
            cap,
        );
        if leaf_io.max_count() < 2 || inner_io.max_count() < 2 {
            anyhow::bail!(
                "Tree {} needs at least 2 items per page, got leaf={} inner={}",
                config.name,
                leaf_io.max_count(),
                inner_io.max_count()
            );
        }
        Ok(Self {
            name: config.name,
            structure,
            ctx,
            codec,
            meta_page_id,
            leaf_io,
            inner_io,
            destroyed: AtomicBool::new(false),
        })
    }

    /// Creates an empty tree: a meta page and a single leaf as the root.
    pub fn create(
        config: BPlusTreeConfig,
        structure: DataStructure,
        ctx: Arc<TreeContext>,
        codec: C,
    ) -> Result<Self> {
        let meta_page_id = structure.allocate_page(None)?;
        let tree = Self::new(config, structure, ctx, codec, meta_page_id)?;

        let root_id = tree.structure.allocate_page(None)?;
        handler::init_page(tree.mem(), tree.structure.wal(), root_id, &tree.leaf_io)?;

        let mut meta = tree.mem().write(meta_page_id)?;
        handler::init_page_locked(tree.structure.wal(), &mut meta, meta_page_id, &BPlusMetaIo)?;
        BPlusMetaIo.init_root(&mut meta, root_id);
        tree.structure.log(&meta, || DeltaRecord::MetaPageInitRoot {
            page_id: meta_page_id,
            root_id,
        })?;
        drop(meta);

        debug!(
            "Created tree {} with meta page {} and root {}",
            tree.name, meta_page_id, root_id
        );
        Ok(tree)
    }

    /// Attaches to a tree whose meta page already exists.
    pub fn open(
        config: BPlusTreeConfig,
        structure: DataStructure,
        ctx: Arc<TreeContext>,
        codec: C,
        meta_page_id: PageId,
    ) -> Result<Self> {
        let tree = Self::new(config, structure, ctx, codec, meta_page_id)?;
        {
            let meta = tree.mem().read(meta_page_id)?;
            if !handler::check_page_id(meta_page_id, &meta) {
                return Err(StorageError::PageNotFound(meta_page_id).into());
            }
            page_io::PageIo::expect(&meta, BPlusMetaIo::PAGE_IO.page_type)?;
            if BPlusMetaIo.root_level(&meta) < 0 {
                return Err(TreeError::invariant(format!(
                    "Meta page {} of tree {} has no root",
                    meta_page_id, tree.name
                ))
                .into());
            }
        }

        // Leaves remember the last inner replace on their path. Readers compare
        // it with the context counter, which must not lag behind the pages.
        let mut max_rmv_id = 0;
        tree.for_each_leaf(|io, buf| {
            max_rmv_id = max_rmv_id.max(io.remove_id(buf));
        })?;
        tree.ctx.advance_remove_id(max_rmv_id);

        debug!(
            "Opened tree {} at meta page {} (root level {}, remove id {})",
            tree.name,
            meta_page_id,
            tree.root_level()?,
            max_rmv_id
        );
        Ok(tree)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta_page_id(&self) -> PageId {
        self.meta_page_id
    }

    pub fn context(&self) -> &Arc<TreeContext> {
        &self.ctx
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    fn mem(&self) -> &PageMemory {
        self.structure.mem()
    }

    fn check_destroyed(&self) -> Result<()> {
        if self.destroyed.load(AtomicOrdering::SeqCst) {
            return Err(TreeError::Destroyed {
                name: self.name.clone(),
            }
            .into());
        }
        Ok(())
    }

    fn check_interrupted(&self) -> Result<()> {
        if self.ctx.is_interrupted() {
            return Err(TreeError::Interrupted.into());
        }
        Ok(())
    }

    /// Codec for the tree page in `buf`.
    fn io_for(&self, buf: &[u8]) -> Result<BPlusIo> {
        match page_io::page_type(buf) {
            T_BPLUS_LEAF => Ok(self.leaf_io),
            T_BPLUS_INNER => Ok(self.inner_io),
            found => Err(StorageError::UnexpectedPageType {
                page_id: page_io::page_id(buf),
                expected: T_BPLUS_LEAF,
                found,
            }
            .into()),
        }
    }

    /// Checks a latched page before trusting it: it must still be `page_id`,
    /// and a leaf must not carry a remove id newer than the operation.
    fn checked_io(
        &self,
        page_id: PageId,
        buf: &[u8],
        rmv_id: u64,
        lvl: usize,
    ) -> Result<std::result::Result<BPlusIo, Outcome>> {
        if !handler::check_page_id(page_id, buf) {
            return Ok(Err(Outcome::Retry));
        }
        let io = self.io_for(buf)?;
        if lvl == 0 && rmv_id < io.remove_id(buf) {
            return Ok(Err(Outcome::RetryRoot));
        }
        Ok(Ok(io))
    }

    fn compare(&self, io: &BPlusIo, buf: &[u8], idx: usize, row: &C::Row) -> Ordering {
        self.codec.compare(io.kind(), io.item(buf, idx), row)
    }

    /// Binary search for `row` among the first `cnt` items. Returns the index
    /// of the match, or `-(insertion point) - 1`.
    fn find_insertion_point(
        &self,
        io: &BPlusIo,
        buf: &[u8],
        cnt: usize,
        row: &C::Row,
        shift: i32,
    ) -> isize {
        let mut low = 0isize;
        let mut high = cnt as isize - 1;
        while low <= high {
            let mid = (low + high) >> 1;
            let mut cmp = self.compare(io, buf, mid as usize, row);
            if cmp == Ordering::Equal && shift != 0 {
                cmp = if shift < 0 {
                    Ordering::Greater
                } else {
                    Ordering::Less
                };
            }
            match cmp {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid - 1,
                Ordering::Equal => return mid,
            }
        }
        -(low + 1)
    }

    fn first_page_id(&self, lvl: usize) -> Result<PageId> {
        let meta = self.mem().read(self.meta_page_id)?;
        Ok(BPlusMetaIo.first_page_id(&meta, lvl))
    }

    /// Root level, `0` when the root is a leaf.
    pub fn root_level(&self) -> Result<usize> {
        self.check_destroyed()?;
        let meta = self.mem().read(self.meta_page_id)?;
        let lvl = BPlusMetaIo.root_level(&meta);
        if lvl < 0 {
            return Err(TreeError::invariant(format!("Tree {} has no root", self.name)).into());
        }
        Ok(lvl as usize)
    }

    /// Starts a descent from the current root.
    fn init_descent(&self, d: &mut Descent) -> Result<()> {
        let meta = self.mem().read(self.meta_page_id)?;
        let lvl = BPlusMetaIo.root_level(&meta);
        if lvl < 0 {
            return Err(TreeError::invariant(format!("Tree {} has no root", self.name)).into());
        }
        d.root_lvl = lvl as usize;
        d.root_id = BPlusMetaIo.first_page_id(&meta, lvl as usize);
        d.rmv_id = self.ctx.remove_id();
        d.page_id = PageId::NONE;
        d.fwd_id = PageId::NONE;
        d.back_id = PageId::NONE;
        Ok(())
    }

    /// One step of a descent on `g.descent().page_id`, under a shared latch.
    fn search<S: Search<C>>(&self, g: &mut S, lvl: usize) -> Result<Outcome> {
        let d = *g.descent();
        let page = self.mem().read(d.page_id)?;
        let io = match self.checked_io(d.page_id, &page, d.rmv_id, lvl)? {
            Ok(io) => io,
            Err(res) => return Ok(res),
        };

        let need_back_if_routing = !d.back_id.is_none();
        // Usually we go left down and the back page is not needed.
        g.descent().back_id = PageId::NONE;

        let cnt = io.count(&page);
        let idx = self.find_insertion_point(&io, &page, cnt, g.row(), d.shift);
        let idx = if idx >= 0 {
            let idx = idx as usize;
            if g.found(self, &io, &page, idx, lvl)? {
                return Ok(Outcome::Found);
            }
            idx
        } else {
            let idx = fix(idx);
            // Going right on a page that has split since the parent was read.
            if idx == cnt && io.forward(&page) != d.fwd_id {
                return Ok(Outcome::Retry);
            }
            if g.not_found(self, &io, &page, idx, lvl)? {
                return Ok(Outcome::NotFound);
            }
            idx
        };

        if io.is_leaf() {
            return Err(TreeError::invariant(format!(
                "Descent of tree {} went below leaf {}",
                self.name, d.page_id
            ))
            .into());
        }

        g.descent().page_id = io.left(&page, idx);
        if idx < cnt {
            g.descent().fwd_id = io.right(&page, idx);
        } else {
            // The child's forward is the leftmost child of our forward page.
            let fwd = io.forward(&page);
            if fwd.is_none() {
                g.descent().fwd_id = PageId::NONE;
            } else {
                let res = self.ask_neighbor(g, fwd, false, PageId::NONE)?;
                if res != Outcome::Found {
                    return Ok(res);
                }
            }

            if cnt != 0 {
                g.descent().back_id = io.left(&page, cnt - 1);
            } else if need_back_if_routing {
                // Only remove needs it, and it must come from our back page,
                // which cannot be latched while this one is held.
                return Ok(Outcome::GoDownX);
            }
        }
        Ok(Outcome::GoDown)
    }

    /// Reads the child link a descent needs from a neighbor at the same
    /// level: the rightmost child of the back page, or the leftmost child of
    /// the forward page. A back page must still point forward to `expected`.
    fn ask_neighbor<S: Search<C>>(
        &self,
        g: &mut S,
        page_id: PageId,
        back: bool,
        expected: PageId,
    ) -> Result<Outcome> {
        let page = self.mem().read(page_id)?;
        if !handler::check_page_id(page_id, &page) {
            return Ok(Outcome::Retry);
        }
        let io = self.io_for(&page)?;
        if back {
            if io.forward(&page) != expected {
                return Ok(Outcome::Retry);
            }
            g.descent().back_id = io.left(&page, io.count(&page));
        } else {
            g.descent().fwd_id = io.left(&page, 0);
        }
        Ok(Outcome::Found)
    }

    fn find_down<S: Search<C>>(
        &self,
        g: &mut S,
        page_id: PageId,
        fwd_id: PageId,
        lvl: usize,
    ) -> Result<Outcome> {
        loop {
            let d = g.descent();
            d.page_id = page_id;
            d.fwd_id = fwd_id;

            match self.search(g, lvl)? {
                Outcome::GoDown | Outcome::GoDownX => {
                    let d = *g.descent();
                    let res = self.find_down(g, d.page_id, d.fwd_id, lvl - 1)?;
                    if res == Outcome::Retry {
                        self.check_interrupted()?;
                        continue;
                    }
                    return Ok(res);
                }
                res => return Ok(res),
            }
        }
    }

    fn do_find<S: Search<C>>(&self, g: &mut S) -> Result<()> {
        loop {
            self.init_descent(g.descent())?;
            let d = *g.descent();
            match self.find_down(g, d.root_id, PageId::NONE, d.root_lvl)? {
                Outcome::Retry | Outcome::RetryRoot => self.check_interrupted()?,
                _ => return Ok(()),
            }
        }
    }

    /// Exact lookup.
    pub fn find_one(&self, row: &C::Row) -> Result<Option<C::Row>> {
        self.check_destroyed()?;
        let mut g = GetOne {
            d: Descent::default(),
            row,
            res: None,
        };
        self.do_find(&mut g)
            .map_err(|e| TreeError::wrap(e, || format!("Runtime failure on lookup row: {:?}", row)))?;
        Ok(g.res)
    }

    /// Cursor over rows with `lower <= row <= upper`. Missing bounds are open.
    pub fn find(
        &self,
        lower: Option<&C::Row>,
        upper: Option<&C::Row>,
    ) -> Result<ForwardCursor<'_, C>> {
        self.check_destroyed()?;
        let mut cursor = ForwardCursor::new(self, lower.cloned(), upper.cloned());
        cursor.init().map_err(|e| {
            TreeError::wrap(e, || {
                format!(
                    "Runtime failure on bounds: [lower={:?}, upper={:?}]",
                    lower, upper
                )
            })
        })?;
        Ok(cursor)
    }

    /// Batch of rows starting at the first row not below `lower` (shift `-1`)
    /// or above it (shift `1`).
    fn find_batch(
        &self,
        lower: &C::Row,
        shift: i32,
        upper: Option<&C::Row>,
    ) -> Result<Batch<C::Row>> {
        let mut g = GetCursor {
            d: Descent::with_shift(shift),
            lower,
            upper,
            batch: None,
        };
        self.do_find(&mut g)?;
        Ok(g.batch.unwrap_or_else(Batch::empty))
    }

    /// Batch of rows from the start of the leftmost leaf.
    fn first_batch(&self, upper: Option<&C::Row>) -> Result<Batch<C::Row>> {
        let first = self.first_page_id(0)?;
        let page = self.mem().read(first)?;
        let io = self.io_for(&page)?;
        self.fill_batch(&io, &page, 0, upper)
    }

    /// Copies the rows of a leaf from `start` on, stopping after `upper`.
    fn fill_batch(
        &self,
        io: &BPlusIo,
        buf: &[u8],
        start: usize,
        upper: Option<&C::Row>,
    ) -> Result<Batch<C::Row>> {
        self.check_destroyed()?;
        let mut next_page_id = io.forward(buf);
        let mut cnt = io.count(buf);
        if let Some(upper) = upper {
            if start < cnt && self.compare(io, buf, cnt - 1, upper) == Ordering::Greater {
                cnt = fix(self.find_insertion_point(io, buf, cnt, upper, 1));
                next_page_id = PageId::NONE;
            }
        }
        let rows = (start..cnt.max(start))
            .map(|i| self.codec.get_row(io.kind(), io.item(buf, i)))
            .collect::<Result<_>>()?;
        Ok(Batch { rows, next_page_id })
    }

    /// Visits every leaf from left to right. Not safe against concurrent
    /// structure changes.
    fn for_each_leaf(&self, mut f: impl FnMut(&BPlusIo, &[u8])) -> Result<()> {
        let mut page_id = self.first_page_id(0)?;
        while !page_id.is_none() {
            let page = self.mem().read(page_id)?;
            let io = self.io_for(&page)?;
            f(&io, &page);
            page_id = io.forward(&page);
        }
        Ok(())
    }

    /// Number of rows, counted leaf by leaf. Best effort under concurrent
    /// changes.
    pub fn size(&self) -> Result<usize> {
        self.check_destroyed()?;
        'restart: loop {
            let mut cnt = 0;
            let mut page_id = self.first_page_id(0)?;
            while !page_id.is_none() {
                let page = self.mem().read(page_id)?;
                if !handler::check_page_id(page_id, &page) {
                    self.check_interrupted()?;
                    continue 'restart;
                }
                let io = self.io_for(&page)?;
                cnt += io.count(&page);
                page_id = io.forward(&page);
            }
            return Ok(cnt);
        }
    }

    /// Recycles every page of the tree and marks the tree destroyed. Pages go
    /// to `bag` when given, otherwise to the reuse list in batches. Returns
    /// the number of recycled pages, `0` when the tree was already destroyed.
    ///
    /// The caller guarantees nothing else uses the tree anymore.
    pub fn destroy(&self, bag: Option<&mut dyn ReuseBag>) -> Result<usize> {
        if self.destroyed.swap(true, AtomicOrdering::SeqCst) {
            return Ok(0);
        }
        let reuse_list = self.structure.reuse_list();
        if bag.is_none() && reuse_list.is_none() {
            warn!(
                "Tree {} has no reuse list, its pages are abandoned",
                self.name
            );
            return Ok(0);
        }

        let wal = self.structure.wal();
        let mut own_bag = LongListBag::new();
        let external = bag.is_some();
        let bag: &mut dyn ReuseBag = match bag {
            Some(bag) => bag,
            None => &mut own_bag,
        };
        let mut pages = 0;

        let mut meta = self.mem().write(self.meta_page_id)?;
        let levels = BPlusMetaIo.levels_count(&meta);
        for lvl in (0..levels).rev() {
            let mut page_id = BPlusMetaIo.first_page_id(&meta, lvl);
            while !page_id.is_none() {
                let mut page = self.mem().write(page_id)?;
                let io = self.io_for(&page)?;
                let fwd_id = io.forward(&page);
                bag.add_free_page(handler::recycle_page(wal, page_id, &mut page)?);
                drop(page);
                pages += 1;
                page_id = fwd_id;

                if !external && bag.len() == DESTROY_BATCH {
                    if let Some(reuse_list) = reuse_list {
                        reuse_list.add_for_recycle(bag)?;
                    }
                }
            }
        }
        bag.add_free_page(handler::recycle_page(wal, self.meta_page_id, &mut meta)?);
        pages += 1;
        drop(meta);

        if !external {
            if let Some(reuse_list) = reuse_list {
                reuse_list.add_for_recycle(bag)?;
            }
        }
        debug!("Destroyed tree {}, recycled {} pages", self.name, pages);
        Ok(pages)
    }
}

impl<C: RowCodec> fmt::Debug for BPlusTree<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BPlusTree")
            .field("name", &self.name)
            .field("meta_page_id", &self.meta_page_id)
            .field("leaf_max", &self.leaf_io.max_count())
            .field("inner_max", &self.inner_io.max_count())
            .field("destroyed", &self.destroyed.load(AtomicOrdering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::freelist::{ReuseList, ReuseListImpl};
    use crate::storage::memory::PageMemoryConfig;
    use crate::storage::wal::MemoryWal;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn structure(page_size: usize) -> Result<DataStructure> {
        let mem = PageMemory::new(PageMemoryConfig {
            page_size,
            partition: 0,
        })?;
        let reuse: Arc<dyn ReuseList> = Arc::new(ReuseListImpl::create("reuse", mem.clone(), None)?);
        Ok(DataStructure::new(mem, None, Some(reuse)))
    }

    fn small_tree<C: RowCodec>(codec: C, max: usize) -> Result<BPlusTree<C>> {
        BPlusTree::create(
            BPlusTreeConfig {
                name: "test".to_string(),
                max_items_per_page: Some(max),
            },
            structure(512)?,
            Arc::new(TreeContext::new()),
            codec,
        )
    }

    fn collect<C: RowCodec>(
        tree: &BPlusTree<C>,
        lower: Option<&C::Row>,
        upper: Option<&C::Row>,
    ) -> Result<Vec<C::Row>> {
        tree.find(lower, upper)?.collect()
    }

    #[test]
    fn test_empty_tree() -> Result<()> {
        let tree = small_tree(U64Codec, 4)?;
        assert_eq!(tree.root_level()?, 0);
        assert_eq!(tree.size()?, 0);
        assert_eq!(tree.find_one(&1)?, None);
        assert!(collect(&tree, None, None)?.is_empty());
        assert!(collect(&tree, Some(&1), Some(&10))?.is_empty());
        tree.validate_tree()?;
        Ok(())
    }

    #[test]
    fn test_insertion_point_shift() -> Result<()> {
        let tree = small_tree(U64Codec, 8)?;
        let io = tree.leaf_io;
        let mut buf = vec![0u8; 512];
        io.init_new_page(&mut buf, PageId(1));
        for (i, v) in [10u64, 20, 30].iter().enumerate() {
            io.insert(&mut buf, i, &v.to_le_bytes(), PageId::NONE);
        }
        assert_eq!(tree.find_insertion_point(&io, &buf, 3, &20, 0), 1);
        assert_eq!(tree.find_insertion_point(&io, &buf, 3, &20, -1), -2);
        assert_eq!(tree.find_insertion_point(&io, &buf, 3, &20, 1), -3);
        assert_eq!(tree.find_insertion_point(&io, &buf, 3, &5, 0), -1);
        assert_eq!(fix(tree.find_insertion_point(&io, &buf, 3, &35, 0)), 3);
        Ok(())
    }

    #[test]
    fn test_put_find_remove() -> Result<()> {
        let tree = small_tree(U64Codec, 4)?;
        let mut keys: Vec<u64> = (1..=500).collect();
        keys.shuffle(&mut rand::rngs::StdRng::seed_from_u64(7));
        for k in &keys {
            assert_eq!(tree.put(*k)?, None);
        }
        tree.validate_tree()?;
        assert!(tree.root_level()? >= 3);
        assert_eq!(tree.size()?, 500);
        assert_eq!(tree.find_one(&250)?, Some(250));
        assert_eq!(tree.find_one(&501)?, None);
        assert_eq!(collect(&tree, None, None)?, (1..=500).collect::<Vec<_>>());
        assert_eq!(collect(&tree, Some(&100), Some(&104))?, vec![100, 101, 102, 103, 104]);

        for k in (1..=500).step_by(2) {
            assert_eq!(tree.remove(&k)?, Some(k));
        }
        tree.validate_tree()?;
        assert_eq!(tree.size()?, 250);
        assert_eq!(tree.find_one(&3)?, None);
        assert_eq!(tree.find_one(&4)?, Some(4));
        assert_eq!(tree.remove(&3)?, None);
        Ok(())
    }

    #[test]
    fn test_key_value_replace() -> Result<()> {
        let tree = small_tree(KeyValueCodec, 4)?;
        for k in 0..100 {
            assert_eq!(tree.put(KeyValue::new(k, k * 10))?, None);
        }
        let old = tree.put(KeyValue::new(42, 1))?;
        assert_eq!(old, Some(KeyValue::new(42, 420)));
        assert_eq!(tree.find_one(&KeyValue::lookup(42))?, Some(KeyValue::new(42, 1)));
        assert_eq!(tree.size()?, 100);
        tree.validate_tree()?;
        Ok(())
    }

    #[test]
    fn test_destroyed_tree_rejects_operations() -> Result<()> {
        let tree = small_tree(U64Codec, 4)?;
        for k in 0..50 {
            tree.put(k)?;
        }
        let pages = tree.destroy(None)?;
        assert!(pages > 2);
        assert_eq!(tree.destroy(None)?, 0);

        let err = tree.put(1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TreeError>(),
            Some(TreeError::Destroyed { .. })
        ));
        assert!(tree.find_one(&1).is_err());
        assert!(tree.size().is_err());
        Ok(())
    }

    #[test]
    fn test_destroy_into_caller_bag() -> Result<()> {
        let tree = small_tree(U64Codec, 4)?;
        for k in 0..300 {
            tree.put(k)?;
        }
        let mut bag = LongListBag::new();
        let pages = tree.destroy(Some(&mut bag))?;
        assert_eq!(bag.len(), pages);
        assert!(bag.page_ids().contains(&tree.meta_page_id().rotate()));
        Ok(())
    }

    #[test]
    fn test_interrupt_stops_retries_only() -> Result<()> {
        let tree = small_tree(U64Codec, 4)?;
        tree.context().interrupt_all();
        // No retry happens on an idle tree, so the operation completes.
        assert_eq!(tree.put(1)?, None);
        tree.context().clear_interrupt();
        assert_eq!(tree.find_one(&1)?, Some(1));
        Ok(())
    }

    #[test]
    fn test_interrupt_aborts_retrying_operations() -> Result<()> {
        let tree = small_tree(U64Codec, 4)?;
        for k in 1..=3 {
            tree.put(k)?;
        }
        // A leaf stamped by a newer remove forces every descent to retry.
        let leaf = tree.first_page_id(0)?;
        let ahead = tree.context().remove_id() + 10;
        tree.leaf_io.set_remove_id(&mut tree.mem().write(leaf)?, ahead);
        tree.context().interrupt_all();

        let interrupted = |res: Result<Option<u64>>| {
            matches!(
                res.unwrap_err().downcast_ref::<TreeError>(),
                Some(TreeError::Interrupted)
            )
        };
        assert!(interrupted(tree.put(4)));
        assert!(interrupted(tree.find_one(&1)));
        assert!(interrupted(tree.remove(&2)));

        tree.leaf_io.set_remove_id(&mut tree.mem().write(leaf)?, 0);
        tree.context().clear_interrupt();
        assert_eq!(tree.put(4)?, None);
        assert_eq!(tree.remove(&2)?, Some(2));
        assert_eq!(collect(&tree, None, None)?, vec![1, 3, 4]);
        tree.validate_tree()?;
        Ok(())
    }

    #[test]
    fn test_open_existing_tree() -> Result<()> {
        let structure = structure(512)?;
        let ctx = Arc::new(TreeContext::new());
        let config = BPlusTreeConfig {
            name: "reopen".to_string(),
            max_items_per_page: Some(4),
        };
        let tree = BPlusTree::create(config.clone(), structure.clone(), ctx.clone(), U64Codec)?;
        for k in 0..200 {
            tree.put(k)?;
        }
        for k in (0..200).step_by(3) {
            tree.remove(&k)?;
        }
        let meta = tree.meta_page_id();
        let rmv_id = ctx.remove_id();
        drop(tree);

        let fresh = Arc::new(TreeContext::new());
        let tree = BPlusTree::open(config, structure, fresh.clone(), U64Codec, meta)?;
        assert_eq!(fresh.remove_id(), rmv_id);
        tree.validate_tree()?;
        assert_eq!(tree.size()?, 200 - 67);
        assert_eq!(tree.find_one(&1)?, Some(1));
        assert_eq!(tree.find_one(&3)?, None);
        Ok(())
    }

    #[test]
    fn test_delta_records_after_checkpoint() -> Result<()> {
        let mem = PageMemory::new(PageMemoryConfig {
            page_size: 512,
            partition: 0,
        })?;
        let wal = Arc::new(MemoryWal::new());
        let structure = DataStructure::new(mem.clone(), Some(wal.clone()), None);
        let tree = BPlusTree::create(
            BPlusTreeConfig::default(),
            structure,
            Arc::new(TreeContext::new()),
            U64Codec,
        )?;
        tree.put(1)?;
        mem.checkpoint()?;
        // The first change after a checkpoint writes the whole page, later
        // ones are logged as deltas.
        tree.put(2)?;
        tree.put(3)?;
        let records = wal.records();
        assert!(records.iter().any(|r| matches!(
            &r.record,
            DeltaRecord::Insert { idx: 2, .. }
        )));
        Ok(())
    }
}
