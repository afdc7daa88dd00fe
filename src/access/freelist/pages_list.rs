//! Bucketed, striped lists of page ids stored in linked node pages.
//!
//! A bucket holds zero or more stripes. Each stripe is a doubly linked list
//! of node pages; only its tail accepts new ids. The in-memory tails array
//! of a bucket is an immutable `[tail0, head0, tail1, head1, ...]` slice
//! replaced by compare-and-swap, so readers never see a half-updated array.
//!
//! Latches are always taken data page first, then a node, then the node
//! before it, which is what keeps the concurrent merges deadlock free.

use anyhow::{anyhow, bail, ensure, Context, Result};
use log::{debug, trace, warn};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::access::structure::{DataStructure, ReuseBag, SingletonBag};
use crate::storage::handler::{self, check_page_id};
use crate::storage::memory::PageWriteGuard;
use crate::storage::page::page_io::{self, T_DATA, T_PAGE_LIST_META, T_PAGE_LIST_NODE};
use crate::storage::page::{
    DataPageIo, PageId, PageInit, PageIo, PagesListMetaIo, PagesListNodeIo, FLAG_IDX,
};
use crate::storage::wal::DeltaRecord;

/// Upper bound on buckets per list.
pub const MAX_BUCKETS: usize = 256;

type Tails = Arc<[PageId]>;

/// Per-bucket tails arrays with compare-and-swap replacement.
struct BucketArrays {
    slots: Vec<RwLock<Option<Tails>>>,
}

impl BucketArrays {
    fn new(buckets: usize) -> Self {
        Self {
            slots: (0..buckets).map(|_| RwLock::new(None)).collect(),
        }
    }

    fn get(&self, bucket: usize) -> Option<Tails> {
        self.slots.get(bucket)?.read().clone()
    }

    /// Installs `update` if the slot still holds exactly `expected`.
    fn compare_and_set(&self, bucket: usize, expected: Option<&Tails>, update: Option<Tails>) -> bool {
        let Some(slot) = self.slots.get(bucket) else {
            return false;
        };
        let mut slot = slot.write();
        let same = match (slot.as_ref(), expected) {
            (None, None) => true,
            (Some(cur), Some(exp)) => Arc::ptr_eq(cur, exp),
            _ => false,
        };
        if same {
            *slot = update;
        }
        same
    }
}

pub struct PagesList {
    name: String,
    structure: DataStructure,
    buckets: BucketArrays,
    bucket_count: usize,
    cnts: Vec<AtomicI32>,
    reuse_bucket: Option<usize>,
    meta_page_id: PageId,
}

impl PagesList {
    /// Creates the list over `meta_page_id`. With `init_new` the meta page is
    /// formatted; otherwise the stripes saved in the meta chain are loaded.
    pub fn new(
        name: impl Into<String>,
        structure: DataStructure,
        buckets: usize,
        reuse_bucket: Option<usize>,
        meta_page_id: PageId,
        init_new: bool,
    ) -> Result<Self> {
        ensure!(
            buckets > 0 && buckets <= MAX_BUCKETS,
            "Buckets count must be in 1..={}, got {}",
            MAX_BUCKETS,
            buckets
        );
        if let Some(bucket) = reuse_bucket {
            ensure!(bucket < buckets, "Reuse bucket {} out of range", bucket);
        }

        let list = Self {
            name: name.into(),
            structure,
            buckets: BucketArrays::new(buckets),
            bucket_count: buckets,
            cnts: (0..MAX_BUCKETS).map(|_| AtomicI32::new(0)).collect(),
            reuse_bucket,
            meta_page_id,
        };

        if init_new {
            list.init_meta_page(meta_page_id)?;
        } else {
            list.load_metadata()
                .with_context(|| format!("Failed to load pages list {}", list.name))?;
        }
        Ok(list)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn structure(&self) -> &DataStructure {
        &self.structure
    }

    pub fn meta_page_id(&self) -> PageId {
        self.meta_page_id
    }

    pub fn buckets(&self) -> usize {
        self.bucket_count
    }

    pub fn is_reuse_bucket(&self, bucket: usize) -> bool {
        self.reuse_bucket == Some(bucket)
    }

    /// Approximate number of page ids in a bucket.
    pub fn bucket_size(&self, bucket: usize) -> usize {
        self.cnts
            .get(bucket)
            .map_or(0, |cnt| cnt.load(Ordering::SeqCst).max(0) as usize)
    }

    fn check_bucket(&self, bucket: usize) -> Result<()> {
        ensure!(
            bucket < self.bucket_count,
            "Pages list {}: bucket {} out of range, {} buckets",
            self.name,
            bucket,
            self.bucket_count
        );
        Ok(())
    }

    fn init_meta_page(&self, page_id: PageId) -> Result<()> {
        let mut page = self.structure.mem().write(page_id)?;
        PagesListMetaIo.init_new_page(&mut page, page_id);
        self.structure.log(&page, || DeltaRecord::PagesListMetaInit {
            page_id,
            next_meta_page_id: PageId::NONE,
        })
    }

    fn load_metadata(&self) -> Result<()> {
        let io = PagesListMetaIo;
        let mut bucket_tails: Vec<Vec<PageId>> = vec![Vec::new(); self.bucket_count];

        let mut next_id = self.meta_page_id;
        while !next_id.is_none() {
            let page = self.structure.mem().read(next_id)?;
            PageIo::expect(&page, T_PAGE_LIST_META)?;
            for (bucket, tail_id) in io.bucket_tails(&page) {
                ensure!(
                    bucket < self.bucket_count,
                    "Meta page {} references bucket {} of {}",
                    next_id,
                    bucket,
                    self.bucket_count
                );
                bucket_tails[bucket].push(tail_id);
            }
            next_id = io.next_meta_page_id(&page);
        }

        for (bucket, tails) in bucket_tails.into_iter().enumerate() {
            if tails.is_empty() {
                continue;
            }
            let mut arr = Vec::with_capacity(tails.len() * 2);
            let mut stored = 0usize;
            for tail_id in tails {
                let (head_id, cnt) = self.walk_stripe(tail_id)?;
                arr.push(tail_id);
                arr.push(head_id);
                stored += cnt;
            }
            let installed = self.buckets.compare_and_set(bucket, None, Some(arr.into()));
            ensure!(installed, "Bucket {} loaded twice", bucket);
            self.cnts[bucket].store(stored as i32, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Follows `previous` links from a tail. Returns the stripe head and the
    /// number of ids stored in the stripe.
    fn walk_stripe(&self, tail_id: PageId) -> Result<(PageId, usize)> {
        let io = PagesListNodeIo;
        let mut cur = tail_id;
        let mut cnt = 0;
        loop {
            let page = self.structure.mem().read(cur)?;
            ensure!(
                check_page_id(cur, &page),
                "Stripe node {} was recycled",
                cur
            );
            PageIo::expect(&page, T_PAGE_LIST_NODE)?;
            cnt += io.count(&page);
            let prev = io.previous_id(&page);
            if prev.is_none() {
                return Ok((cur, cnt));
            }
            cur = prev;
        }
    }

    /// Writes the tails of every bucket into the meta page chain, growing
    /// the chain when needed.
    pub fn save_metadata(&self) -> Result<()> {
        let io = PagesListMetaIo;

        let mut pending: Vec<(usize, Vec<PageId>)> = (0..self.bucket_count)
            .filter_map(|bucket| {
                self.buckets
                    .get(bucket)
                    .map(|tails| (bucket, tails.iter().step_by(2).copied().collect()))
            })
            .collect();
        pending.reverse();

        let mut cur_id = self.meta_page_id;
        let mut current: Option<(usize, Vec<PageId>, usize)> = None;
        let mut saved = 0usize;

        while !cur_id.is_none() {
            let mut page = self.structure.mem().write(cur_id)?;
            PageIo::expect(&page, T_PAGE_LIST_META)?;
            io.reset_count(&mut page);

            loop {
                if current.is_none() {
                    current = pending.pop().map(|(bucket, tails)| (bucket, tails, 0));
                }
                let Some((bucket, tails, from)) = current.as_mut() else {
                    break;
                };
                let written = io.add_tails(&mut page, *bucket, tails, *from);
                *from += written;
                saved += written;
                if *from == tails.len() {
                    current = None;
                } else {
                    break;
                }
            }

            let mut next_id = io.next_meta_page_id(&page);
            if next_id.is_none() && (current.is_some() || !pending.is_empty()) {
                next_id = self.structure.allocate_page(None)?;
                self.init_meta_page(next_id)?;
                io.set_next_meta_page_id(&mut page, next_id);
                debug!("Pages list {}: extended meta chain with {}", self.name, next_id);
            }
            cur_id = next_id;
        }

        trace!("Pages list {}: saved {} stripe tails", self.name, saved);
        Ok(())
    }

    fn page_for_put(&self, bucket: usize) -> Result<PageId> {
        match self.buckets.get(bucket) {
            Some(tails) => Ok(random_tail(&tails)),
            None => self.add_stripe(bucket),
        }
    }

    fn add_stripe(&self, bucket: usize) -> Result<PageId> {
        let page_id = self.allocate_node_page()?;
        handler::init_page(self.structure.mem(), self.structure.wal(), page_id, &PagesListNodeIo)?;

        loop {
            let old = self.buckets.get(bucket);
            let mut upd = old.as_deref().map(<[PageId]>::to_vec).unwrap_or_default();
            upd.push(page_id);
            upd.push(page_id);
            if self.buckets.compare_and_set(bucket, old.as_ref(), Some(upd.into())) {
                debug!("Pages list {}: added stripe {} to bucket {}", self.name, page_id, bucket);
                return Ok(page_id);
            }
        }
    }

    /// Replaces `old_tail` (or a stripe head) with `new_tail` in the bucket's
    /// tails array. A null `new_tail` drops the single-node stripe `old_tail`.
    fn update_tail(&self, bucket: usize, old_tail: PageId, new_tail: PageId) -> Result<()> {
        loop {
            let tails = self
                .buckets
                .get(bucket)
                .ok_or_else(|| anyhow!("Bucket {} of {} has no stripes", bucket, self.name))?;
            let idx = find_tail_index(&tails, old_tail)
                .ok_or_else(|| anyhow!("Tail {} not found in bucket {}", old_tail, bucket))?;

            let upd: Option<Tails> = if new_tail.is_none() {
                ensure!(
                    tails[idx + 1] == old_tail,
                    "Dropping stripe {} which has more than one node",
                    old_tail
                );
                if tails.len() == 2 {
                    None
                } else {
                    let mut arr = tails.to_vec();
                    arr.drain(idx..idx + 2);
                    Some(arr.into())
                }
            } else {
                let mut arr = tails.to_vec();
                arr[idx] = new_tail;
                Some(arr.into())
            };

            if self.buckets.compare_and_set(bucket, Some(&tails), upd) {
                if new_tail.is_none() {
                    debug!("Pages list {}: dropped stripe {} from bucket {}", self.name, old_tail, bucket);
                }
                return Ok(());
            }
        }
    }

    /// Node pages come from the reuse list, never from the list's own
    /// buckets.
    fn allocate_node_page(&self) -> Result<PageId> {
        self.structure.allocate_page(None)
    }

    fn check_node(page_id: PageId, buf: &[u8]) -> bool {
        check_page_id(page_id, buf) && page_io::page_type(buf) == T_PAGE_LIST_NODE
    }

    fn inc(&self, bucket: usize) {
        self.cnts[bucket].fetch_add(1, Ordering::SeqCst);
    }

    fn dec(&self, bucket: usize) {
        self.cnts[bucket].fetch_sub(1, Ordering::SeqCst);
    }

    /// Links a fresh node after `prev`.
    fn setup_next_page(
        prev_id: PageId,
        prev: &mut [u8],
        next_id: PageId,
        next: &mut [u8],
    ) {
        let io = PagesListNodeIo;
        io.init_new_page(next, next_id);
        io.set_previous_id(next, prev_id);
        io.set_next_id(prev, next_id);
    }

    /// Puts the data page the caller holds latched into `bucket`.
    pub fn put_data_page(&self, data_page: &mut PageWriteGuard, bucket: usize) -> Result<()> {
        self.check_bucket(bucket)?;
        PageIo::expect(data_page, T_DATA)?;
        loop {
            let tail_id = self.page_for_put(bucket)?;
            let mut tail = self.structure.mem().write(tail_id)?;
            if !Self::check_node(tail_id, &tail) {
                continue;
            }
            if self.put_data_page_locked(tail_id, &mut tail, data_page, bucket)? {
                return Ok(());
            }
        }
    }

    fn put_data_page_locked(
        &self,
        page_id: PageId,
        page: &mut PageWriteGuard,
        data_page: &mut PageWriteGuard,
        bucket: usize,
    ) -> Result<bool> {
        let io = PagesListNodeIo;
        // Not a tail anymore.
        if !io.next_id(page).is_none() {
            return Ok(false);
        }

        let data_page_id = page_io::page_id(data_page);
        if io.add_page(page, data_page_id).is_some() {
            self.structure.log(page, || DeltaRecord::PagesListAddPage {
                page_id,
                data_page_id,
            })?;
            self.set_free_list_page_id(data_page, page_id)?;
            self.inc(bucket);
            return Ok(true);
        }

        if self.is_reuse_bucket(bucket) {
            // The empty data page itself becomes the next node.
            let next_id = data_page_id.change_type(FLAG_IDX);
            Self::setup_next_page(page_id, page, next_id, data_page);
            self.log_new_node(page_id, page, next_id, data_page, PageId::NONE)?;
            self.update_tail(bucket, page_id, next_id)?;
        } else {
            let next_id = self.allocate_node_page()?;
            let mut next = self.structure.mem().write(next_id)?;
            Self::setup_next_page(page_id, page, next_id, &mut next);
            self.log_new_node(page_id, page, next_id, &next, data_page_id)?;

            if io.add_page(&mut next, data_page_id).is_none() {
                bail!("Fresh node {} cannot hold a page id", next_id);
            }
            self.set_free_list_page_id(data_page, next_id)?;
            self.update_tail(bucket, page_id, next_id)?;
            self.inc(bucket);
        }
        Ok(true)
    }

    fn log_new_node(
        &self,
        prev_id: PageId,
        prev: &PageWriteGuard,
        next_id: PageId,
        next: &PageWriteGuard,
        added_page_id: PageId,
    ) -> Result<()> {
        self.structure.log(prev, || DeltaRecord::PagesListSetNext {
            page_id: prev_id,
            next_page_id: next_id,
        })?;
        self.structure.log(next, || DeltaRecord::PagesListInitNewPage {
            page_id: next_id,
            previous_page_id: prev_id,
            added_page_id,
        })
    }

    fn set_free_list_page_id(&self, data_page: &mut PageWriteGuard, node_id: PageId) -> Result<()> {
        DataPageIo.set_free_list_page_id(data_page, node_id);
        let page_id = page_io::page_id(data_page);
        self.structure.log(data_page, || DeltaRecord::DataPageSetFreeListPage {
            page_id,
            free_list_page_id: node_id,
        })
    }

    /// Moves every page of the bag into `bucket`. Pages that do not fit in
    /// the tail become new nodes of the stripe.
    pub fn put_bag(&self, bag: &mut dyn ReuseBag, bucket: usize) -> Result<()> {
        self.check_bucket(bucket)?;
        if bag.is_empty() {
            return Ok(());
        }
        loop {
            let tail_id = self.page_for_put(bucket)?;
            let mut tail = self.structure.mem().write(tail_id)?;
            if !Self::check_node(tail_id, &tail) {
                continue;
            }
            if self.put_reuse_bag(tail_id, &mut tail, bag, bucket)? {
                return Ok(());
            }
        }
    }

    fn put_reuse_bag(
        &self,
        page_id: PageId,
        page: &mut PageWriteGuard,
        bag: &mut dyn ReuseBag,
        bucket: usize,
    ) -> Result<bool> {
        if !PagesListNodeIo.next_id(page).is_none() {
            return Ok(false);
        }

        let mut locked: Vec<PageWriteGuard> = Vec::new();
        let mut prev_id = page_id;
        let res = self.fill_from_bag(page, bag, bucket, &mut locked, &mut prev_id);

        // New nodes are linked already; publish them even if the fill failed.
        if !locked.is_empty() {
            self.update_tail(bucket, page_id, prev_id)?;
        }
        drop(locked);
        res.map(|_| true)
    }

    fn fill_from_bag(
        &self,
        page: &mut PageWriteGuard,
        bag: &mut dyn ReuseBag,
        bucket: usize,
        locked: &mut Vec<PageWriteGuard>,
        prev_id: &mut PageId,
    ) -> Result<()> {
        let io = PagesListNodeIo;
        while let Some(next_id) = bag.poll_free_page() {
            let cur = match locked.last_mut() {
                Some(node) => node,
                None => &mut *page,
            };
            if io.add_page(cur, next_id).is_some() {
                let cur_id = *prev_id;
                self.structure.log(cur, || DeltaRecord::PagesListAddPage {
                    page_id: cur_id,
                    data_page_id: next_id,
                })?;
                self.inc(bucket);
                continue;
            }

            let mut next = self.structure.mem().write(next_id)?;
            Self::setup_next_page(*prev_id, cur, next_id, &mut next);
            self.log_new_node(*prev_id, cur, next_id, &next, PageId::NONE)?;
            locked.push(next);
            *prev_id = next_id;
        }
        Ok(())
    }

    /// Removes and returns some page from `bucket`. When the bucket tail is
    /// empty the tail node itself is handed out, formatted with `init` if
    /// given.
    pub fn take_empty_page(&self, bucket: usize, init: Option<&dyn PageInit>) -> Result<Option<PageId>> {
        self.check_bucket(bucket)?;
        let io = PagesListNodeIo;
        loop {
            if self.cnts[bucket].load(Ordering::SeqCst) <= 0 {
                return Ok(None);
            }
            let Some(tails) = self.buckets.get(bucket) else {
                return Ok(None);
            };
            let tail_id = random_tail(&tails);

            let mut tail = self.structure.mem().write(tail_id)?;
            if !Self::check_node(tail_id, &tail) || !io.next_id(&tail).is_none() {
                continue;
            }

            if let Some(page_id) = io.take_any_page(&mut tail) {
                self.structure.log(&tail, || DeltaRecord::PagesListRemovePage {
                    page_id: tail_id,
                    removed_page_id: page_id,
                })?;
                self.dec(bucket);
                return Ok(Some(page_id));
            }

            // An empty tail with a predecessor can be handed out itself.
            let prev_id = io.previous_id(&tail);
            if prev_id.is_none() {
                return Ok(None);
            }
            self.structure.log(&tail, || DeltaRecord::PagesListRemoveLastPage { page_id: tail_id })?;
            self.cut_tail(prev_id, bucket)?;

            let page_id = tail_id.rotate();
            match init {
                Some(init) => {
                    handler::init_page_locked(self.structure.wal(), &mut tail, page_id, init)?;
                }
                None => {
                    handler::recycle_page(self.structure.wal(), tail_id, &mut tail)?;
                }
            }
            trace!("Pages list {}: took tail node {} as {}", self.name, tail_id, page_id);
            return Ok(Some(page_id));
        }
    }

    /// Makes `prev_id` the tail of its stripe.
    fn cut_tail(&self, prev_id: PageId, bucket: usize) -> Result<()> {
        let io = PagesListNodeIo;
        let mut prev = self.structure.mem().write(prev_id)?;
        ensure!(
            Self::check_node(prev_id, &prev),
            "Previous node {} was recycled",
            prev_id
        );
        let tail_id = io.next_id(&prev);
        ensure!(!tail_id.is_none(), "Node {} has no next node to cut", prev_id);

        io.set_next_id(&mut prev, PageId::NONE);
        self.structure.log(&prev, || DeltaRecord::PagesListSetNext {
            page_id: prev_id,
            next_page_id: PageId::NONE,
        })?;
        self.update_tail(bucket, tail_id, prev_id)
    }

    /// Removes the data page the caller holds latched from `bucket`.
    /// Returns `false` if the node the data page points at no longer holds
    /// it.
    pub fn remove_data_page(&self, data_page: &mut PageWriteGuard, bucket: usize) -> Result<bool> {
        self.check_bucket(bucket)?;
        let io = PagesListNodeIo;
        let data_page_id = page_io::page_id(data_page);
        let page_id = DataPageIo.free_list_page_id(data_page);
        ensure!(
            !page_id.is_none(),
            "Data page {} is not in a free list",
            data_page_id
        );

        let (next_id, mut recycle_id) = {
            let mut page = self.structure.mem().write(page_id)?;
            if !check_page_id(page_id, &page) {
                return Ok(false);
            }
            if !io.remove_page(&mut page, data_page_id) {
                return Ok(false);
            }
            self.structure.log(&page, || DeltaRecord::PagesListRemovePage {
                page_id,
                removed_page_id: data_page_id,
            })?;
            self.dec(bucket);
            self.set_free_list_page_id(data_page, PageId::NONE)?;

            if !io.is_empty(&page) {
                return Ok(true);
            }

            let next_id = io.next_id(&page);
            let recycle_id = if next_id.is_none() {
                let prev_id = io.previous_id(&page);
                self.merge_no_next(page_id, &mut page, prev_id, bucket)?
            } else {
                None
            };
            (next_id, recycle_id)
        };

        if !next_id.is_none() {
            recycle_id = self.merge(page_id, next_id, bucket)?;
        }
        if let Some(recycle_id) = recycle_id {
            self.recycle(recycle_id)?;
        }
        Ok(true)
    }

    /// Drops the empty tail `page_id` from its stripe.
    fn merge_no_next(
        &self,
        page_id: PageId,
        page: &mut PageWriteGuard,
        prev_id: PageId,
        bucket: usize,
    ) -> Result<Option<PageId>> {
        // Reuse stripes keep their empty tails.
        if self.is_reuse_bucket(bucket) {
            return Ok(None);
        }
        if prev_id.is_none() {
            self.update_tail(bucket, page_id, PageId::NONE)?;
        } else {
            self.cut_tail(prev_id, bucket)?;
        }
        Ok(Some(handler::recycle_page(self.structure.wal(), page_id, page)?))
    }

    /// Unlinks the empty node `page_id` whose successor was `next_id`.
    fn merge(&self, page_id: PageId, mut next_id: PageId, bucket: usize) -> Result<Option<PageId>> {
        let io = PagesListNodeIo;
        loop {
            let mut next = if next_id.is_none() {
                None
            } else {
                Some(self.structure.mem().write(next_id)?)
            };
            let mut page = self.structure.mem().write(page_id)?;

            if !check_page_id(page_id, &page) || !io.is_empty(&page) {
                return Ok(None);
            }
            if io.next_id(&page) == next_id {
                return self.do_merge(page_id, &mut page, next_id, next.as_mut(), bucket);
            }
            // The successor changed under us.
            next_id = io.next_id(&page);
        }
    }

    fn do_merge(
        &self,
        page_id: PageId,
        page: &mut PageWriteGuard,
        next_id: PageId,
        next: Option<&mut PageWriteGuard>,
        bucket: usize,
    ) -> Result<Option<PageId>> {
        let io = PagesListNodeIo;
        let prev_id = io.previous_id(page);

        let Some(next) = next else {
            return self.merge_no_next(page_id, page, prev_id, bucket);
        };

        if prev_id.is_none() {
            // Stripe head: its successor becomes the new head.
            io.set_previous_id(next, PageId::NONE);
            self.structure.log(next, || DeltaRecord::PagesListSetPrevious {
                page_id: next_id,
                previous_page_id: PageId::NONE,
            })?;
            self.update_tail(bucket, page_id, next_id)?;
        } else {
            self.fair_merge(prev_id, page_id, next_id, next)?;
        }

        debug!("Pages list {}: merged out empty node {}", self.name, page_id);
        Ok(Some(handler::recycle_page(self.structure.wal(), page_id, page)?))
    }

    /// Links `prev_id` and `next_id` around the node being removed.
    fn fair_merge(
        &self,
        prev_id: PageId,
        page_id: PageId,
        next_id: PageId,
        next: &mut PageWriteGuard,
    ) -> Result<()> {
        let io = PagesListNodeIo;
        let mut prev = self.structure.mem().write(prev_id)?;
        ensure!(
            Self::check_node(prev_id, &prev) && io.next_id(&prev) == page_id,
            "Node {} is no longer linked before {}",
            prev_id,
            page_id
        );

        io.set_next_id(&mut prev, next_id);
        self.structure.log(&prev, || DeltaRecord::PagesListSetNext {
            page_id: prev_id,
            next_page_id: next_id,
        })?;
        io.set_previous_id(next, prev_id);
        self.structure.log(next, || DeltaRecord::PagesListSetPrevious {
            page_id: next_id,
            previous_page_id: prev_id,
        })
    }

    /// Hands a freed node page to whoever reuses pages for this list.
    fn recycle(&self, page_id: PageId) -> Result<()> {
        let mut bag = SingletonBag::new(page_id);
        if let Some(reuse_list) = self.structure.reuse_list() {
            reuse_list.add_for_recycle(&mut bag)
        } else if let Some(bucket) = self.reuse_bucket {
            self.put_bag(&mut bag, bucket)
        } else {
            warn!("Pages list {}: no reuse list, page {} is lost", self.name, page_id);
            Ok(())
        }
    }

    /// Number of page ids stored in all stripes of `bucket`.
    pub fn stored_pages_count(&self, bucket: usize) -> Result<usize> {
        self.check_bucket(bucket)?;
        let Some(tails) = self.buckets.get(bucket) else {
            return Ok(0);
        };
        let mut res = 0;
        for tail_id in tails.iter().step_by(2) {
            let (_, cnt) = self.walk_stripe(*tail_id)?;
            res += cnt;
        }
        Ok(res)
    }

    /// Number of stripes in `bucket`.
    pub fn stripes(&self, bucket: usize) -> usize {
        self.buckets.get(bucket).map_or(0, |tails| tails.len() / 2)
    }
}

fn random_tail(tails: &[PageId]) -> PageId {
    let idx = rand::thread_rng().gen_range(0..tails.len() / 2) * 2;
    tails[idx]
}

/// Stripe heads are looked up here too, so every slot is searched.
fn find_tail_index(tails: &[PageId], page_id: PageId) -> Option<usize> {
    tails.iter().position(|t| *t == page_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::structure::LongListBag;
    use crate::storage::memory::{PageMemory, PageMemoryConfig};
    use crate::storage::page::FLAG_DATA;
    use crate::storage::wal::MemoryWal;
    use std::collections::HashMap;

    fn structure(page_size: usize) -> Result<DataStructure> {
        let mem = PageMemory::new(PageMemoryConfig {
            page_size,
            partition: 0,
        })?;
        Ok(DataStructure::new(mem, None, None))
    }

    fn data_page(structure: &DataStructure) -> Result<PageId> {
        let id = structure.mem().allocate_page(FLAG_DATA)?;
        handler::init_page(structure.mem(), None, id, &DataPageIo)?;
        Ok(id)
    }

    fn new_list(structure: &DataStructure, buckets: usize, reuse: Option<usize>) -> Result<PagesList> {
        let meta = structure.allocate_page(None)?;
        PagesList::new("test", structure.clone(), buckets, reuse, meta, true)
    }

    #[test]
    fn test_put_and_remove_data_page() -> Result<()> {
        let structure = structure(256)?;
        let list = new_list(&structure, 4, None)?;
        let id = data_page(&structure)?;

        {
            let mut page = structure.mem().write(id)?;
            list.put_data_page(&mut page, 2)?;
            assert!(!DataPageIo.free_list_page_id(&page).is_none());
        }
        assert_eq!(list.bucket_size(2), 1);
        assert_eq!(list.stored_pages_count(2)?, 1);
        assert_eq!(list.stripes(2), 1);

        let mut page = structure.mem().write(id)?;
        assert!(list.remove_data_page(&mut page, 2)?);
        assert!(DataPageIo.free_list_page_id(&page).is_none());
        assert_eq!(list.bucket_size(2), 0);
        // The emptied single-node stripe is gone.
        assert_eq!(list.stripes(2), 0);
        Ok(())
    }

    #[test]
    fn test_bucket_out_of_range() -> Result<()> {
        let structure = structure(256)?;
        let list = new_list(&structure, 2, None)?;
        let id = data_page(&structure)?;
        let mut page = structure.mem().write(id)?;

        assert!(list.put_data_page(&mut page, 2).is_err());
        assert!(list.take_empty_page(5, None).is_err());
        assert!(list.stored_pages_count(2).is_err());
        assert_eq!(list.bucket_size(2), 0);
        assert_eq!(list.stripes(2), 0);

        list.put_data_page(&mut page, 1)?;
        assert!(list.remove_data_page(&mut page, 7).is_err());
        assert!(list.remove_data_page(&mut page, 1)?);
        Ok(())
    }

    #[test]
    fn test_concurrent_puts_and_removes_across_buckets() -> Result<()> {
        let structure = structure(128)?;
        let buckets = 3;
        let list = new_list(&structure, buckets, None)?;
        let threads = 4;
        let per_thread = 120;

        let live: Vec<HashMap<PageId, usize>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|t| {
                    let (structure, list) = (&structure, &list);
                    s.spawn(move || -> Result<HashMap<PageId, usize>> {
                        let ids = (0..per_thread)
                            .map(|_| data_page(structure))
                            .collect::<Result<Vec<_>>>()?;
                        let mut live = HashMap::new();
                        for round in 0..4 {
                            for (i, id) in ids.iter().enumerate() {
                                let mut page = structure.mem().write(*id)?;
                                if let Some(bucket) = live.remove(id) {
                                    assert!(list.remove_data_page(&mut page, bucket)?);
                                }
                                if (i + round + t) % 3 != 0 {
                                    let bucket = (i + round) % buckets;
                                    list.put_data_page(&mut page, bucket)?;
                                    live.insert(*id, bucket);
                                }
                            }
                        }
                        Ok(live)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("worker panicked"))
                .collect::<Result<Vec<_>>>()
        })?;

        let mut total = 0;
        for bucket in 0..buckets {
            let expected = live
                .iter()
                .flat_map(|pages| pages.values())
                .filter(|b| **b == bucket)
                .count();
            assert_eq!(list.stored_pages_count(bucket)?, expected, "bucket {}", bucket);
            assert_eq!(list.bucket_size(bucket), expected, "bucket {}", bucket);
            total += expected;
        }
        assert_eq!(total, live.iter().map(HashMap::len).sum::<usize>());
        Ok(())
    }

    #[test]
    fn test_stripe_grows_and_shrinks() -> Result<()> {
        let structure = structure(128)?;
        let list = new_list(&structure, 1, None)?;
        let cap = PagesListNodeIo.capacity(128);

        let mut ids = Vec::new();
        for _ in 0..cap * 3 {
            let id = data_page(&structure)?;
            let mut page = structure.mem().write(id)?;
            list.put_data_page(&mut page, 0)?;
            ids.push(id);
        }
        assert_eq!(list.stored_pages_count(0)?, cap * 3);

        for id in &ids {
            let mut page = structure.mem().write(*id)?;
            assert!(list.remove_data_page(&mut page, 0)?);
        }
        assert_eq!(list.stored_pages_count(0)?, 0);
        assert_eq!(list.bucket_size(0), 0);
        Ok(())
    }

    #[test]
    fn test_reuse_bucket_bag_and_take() -> Result<()> {
        let structure = structure(128)?;
        let list = new_list(&structure, 1, Some(0))?;
        let cap = PagesListNodeIo.capacity(128);

        let mut bag = LongListBag::new();
        for _ in 0..cap * 2 + 3 {
            bag.add_free_page(structure.allocate_page_no_reuse()?);
        }
        let total = bag.len();
        list.put_bag(&mut bag, 0)?;
        assert!(bag.is_empty());

        // Pages that became nodes are not counted as stored ids.
        let stored = list.stored_pages_count(0)?;
        assert_eq!(stored, list.bucket_size(0));
        assert!(stored < total);

        let mut taken = 0;
        while list.take_empty_page(0, None)?.is_some() {
            taken += 1;
        }
        // Every page comes back except the stripe head which stays.
        assert_eq!(taken, total);
        Ok(())
    }

    #[test]
    fn test_take_empty_page_from_empty_list() -> Result<()> {
        let structure = structure(256)?;
        let list = new_list(&structure, 2, Some(1))?;
        assert_eq!(list.take_empty_page(0, None)?, None);
        assert_eq!(list.take_empty_page(1, Some(&PagesListNodeIo))?, None);
        Ok(())
    }

    #[test]
    fn test_save_and_load_metadata() -> Result<()> {
        let structure = structure(128)?;
        let list = new_list(&structure, 3, None)?;
        let cap = PagesListNodeIo.capacity(128);

        for i in 0..cap + 2 {
            let id = data_page(&structure)?;
            let mut page = structure.mem().write(id)?;
            list.put_data_page(&mut page, i % 3)?;
        }
        list.save_metadata()?;

        let loaded = PagesList::new("test", structure.clone(), 3, None, list.meta_page_id(), false)?;
        for bucket in 0..3 {
            assert_eq!(loaded.stripes(bucket), list.stripes(bucket));
            assert_eq!(loaded.bucket_size(bucket), list.bucket_size(bucket));
            assert_eq!(loaded.stored_pages_count(bucket)?, list.stored_pages_count(bucket)?);
        }
        Ok(())
    }

    #[test]
    fn test_meta_chain_grows() -> Result<()> {
        let structure = structure(128)?;
        let list = new_list(&structure, 40, None)?;
        let per_meta = PagesListMetaIo.capacity(128);
        assert!(per_meta < 40);

        for bucket in 0..40 {
            let id = data_page(&structure)?;
            let mut page = structure.mem().write(id)?;
            list.put_data_page(&mut page, bucket)?;
        }
        list.save_metadata()?;

        let meta = structure.mem().read(list.meta_page_id())?;
        assert!(!PagesListMetaIo.next_meta_page_id(&meta).is_none());
        drop(meta);

        let loaded = PagesList::new("test", structure.clone(), 40, None, list.meta_page_id(), false)?;
        for bucket in 0..40 {
            assert_eq!(loaded.bucket_size(bucket), 1);
        }
        Ok(())
    }

    #[test]
    fn test_records_logged_after_checkpoint() -> Result<()> {
        let mem = PageMemory::new(PageMemoryConfig {
            page_size: 256,
            partition: 0,
        })?;
        let wal = Arc::new(MemoryWal::new());
        let structure = DataStructure::new(mem.clone(), Some(wal.clone()), None);
        let list = new_list(&structure, 1, None)?;

        let first = data_page(&structure)?;
        {
            let mut page = mem.write(first)?;
            list.put_data_page(&mut page, 0)?;
        }
        mem.checkpoint()?;
        let before = wal.len();

        let second = data_page(&structure)?;
        {
            let mut page = mem.write(second)?;
            list.put_data_page(&mut page, 0)?;
        }
        {
            let mut page = mem.write(second)?;
            list.remove_data_page(&mut page, 0)?;
        }
        let records: Vec<DeltaRecord> = wal.records().into_iter().skip(before).map(|r| r.record).collect();
        assert!(records
            .iter()
            .any(|r| matches!(r, DeltaRecord::PagesListRemovePage { removed_page_id, .. } if *removed_page_id == second)));
        Ok(())
    }

    #[test]
    fn test_invalid_bucket_count() -> Result<()> {
        let structure = structure(256)?;
        let meta = structure.allocate_page(None)?;
        assert!(PagesList::new("bad", structure.clone(), 0, None, meta, true).is_err());
        assert!(PagesList::new("bad", structure.clone(), MAX_BUCKETS + 1, None, meta, true).is_err());
        assert!(PagesList::new("bad", structure, 2, Some(2), meta, true).is_err());
        Ok(())
    }
}
