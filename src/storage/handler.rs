//! Latched page access shared by the free lists and the tree.
//!
//! A handler runs against a page that is already latched, checks that the
//! buffer still holds the page it expects, mutates it and logs what it did.
//! Nothing here retries; callers decide what a failed check means.

use anyhow::Result;

use crate::storage::memory::{PageMemory, PageReadGuard, PageWriteGuard};
use crate::storage::page::{page_io, PageId, PageInit};
use crate::storage::wal::{DeltaRecord, WalSink};

/// Runs `f` under the shared latch of `page_id`.
pub fn read_page<R>(
    mem: &PageMemory,
    page_id: PageId,
    f: impl FnOnce(&PageReadGuard) -> Result<R>,
) -> Result<R> {
    let page = mem.read(page_id)?;
    f(&page)
}

/// Runs `f` under the exclusive latch of `page_id`.
pub fn write_page<R>(
    mem: &PageMemory,
    page_id: PageId,
    f: impl FnOnce(&mut PageWriteGuard) -> Result<R>,
) -> Result<R> {
    let mut page = mem.write(page_id)?;
    f(&mut page)
}

/// Formats a freshly allocated page under its exclusive latch.
pub fn init_page(
    mem: &PageMemory,
    wal: Option<&dyn WalSink>,
    page_id: PageId,
    init: &dyn PageInit,
) -> Result<()> {
    let mut page = mem.write(page_id)?;
    init_page_locked(wal, &mut page, page_id, init)
}

/// Formats a page the caller already holds.
pub fn init_page_locked(
    wal: Option<&dyn WalSink>,
    page: &mut PageWriteGuard,
    page_id: PageId,
    init: &dyn PageInit,
) -> Result<()> {
    init.init_new_page(page, page_id);
    log_delta(wal, page, || {
        let io = init.page_io();
        DeltaRecord::InitNewPage {
            page_id: page.page_id(),
            page_type: io.page_type,
            version: io.version,
            new_page_id: page_id,
        }
    })
}

/// Whether a mutation of `page` must be described by a delta record.
///
/// Pages touched for the first time in a checkpoint period are covered by a
/// full page image instead, unless the page was explicitly marked as never
/// having one (fresh split halves and roots).
pub fn is_wal_delta_record_needed(wal: Option<&dyn WalSink>, page: &PageWriteGuard) -> bool {
    let Some(wal) = wal else {
        return false;
    };
    if wal.always_write_full_pages() {
        return false;
    }
    match page.full_page_wal_policy() {
        Some(true) => false,
        Some(false) => true,
        None => page.is_dirty(),
    }
}

/// Logs the record built by `record` if the page needs a delta.
pub fn log_delta(
    wal: Option<&dyn WalSink>,
    page: &PageWriteGuard,
    record: impl FnOnce() -> DeltaRecord,
) -> Result<()> {
    if let Some(sink) = wal {
        if is_wal_delta_record_needed(wal, page) {
            sink.log(record())?;
        }
    }
    Ok(())
}

/// Rotates the id stored in the page so stale references stop matching it.
/// Returns the new id.
pub fn recycle_page(
    wal: Option<&dyn WalSink>,
    page_id: PageId,
    page: &mut PageWriteGuard,
) -> Result<PageId> {
    let rotated = page_id.rotate();
    page_io::set_page_id(page, rotated);
    log_delta(wal, page, || DeltaRecord::Recycle {
        page_id: page.page_id(),
        new_page_id: rotated,
    })?;
    Ok(rotated)
}

/// ABA guard: the buffer still belongs to `page_id`.
pub fn check_page_id(page_id: PageId, buf: &[u8]) -> bool {
    page_io::page_id(buf) == page_id
}
