//! Write-ahead log sinks for page delta records.
//!
//! Structures never decide on their own whether a physical record is needed;
//! they ask [`is_wal_delta_record_needed`](crate::storage::handler::is_wal_delta_record_needed)
//! and hand the record to whichever [`WalSink`] they were built with.

pub mod manager;
pub mod record;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::storage::error::StorageResult;

pub use manager::{WalConfig, WalManager};
pub use record::{DeltaRecord, Lsn, WalRecord};

/// Destination for delta records. Implementations must be thread-safe.
pub trait WalSink: Send + Sync {
    /// Appends a record and returns the LSN assigned to it.
    fn log(&self, record: DeltaRecord) -> StorageResult<Lsn>;

    /// When true, the sink logs whole page images and delta records are never
    /// produced.
    fn always_write_full_pages(&self) -> bool {
        false
    }
}

/// Sink that keeps every record in memory.
#[derive(Default)]
pub struct MemoryWal {
    lsn: AtomicU64,
    records: Mutex<Vec<WalRecord>>,
    full_pages: bool,
}

impl MemoryWal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that claims to write full pages, so no deltas reach it.
    pub fn full_pages() -> Self {
        Self {
            full_pages: true,
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<WalRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WalSink for MemoryWal {
    fn log(&self, record: DeltaRecord) -> StorageResult<Lsn> {
        let mut records = self.records.lock();
        let lsn = Lsn(self.lsn.fetch_add(1, Ordering::SeqCst) + 1);
        records.push(WalRecord::new(lsn, record));
        Ok(lsn)
    }

    fn always_write_full_pages(&self) -> bool {
        self.full_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageId;
    use anyhow::Result;

    #[test]
    fn test_memory_wal_assigns_lsns() -> Result<()> {
        let wal = MemoryWal::new();
        assert!(wal.is_empty());
        let a = wal.log(DeltaRecord::MetaPageCutRoot { page_id: PageId(1) })?;
        let b = wal.log(DeltaRecord::FixCount {
            page_id: PageId(2),
            count: 3,
        })?;
        assert_eq!(a, Lsn(1));
        assert_eq!(b, Lsn(2));
        assert_eq!(wal.records()[1].record.page_id(), PageId(2));
        Ok(())
    }
}
