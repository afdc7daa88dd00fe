//! Storage layer: pages and everything needed to latch, persist and log them.
//!
//! - **PageId**: 64-bit page identifier with partition, flag and rotation bits
//! - **Page codecs**: byte layouts of tree, free list, meta and data pages
//! - **PageMemory**: resident page frames with read/write latches
//! - **PageManager**: flat page file backing a page memory
//! - **WAL**: delta records describing single page mutations, and their sinks
//! - **Handlers**: latched check-mutate-log helpers used by the structures

pub mod disk;
pub mod error;
pub mod handler;
pub mod memory;
pub mod page;
pub mod wal;

pub use disk::{PageManager, PAGE_SIZE};
pub use error::{StorageError, StorageResult};
pub use memory::{PageMemory, PageMemoryConfig, PageReadGuard, PageWriteGuard};
pub use page::{PageId, FLAG_DATA, FLAG_IDX};
pub use wal::{DeltaRecord, Lsn, MemoryWal, WalConfig, WalManager, WalRecord, WalSink};
