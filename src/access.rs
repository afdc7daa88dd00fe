//! Access layer: the paged structures built on top of page memory.
//!
//! - **BPlusTree**: concurrent B+Tree over fixed-size rows
//! - **PagesList / ReuseList / FreeList**: free page tracking and recycling
//! - **DataStructure**: what every structure shares (memory, WAL, reuse list)
//!
//! Structures never own pages. They latch pages through the page memory,
//! check the page id inside the buffer before trusting it, and describe each
//! mutation with a delta record.

pub mod btree;
pub mod freelist;
pub mod structure;

pub use btree::{BPlusTree, BPlusTreeConfig, TreeContext, TreeError};
pub use freelist::{FreeList, PagesList, ReuseList, ReuseListImpl};
pub use structure::{DataStructure, LongListBag, ReuseBag, SingletonBag};
