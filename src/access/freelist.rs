//! Free page tracking.
//!
//! - **PagesList**: bucketed lists of page ids kept in node pages
//! - **ReuseList**: pool of recycled pages structures allocate from
//! - **FreeList**: data pages grouped by how much room they have left

pub mod free_list;
pub mod pages_list;
pub mod reuse_list;

pub use free_list::FreeList;
pub use pages_list::{PagesList, MAX_BUCKETS};
pub use reuse_list::{ReuseList, ReuseListImpl};
