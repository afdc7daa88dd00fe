pub mod page_manager;

pub use page_manager::PageManager;

/// Default page size in bytes.
pub const PAGE_SIZE: usize = 8192;
