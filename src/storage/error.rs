//! Storage layer error types.

use thiserror::Error;

use crate::storage::page::PageId;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Unknown page type {page_type} (version {version}) on page {page_id}")]
    UnknownPageType {
        page_type: u16,
        version: u16,
        page_id: PageId,
    },

    #[error("Unexpected page type on {page_id}: expected {expected}, found {found}")]
    UnexpectedPageType {
        page_id: PageId,
        expected: u16,
        found: u16,
    },

    #[error("Page not found: {0}")]
    PageNotFound(PageId),

    #[error("Buffer size must be {expected} bytes, got {actual}")]
    BufferSize { expected: usize, actual: usize },

    #[error("Page size {0} is too small for the page header")]
    PageSizeTooSmall(usize),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
