//! WAL record types.
//!
//! Every [`DeltaRecord`] describes one atomic mutation of one page, enough to
//! redo the change on the page image it was applied to. Rows travel as their
//! encoded item bytes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::page::PageId;

/// Log Sequence Number - a unique identifier for WAL records.
/// LSNs are monotonically increasing and used to order log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub fn next(&self) -> Self {
        Lsn(self.0 + 1)
    }

    /// Zero is never assigned to a record.
    pub fn is_invalid(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN({})", self.0)
    }
}

/// Physical page mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaRecord {
    PagesListSetNext {
        page_id: PageId,
        next_page_id: PageId,
    },
    PagesListSetPrevious {
        page_id: PageId,
        previous_page_id: PageId,
    },
    PagesListAddPage {
        page_id: PageId,
        data_page_id: PageId,
    },
    PagesListRemovePage {
        page_id: PageId,
        removed_page_id: PageId,
    },
    /// The tail node of a stripe ran out of page ids.
    PagesListRemoveLastPage { page_id: PageId },
    /// A node page was initialized and linked after `previous_page_id`.
    PagesListInitNewPage {
        page_id: PageId,
        previous_page_id: PageId,
        /// Page id stored in the new node right away, if any.
        added_page_id: PageId,
    },
    PagesListMetaInit {
        page_id: PageId,
        next_meta_page_id: PageId,
    },
    InitNewPage {
        page_id: PageId,
        page_type: u16,
        version: u16,
        new_page_id: PageId,
    },
    /// The page id stored in the page was rotated.
    Recycle {
        page_id: PageId,
        new_page_id: PageId,
    },
    Insert {
        page_id: PageId,
        idx: u16,
        item: Vec<u8>,
        right_id: PageId,
    },
    Replace {
        page_id: PageId,
        idx: u16,
        item: Vec<u8>,
    },
    Remove {
        page_id: PageId,
        idx: u16,
        count: u16,
    },
    SplitForwardPage {
        page_id: PageId,
        forward_id: PageId,
        source_page_id: PageId,
        mid: u16,
        count: u16,
    },
    SplitExistingPage {
        page_id: PageId,
        mid: u16,
        forward_id: PageId,
    },
    FixCount {
        page_id: PageId,
        count: u16,
    },
    FixLeftmostChild {
        page_id: PageId,
        right_id: PageId,
    },
    NewRootInit {
        page_id: PageId,
        new_root_id: PageId,
        left_id: PageId,
        item: Vec<u8>,
        right_id: PageId,
    },
    MetaPageInitRoot {
        page_id: PageId,
        root_id: PageId,
    },
    MetaPageAddRoot {
        page_id: PageId,
        root_id: PageId,
    },
    MetaPageCutRoot { page_id: PageId },
    Merge {
        page_id: PageId,
        parent_id: PageId,
        parent_idx: u16,
        right_id: PageId,
        empty_branch: bool,
    },
    InnerReplace {
        page_id: PageId,
        dst_idx: u16,
        src_page_id: PageId,
        src_idx: u16,
        remove_id: u64,
    },
    FixRemoveId {
        page_id: PageId,
        remove_id: u64,
    },
    DataPageSetFreeListPage {
        page_id: PageId,
        free_list_page_id: PageId,
    },
}

impl DeltaRecord {
    /// Page this record mutates.
    pub fn page_id(&self) -> PageId {
        use DeltaRecord::*;
        match self {
            PagesListSetNext { page_id, .. }
            | PagesListSetPrevious { page_id, .. }
            | PagesListAddPage { page_id, .. }
            | PagesListRemovePage { page_id, .. }
            | PagesListRemoveLastPage { page_id }
            | PagesListInitNewPage { page_id, .. }
            | PagesListMetaInit { page_id, .. }
            | InitNewPage { page_id, .. }
            | Recycle { page_id, .. }
            | Insert { page_id, .. }
            | Replace { page_id, .. }
            | Remove { page_id, .. }
            | SplitForwardPage { page_id, .. }
            | SplitExistingPage { page_id, .. }
            | FixCount { page_id, .. }
            | FixLeftmostChild { page_id, .. }
            | NewRootInit { page_id, .. }
            | MetaPageInitRoot { page_id, .. }
            | MetaPageAddRoot { page_id, .. }
            | MetaPageCutRoot { page_id }
            | Merge { page_id, .. }
            | InnerReplace { page_id, .. }
            | FixRemoveId { page_id, .. }
            | DataPageSetFreeListPage { page_id, .. } => *page_id,
        }
    }
}

/// A delta record with the LSN it was assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    pub lsn: Lsn,
    pub record: DeltaRecord,
}

impl WalRecord {
    pub fn new(lsn: Lsn, record: DeltaRecord) -> Self {
        Self { lsn, record }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_lsn() {
        let lsn = Lsn::default();
        assert!(lsn.is_invalid());

        let next = lsn.next();
        assert_eq!(next.0, 1);
        assert!(!next.is_invalid());
        assert!(lsn < next);
    }

    #[test]
    fn test_wal_record_serialization() -> Result<()> {
        let records = vec![
            WalRecord::new(
                Lsn(1),
                DeltaRecord::Insert {
                    page_id: PageId(7),
                    idx: 3,
                    item: vec![1, 2, 3, 4],
                    right_id: PageId(9),
                },
            ),
            WalRecord::new(
                Lsn(2),
                DeltaRecord::Merge {
                    page_id: PageId(7),
                    parent_id: PageId(2),
                    parent_idx: 0,
                    right_id: PageId(8),
                    empty_branch: true,
                },
            ),
            WalRecord::new(Lsn(3), DeltaRecord::MetaPageCutRoot { page_id: PageId(1) }),
        ];
        for record in records {
            let bytes = record.serialize()?;
            assert_eq!(WalRecord::deserialize(&bytes)?, record);
        }
        Ok(())
    }

    #[test]
    fn test_record_page_id() {
        let rec = DeltaRecord::PagesListAddPage {
            page_id: PageId(5),
            data_page_id: PageId(6),
        };
        assert_eq!(rec.page_id(), PageId(5));
        let rec = DeltaRecord::PagesListRemoveLastPage { page_id: PageId(4) };
        assert_eq!(rec.page_id(), PageId(4));
    }
}
