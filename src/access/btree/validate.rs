//! Structural checks and a printable dump. Both walk the tree with one read
//! latch at a time and assume no concurrent structure changes.

use anyhow::Result;
use std::cmp::Ordering;
use std::fmt::Write;

use super::{BPlusTree, RowCodec, TreeError};
use crate::storage::handler;
use crate::storage::page::{BPlusIo, BPlusMetaIo, PageId, PageKind};

fn fail(msg: String) -> anyhow::Error {
    TreeError::invariant(msg).into()
}

/// Row bounds of a subtree: `lower < row <= upper`.
struct Bounds<R> {
    lower: Option<R>,
    upper: Option<R>,
}

impl<C: RowCodec> BPlusTree<C> {
    /// Checks the whole tree: meta page levels, the sibling chain of every
    /// level, child links and key order down from the root.
    pub fn validate_tree(&self) -> Result<()> {
        self.check_destroyed()?;
        let (root_lvl, firsts) = {
            let meta = self.mem().read(self.meta_page_id)?;
            let lvl = BPlusMetaIo.root_level(&meta);
            if lvl < 0 {
                return Err(fail(format!("Tree {} has no root", self.name)));
            }
            let levels = BPlusMetaIo.levels_count(&meta);
            if levels != lvl as usize + 1 {
                return Err(fail(format!(
                    "Tree {} has {} levels with root level {}",
                    self.name, levels, lvl
                )));
            }
            let firsts: Vec<PageId> = (0..levels).map(|l| BPlusMetaIo.first_page_id(&meta, l)).collect();
            (lvl as usize, firsts)
        };

        for lvl in (0..=root_lvl).rev() {
            let below = lvl.checked_sub(1).map(|l| firsts[l]);
            self.validate_level(firsts[lvl], lvl, lvl == root_lvl, below)?;
        }

        let root = Bounds {
            lower: None,
            upper: None,
        };
        self.validate_down(firsts[root_lvl], PageId::NONE, root_lvl, &root)
    }

    /// Walks one level along forward links.
    fn validate_level(&self, first: PageId, lvl: usize, root: bool, first_below: Option<PageId>) -> Result<()> {
        let mut page_id = first;
        let mut prev_last: Option<C::Row> = None;
        let mut pages = 0;
        while !page_id.is_none() {
            let page = self.mem().read(page_id)?;
            let io = self.checked_page(page_id, &page, lvl)?;
            let cnt = io.count(&page);
            if cnt > io.max_count() {
                return Err(fail(format!("Page {} holds {} items, max {}", page_id, cnt, io.max_count())));
            }
            if cnt == 0 && lvl == 0 && !root {
                return Err(fail(format!("Empty leaf {} is not the root", page_id)));
            }
            if pages == 0 {
                if let Some(below) = first_below {
                    if io.left(&page, 0) != below {
                        return Err(fail(format!(
                            "First page {} at level {} does not lead to first page {} below",
                            page_id, lvl, below
                        )));
                    }
                }
            }
            for i in 0..cnt {
                let row = self.codec.lookup_row(io.kind(), io.item(&page, i));
                if let Some(prev) = &prev_last {
                    if self.compare_rows(io.kind(), prev, &row) != Ordering::Less {
                        return Err(fail(format!(
                            "Rows out of order at page {} idx {}: {:?} before {:?}",
                            page_id, i, prev, row
                        )));
                    }
                }
                prev_last = Some(row);
            }
            if lvl == 0 && io.remove_id(&page) > self.ctx.remove_id() {
                return Err(fail(format!(
                    "Leaf {} has remove id {} ahead of the context ({})",
                    page_id,
                    io.remove_id(&page),
                    self.ctx.remove_id()
                )));
            }
            pages += 1;
            page_id = io.forward(&page);
        }
        if root && pages != 1 {
            return Err(fail(format!("Root level {} has {} pages", lvl, pages)));
        }
        Ok(())
    }

    /// Recursive check of a subtree: every row lies in `bounds` and every
    /// child points forward to the next child.
    fn validate_down(&self, page_id: PageId, fwd_id: PageId, lvl: usize, bounds: &Bounds<C::Row>) -> Result<()> {
        let page = self.mem().read(page_id)?;
        let io = self.checked_page(page_id, &page, lvl)?;
        let cnt = io.count(&page);

        if io.forward(&page) != fwd_id {
            return Err(fail(format!(
                "Page {} at level {} points forward to {}, expected {}",
                page_id,
                lvl,
                io.forward(&page),
                fwd_id
            )));
        }

        let rows: Vec<C::Row> = (0..cnt)
            .map(|i| self.codec.lookup_row(io.kind(), io.item(&page, i)))
            .collect();
        for row in &rows {
            self.check_bounds(page_id, io.kind(), row, bounds)?;
        }
        if lvl == 0 {
            return Ok(());
        }

        // Forward of the last child is the first child of our forward page.
        let last_fwd = if fwd_id.is_none() {
            PageId::NONE
        } else {
            let fwd = self.mem().read(fwd_id)?;
            let fwd_io = self.checked_page(fwd_id, &fwd, lvl)?;
            fwd_io.left(&fwd, 0)
        };

        let children: Vec<PageId> = (0..=cnt).map(|i| io.left(&page, i)).collect();
        drop(page);

        for (i, child) in children.iter().enumerate() {
            let child_fwd = children.get(i + 1).copied().unwrap_or(last_fwd);
            let child_bounds = Bounds {
                lower: if i == 0 {
                    bounds.lower.clone()
                } else {
                    Some(rows[i - 1].clone())
                },
                upper: if i == cnt {
                    bounds.upper.clone()
                } else {
                    Some(rows[i].clone())
                },
            };
            self.validate_down(*child, child_fwd, lvl - 1, &child_bounds)?;
        }
        Ok(())
    }

    fn checked_page(&self, page_id: PageId, buf: &[u8], lvl: usize) -> Result<BPlusIo> {
        if !handler::check_page_id(page_id, buf) {
            return Err(fail(format!("Page {} holds a different page id", page_id)));
        }
        let io = self.io_for(buf)?;
        if io.is_leaf() != (lvl == 0) {
            return Err(fail(format!("Page {} has the wrong kind for level {}", page_id, lvl)));
        }
        Ok(io)
    }

    fn compare_rows(&self, kind: PageKind, a: &C::Row, b: &C::Row) -> Ordering {
        self.codec.compare(kind, &self.codec.encode(kind, a), b)
    }

    fn check_bounds(&self, page_id: PageId, kind: PageKind, row: &C::Row, bounds: &Bounds<C::Row>) -> Result<()> {
        if let Some(lower) = &bounds.lower {
            if self.compare_rows(kind, row, lower) != Ordering::Greater {
                return Err(fail(format!(
                    "Row {:?} on page {} is not above its lower bound {:?}",
                    row, page_id, lower
                )));
            }
        }
        if let Some(upper) = &bounds.upper {
            if self.compare_rows(kind, row, upper) == Ordering::Greater {
                return Err(fail(format!(
                    "Row {:?} on page {} is above its upper bound {:?}",
                    row, page_id, upper
                )));
            }
        }
        Ok(())
    }

    /// Level by level dump of the tree, root first.
    pub fn print_tree(&self) -> Result<String> {
        self.check_destroyed()?;
        let root_lvl = self.root_level()?;
        let mut out = String::new();
        let _ = writeln!(out, "{} (root level {})", self.name, root_lvl);
        for lvl in (0..=root_lvl).rev() {
            let _ = write!(out, "  L{}:", lvl);
            let mut page_id = self.first_page_id(lvl)?;
            while !page_id.is_none() {
                let page = self.mem().read(page_id)?;
                let io = self.io_for(&page)?;
                let rows: Vec<String> = (0..io.count(&page))
                    .map(|i| format!("{:?}", self.codec.lookup_row(io.kind(), io.item(&page, i))))
                    .collect();
                let _ = write!(out, " {}[{}]", page_id, rows.join(", "));
                page_id = io.forward(&page);
            }
            out.push('\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::btree::{BPlusTreeConfig, TreeContext, U64Codec};
    use crate::access::structure::DataStructure;
    use crate::storage::memory::{PageMemory, PageMemoryConfig};
    use std::sync::Arc;

    fn tree() -> Result<BPlusTree<U64Codec>> {
        let mem = PageMemory::new(PageMemoryConfig {
            page_size: 512,
            partition: 0,
        })?;
        BPlusTree::create(
            BPlusTreeConfig {
                name: "validate".to_string(),
                max_items_per_page: Some(4),
            },
            DataStructure::new(mem, None, None),
            Arc::new(TreeContext::new()),
            U64Codec,
        )
    }

    #[test]
    fn test_print_tree() -> Result<()> {
        let tree = tree()?;
        for k in 1..=5 {
            tree.put(k)?;
        }
        let dump = tree.print_tree()?;
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines[0], "validate (root level 1)");
        assert!(lines[1].starts_with("  L1:"));
        assert!(lines[1].contains("[3]"));
        assert!(lines[2].contains("[1, 2, 3]"));
        assert!(lines[2].contains("[4, 5]"));
        Ok(())
    }

    #[test]
    fn test_detects_out_of_order_rows() -> Result<()> {
        let tree = tree()?;
        for k in 1..=3 {
            tree.put(k * 10)?;
        }
        tree.validate_tree()?;

        // Overwrite the middle row behind the tree's back.
        let root_id = tree.first_page_id(0)?;
        {
            let mut page = tree.mem().write(root_id)?;
            let io = tree.io_for(&page)?;
            io.store(&mut page, 1, &5u64.to_le_bytes());
        }
        let err = tree.validate_tree().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TreeError>(),
            Some(TreeError::InvariantViolation(_))
        ));
        Ok(())
    }
}
