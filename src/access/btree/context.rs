//! Engine-wide state shared by every tree built on the same context.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Interrupt flag and remove id counter.
///
/// The remove id grows every time an inner key is replaced by a remove. Leaf
/// pages carry the id of the last such replacement on their path, and a
/// lookup that started before it restarts from the root.
#[derive(Debug, Default)]
pub struct TreeContext {
    interrupted: AtomicBool,
    remove_id: AtomicU64,
}

static GLOBAL: OnceLock<Arc<TreeContext>> = OnceLock::new();

impl TreeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide default context.
    pub fn global() -> Arc<TreeContext> {
        GLOBAL.get_or_init(|| Arc::new(TreeContext::new())).clone()
    }

    /// Makes every operation of every tree on this context fail at its next
    /// retry boundary.
    pub fn interrupt_all(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn clear_interrupt(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn remove_id(&self) -> u64 {
        self.remove_id.load(Ordering::SeqCst)
    }

    pub(crate) fn next_remove_id(&self) -> u64 {
        self.remove_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Moves the counter up to `rmv_id` if it lags behind, e.g. after a tree
    /// was reopened from pages stamped by an earlier run.
    pub fn advance_remove_id(&self, rmv_id: u64) {
        self.remove_id.fetch_max(rmv_id, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_id() {
        let ctx = TreeContext::new();
        assert_eq!(ctx.remove_id(), 0);
        assert_eq!(ctx.next_remove_id(), 1);
        ctx.advance_remove_id(10);
        assert_eq!(ctx.remove_id(), 10);
        ctx.advance_remove_id(3);
        assert_eq!(ctx.next_remove_id(), 11);
    }

    #[test]
    fn test_interrupt_flag() {
        let ctx = TreeContext::new();
        assert!(!ctx.is_interrupted());
        ctx.interrupt_all();
        assert!(ctx.is_interrupted());
        ctx.clear_interrupt();
        assert!(!ctx.is_interrupted());
    }
}
