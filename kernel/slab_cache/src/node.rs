//! Per-NUMA-node lists of partially-used slabs.

use alloc::{sync::Arc, vec::Vec};
use crate::page::SlabPage;

/// The partial slabs of one NUMA node, shared by every CPU.
///
/// Always locked after a CPU's local lock and before any page lock.
pub(crate) struct NodePartial {
    partial: Vec<Arc<SlabPage>>,
    /// The number of this node's slabs that have not yet gone pending free.
    /// The partial list's capacity never drops below this,
    /// so pushing onto it under the lock never allocates.
    nr_slabs: usize,
}

impl NodePartial {
    pub(crate) const fn new() -> NodePartial {
        NodePartial { partial: Vec::new(), nr_slabs: 0 }
    }

    /// Accounts for a newly created slab, growing the partial list's capacity
    /// if needed. Must not be called from within an atomic section.
    pub(crate) fn reserve_slot(&mut self) {
        self.nr_slabs += 1;
        if self.partial.capacity() < self.nr_slabs {
            self.partial.reserve(self.nr_slabs - self.partial.len());
        }
    }

    /// Accounts for a slab that has gone pending free.
    pub(crate) fn release_slot(&mut self) {
        debug_assert!(self.nr_slabs > 0, "BUG: node slab count underflow");
        self.nr_slabs -= 1;
    }

    pub(crate) fn push(&mut self, page: Arc<SlabPage>) {
        debug_assert!(self.partial.len() < self.partial.capacity(), "BUG: node partial list has no reserved slot");
        self.partial.push(page);
    }

    pub(crate) fn pop(&mut self) -> Option<Arc<SlabPage>> {
        self.partial.pop()
    }

    /// Unlinks the given page from this list, returning `false` if it wasn't on it.
    pub(crate) fn remove(&mut self, page: &Arc<SlabPage>) -> bool {
        match self.partial.iter().position(|p| Arc::ptr_eq(p, page)) {
            Some(pos) => {
                self.partial.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Unlinks every page for which `is_empty` returns `true`, accounting for
    /// each as gone pending free, and hands it to `discard`.
    pub(crate) fn discard_empty(
        &mut self,
        mut is_empty: impl FnMut(&SlabPage) -> bool,
        mut discard: impl FnMut(Arc<SlabPage>),
    ) -> usize {
        let mut removed = 0;
        let mut i = 0;
        while i < self.partial.len() {
            if is_empty(&*self.partial[i]) {
                let page = self.partial.swap_remove(i);
                self.release_slot();
                discard(page);
                removed += 1;
            } else {
                i += 1;
            }
        }
        removed
    }

    pub(crate) fn nr_partial(&self) -> usize {
        self.partial.len()
    }

    pub(crate) fn nr_slabs(&self) -> usize {
        self.nr_slabs
    }
}
