//! Deferred reclamation of slab pages.
//!
//! Code running in an atomic section cannot return pages to the [`PageProvider`],
//! because doing so may block. Instead, every operation that may empty a slab
//! takes a `&mut DeferredFreeList` from its caller and enqueues the emptied
//! page there. The caller then passes the list to [`KmemCache::drain()`]
//! once it has left the atomic section, which releases every page exactly once.
//!
//! A list is created on the stack of one call chain and never shared.
//! It belongs to the first cache that uses it; using it with any other cache is a bug.
//! [`DeferredScope`] bundles a list with its cache and drains it on drop,
//! so a caller cannot forget to drain.
//!
//! [`PageProvider`]: crate::PageProvider

use alloc::sync::Arc;
use core::{
    fmt,
    mem,
    ops::{Deref, DerefMut},
};
use intrusive_collections::{
    intrusive_adapter,
    singly_linked_list::{AtomicLink, SinglyLinkedList},
};
use log::error;
use migration::Task;
use crate::{
    page::{PageState, SlabPage},
    KmemCache,
};

intrusive_adapter!(pub(crate) PendingAdapter = Arc<SlabPage>: SlabPage { pending_link: AtomicLink });

/// A list of empty slab pages waiting to be returned to the page provider.
///
/// Enqueuing never blocks and never allocates, as the list is threaded
/// through the pages themselves.
///
/// Dropping a non-empty list is a bug that leaks the pages' memory:
/// it is logged, and it panics in debug builds.
pub struct DeferredFreeList {
    pages: SinglyLinkedList<PendingAdapter>,
    len: usize,
    /// The ID of the cache whose pages this list holds, once it has been used.
    cache_id: Option<usize>,
}

impl DeferredFreeList {
    pub fn new() -> DeferredFreeList {
        DeferredFreeList {
            pages: SinglyLinkedList::new(PendingAdapter::new()),
            len: 0,
            cache_id: None,
        }
    }

    pub(crate) fn for_cache(cache_id: usize) -> DeferredFreeList {
        let mut list = Self::new();
        list.cache_id = Some(cache_id);
        list
    }

    /// The ID of the cache this list belongs to, if it has been used yet.
    pub fn cache_id(&self) -> Option<usize> {
        self.cache_id
    }

    /// Binds this list to the given cache if it is unbound.
    /// Returns `false` if it already belongs to another cache.
    pub(crate) fn bind(&mut self, cache_id: usize) -> bool {
        *self.cache_id.get_or_insert(cache_id) == cache_id
    }

    /// Adds a page that has been moved to the `PendingFree` state.
    ///
    /// The page must not be linked into any other `DeferredFreeList`.
    pub fn enqueue(&mut self, page: Arc<SlabPage>) {
        assert_eq!(
            page.state(), PageState::PendingFree,
            "BUG: only pages pending free can be put on a DeferredFreeList"
        );
        let bound = self.bind(page.cache_id());
        debug_assert!(bound, "BUG: DeferredFreeList holds slabs of two caches");
        self.pages.push_front(page);
        self.len += 1;
    }

    /// The number of pages waiting to be released.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Returns an iterator over the pages waiting to be released.
    pub fn iter(&self) -> impl Iterator<Item = &SlabPage> + '_ {
        self.pages.iter()
    }

    pub(crate) fn pop(&mut self) -> Option<Arc<SlabPage>> {
        let page = self.pages.pop_front()?;
        self.len -= 1;
        Some(page)
    }
}

impl Default for DeferredFreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DeferredFreeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter().map(|page| page.pages())).finish()
    }
}

impl Drop for DeferredFreeList {
    fn drop(&mut self) {
        if !self.is_empty() {
            error!("BUG: dropped a DeferredFreeList with {} pages still pending; their memory is leaked", self.len);
            debug_assert!(self.is_empty(), "BUG: DeferredFreeList dropped with pages still pending");
        }
    }
}


/// A [`DeferredFreeList`] that is drained into its cache when dropped.
///
/// Obtain one with [`KmemCache::deferred_scope()`] before entering a code path
/// that may evict pages, and let it fall out of scope after leaving that path.
/// It must not be dropped inside an atomic section.
pub struct DeferredScope<'a> {
    cache: &'a KmemCache,
    task: &'a Task,
    list: DeferredFreeList,
}

impl<'a> DeferredScope<'a> {
    pub(crate) fn new(cache: &'a KmemCache, task: &'a Task) -> DeferredScope<'a> {
        DeferredScope { cache, task, list: DeferredFreeList::for_cache(cache.id()) }
    }

    /// Drains the pages collected so far, returning how many were released.
    pub fn drain_now(&mut self) -> usize {
        let list = mem::replace(&mut self.list, DeferredFreeList::for_cache(self.cache.id()));
        self.cache.drain(self.task, list)
    }
}

impl Deref for DeferredScope<'_> {
    type Target = DeferredFreeList;
    fn deref(&self) -> &DeferredFreeList {
        &self.list
    }
}

impl DerefMut for DeferredScope<'_> {
    fn deref_mut(&mut self) -> &mut DeferredFreeList {
        &mut self.list
    }
}

impl Drop for DeferredScope<'_> {
    fn drop(&mut self) {
        self.drain_now();
    }
}
