//! Slab pages: runs of physical pages carved into equal-sized objects,
//! and the state machine that moves them between CPUs and lists.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};
use cpu::{CpuId, NodeId};
use intrusive_collections::singly_linked_list::AtomicLink;
use spin::{Mutex, MutexGuard};
use crate::provider::PhysPages;

/// Where a slab page currently lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    /// The current slab of the given CPU, allocated from via that CPU's local freelist.
    Active(CpuId),
    /// On its node's partial list, with at least one free object.
    Partial,
    /// Every object is in use. A full page is on no list.
    Full,
    /// On the given CPU's partial list, reserved for that CPU's allocations
    /// and invisible to every other CPU.
    Frozen(CpuId),
    /// Empty and unlinked from every list, owned by exactly one
    /// [`DeferredFreeList`](crate::DeferredFreeList) until that list is drained.
    PendingFree,
}

/// Bitmap operations for tracking which objects within a page are live.
pub(crate) trait LiveBitmap {
    /// Marks the object live, returning `false` if it already was.
    fn mark_live(&self, idx: usize) -> bool;
    /// Marks the object free, returning `false` if it already was.
    fn mark_free(&self, idx: usize) -> bool;
    fn is_live(&self, idx: usize) -> bool;
    fn count_live(&self) -> usize;
}

impl LiveBitmap for [AtomicU64] {
    fn mark_live(&self, idx: usize) -> bool {
        let mask = 1 << (idx % 64);
        self[idx / 64].fetch_or(mask, Ordering::Relaxed) & mask == 0
    }

    fn mark_free(&self, idx: usize) -> bool {
        let mask = 1 << (idx % 64);
        self[idx / 64].fetch_and(!mask, Ordering::Relaxed) & mask != 0
    }

    fn is_live(&self, idx: usize) -> bool {
        self[idx / 64].load(Ordering::Relaxed) & (1 << (idx % 64)) != 0
    }

    fn count_live(&self) -> usize {
        self.iter()
            .map(|word| word.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

/// A slab: one run of physical pages holding `capacity` objects of one cache.
///
/// The page-side freelist only holds objects that are free *and* not parked
/// on a CPU's local freelist, so from the page's point of view
/// `inuse = capacity - freelist.len()`.
pub struct SlabPage {
    cache_id: usize,
    pages: PhysPages,
    object_size: usize,
    capacity: u16,
    live: Box<[AtomicU64]>,
    inner: Mutex<PageInner>,
    /// Links this page into a `DeferredFreeList` while it is pending free.
    pub(crate) pending_link: AtomicLink,
}

pub(crate) struct PageInner {
    pub(crate) state: PageState,
    /// Free object indices. Every freelist in a cache is allocated with capacity
    /// for a whole slab, and freelists are swapped rather than grown,
    /// so pushing onto one never allocates.
    pub(crate) freelist: Vec<u16>,
}

impl SlabPage {
    /// Carves `capacity` objects of `object_size` bytes out of the given pages.
    ///
    /// A new slab starts out `Partial` with every object free;
    /// the caller either activates it or puts it on its node's partial list.
    pub(crate) fn new(cache_id: usize, pages: PhysPages, object_size: usize, capacity: u16) -> SlabPage {
        let mut freelist = Vec::with_capacity(capacity as usize);
        freelist.extend((0..capacity).rev());
        let words = (capacity as usize + 63) / 64;
        SlabPage {
            cache_id,
            pages,
            object_size,
            capacity,
            live: (0..words).map(|_| AtomicU64::new(0)).collect(),
            inner: Mutex::new(PageInner { state: PageState::Partial, freelist }),
            pending_link: AtomicLink::new(),
        }
    }

    /// The ID of the cache this page belongs to.
    pub fn cache_id(&self) -> usize {
        self.cache_id
    }

    pub fn pages(&self) -> PhysPages {
        self.pages
    }

    pub fn node(&self) -> NodeId {
        self.pages.node()
    }

    /// The number of objects this page holds.
    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn state(&self) -> PageState {
        self.inner.lock().state
    }

    /// The number of objects that have been handed out to callers.
    pub fn live_objects(&self) -> usize {
        self.live.count_live()
    }

    /// Returns the address of the object at `index`.
    pub fn object_addr(&self, index: u16) -> usize {
        self.pages.base() + index as usize * self.object_size
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PageInner> {
        self.inner.lock()
    }

    /// Returns `true` if the locked page has no objects in use,
    /// i.e., none are live and none are parked on a CPU's local freelist.
    pub(crate) fn is_empty(&self, inner: &PageInner) -> bool {
        inner.freelist.len() == self.capacity as usize
    }

    /// Marks the object at `index` as handed out.
    pub(crate) fn claim_object(&self, index: u16) {
        if !self.live.mark_live(index as usize) {
            panic!("BUG: slab object {} at {:#X} was handed out twice", index, self.object_addr(index));
        }
    }

    /// Marks the object at `index` as returned, or returns `false` if it wasn't live.
    pub(crate) fn release_object(&self, index: u16) -> bool {
        self.live.mark_free(index as usize)
    }
}

impl fmt::Debug for SlabPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabPage")
            .field("cache_id", &self.cache_id)
            .field("pages", &self.pages)
            .field("capacity", &self.capacity)
            .field("live", &self.live_objects())
            .finish_non_exhaustive()
    }
}


/// An object allocated from a slab cache.
///
/// It must be given back with [`KmemCache::free()`](crate::KmemCache::free)
/// to the same cache it came from; dropping it leaks the object.
pub struct SlabObject {
    pub(crate) page: Arc<SlabPage>,
    pub(crate) index: u16,
}

impl SlabObject {
    /// The address of this object's memory.
    pub fn addr(&self) -> usize {
        self.page.object_addr(self.index)
    }

    /// The slab page this object was carved from.
    pub fn page(&self) -> &SlabPage {
        &self.page
    }

    /// This object's index within its slab page.
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn node(&self) -> NodeId {
        self.page.node()
    }
}

impl fmt::Debug for SlabObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlabObject({:#X}, node {})", self.addr(), self.node())
    }
}
