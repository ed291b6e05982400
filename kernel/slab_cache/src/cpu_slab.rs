//! Per-CPU slab state and the local lock that guards it.

use alloc::{sync::Arc, vec::Vec};
use core::ops::{Deref, DerefMut};
use cpu::CpuId;
use kernel_config::memory::MAX_CPU_PARTIAL;
use migration::{AtomicSection, Task};
use spin::{Mutex, MutexGuard};
use crate::page::{SlabObject, SlabPage};

/// One CPU's slab state.
///
/// Only touched under that CPU's local lock, normally by a task pinned to that CPU,
/// or by a pinned task on another CPU flushing it.
pub(crate) struct CpuSlab {
    /// The active page, whose free objects are in `freelist`.
    pub(crate) page: Option<Arc<SlabPage>>,
    /// Free objects of the active page. Empty whenever `page` is `None`.
    pub(crate) freelist: Vec<u16>,
    /// Frozen pages reserved for this CPU.
    pub(crate) partial: Vec<Arc<SlabPage>>,
    /// The transaction ID, advanced on every operation that changes this slab.
    pub(crate) tid: u64,
}

impl CpuSlab {
    pub(crate) fn new(cpu: CpuId, objects_per_page: usize) -> CpuSlab {
        CpuSlab {
            page: None,
            freelist: Vec::with_capacity(objects_per_page),
            // One beyond the limit, as the list is unfrozen only after it overflows.
            partial: Vec::with_capacity(MAX_CPU_PARTIAL + 1),
            tid: cpu.value() as u64,
        }
    }

    /// Advances the transaction ID. `step` is the same for every CPU in a cache
    /// and at least the number of CPUs, so IDs never collide across CPUs.
    pub(crate) fn advance_tid(&mut self, step: u64) {
        self.tid = self.tid.wrapping_add(step);
    }

    /// Takes an object from the local freelist of the active page.
    pub(crate) fn pop_local(&mut self) -> Option<SlabObject> {
        let page = self.page.as_ref()?;
        let index = self.freelist.pop()?;
        page.claim_object(index);
        Some(SlabObject { page: page.clone(), index })
    }
}

/// A held CPU local lock.
///
/// Holding it is an atomic section for the task that took it:
/// nothing may block or allocate until it is released.
pub(crate) struct LocalLock<'a> {
    // Dropped before `_atomic`, so the lock is released inside the atomic section.
    slab: MutexGuard<'a, CpuSlab>,
    _atomic: AtomicSection<'a>,
}

impl<'a> LocalLock<'a> {
    /// Takes the given CPU's local lock. The `task` must have migration disabled.
    pub(crate) fn new(slab: &'a Mutex<CpuSlab>, task: &'a Task) -> LocalLock<'a> {
        let atomic = task.enter_atomic();
        LocalLock { slab: slab.lock(), _atomic: atomic }
    }
}

impl Deref for LocalLock<'_> {
    type Target = CpuSlab;
    fn deref(&self) -> &CpuSlab {
        &self.slab
    }
}

impl DerefMut for LocalLock<'_> {
    fn deref_mut(&mut self) -> &mut CpuSlab {
        &mut self.slab
    }
}
