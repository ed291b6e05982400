//! A per-CPU slab object cache for a preemptible kernel.
//!
//! A [`KmemCache`] hands out fixed-size objects carved from slabs,
//! runs of physical pages obtained from a [`PageProvider`].
//! Each CPU has its own active slab and a small list of frozen partial slabs,
//! guarded by a per-CPU *local lock*; each NUMA node has a shared list of
//! partially-used slabs guarded by a spin lock.
//!
//! Every operation first disables migration for the calling [`Task`], pinning it
//! to its current CPU without disabling preemption, and then takes that CPU's
//! local lock. Holding the local lock is an atomic section: nothing in it
//! may block, allocate, or call into the page provider. Acquiring a new slab
//! therefore drops the local lock, and redoes the operation if the CPU's
//! transaction ID shows that the slab was changed in the meantime.
//!
//! Emptied slabs are never returned to the page provider from within an atomic
//! section. Every operation that may empty a slab takes a [`DeferredFreeList`]
//! from its caller, who must pass it to [`KmemCache::drain()`] afterwards
//! (or use a [`DeferredScope`], which does so automatically).
//!
//! Locks are always taken in this order: CPU local lock, node lock, page lock.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod config;
mod cpu_slab;
mod deferred;
mod node;
mod page;
mod provider;
mod tunables;

pub use config::CacheConfig;
pub use deferred::{DeferredFreeList, DeferredScope};
pub use page::{PageState, SlabObject, SlabPage};
pub use provider::*;
pub use tunables::CacheTunables;

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{
    fmt,
    mem,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};
use cpu::{CpuId, NodeId, Topology};
use cpu_slab::{CpuSlab, LocalLock};
use log::{debug, error, info, trace};
use migration::{MigrationControl, Task};
use node::NodePartial;
use spin::Mutex;
use static_assertions::assert_impl_all;
use tunables::Tunables;

static NEXT_CACHE_ID: AtomicUsize = AtomicUsize::new(0);

/// The error returned when an object cannot be allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// The page provider could not supply a new slab.
    /// This is never retried by the cache itself.
    OutOfMemory { node: NodeId, order: u32 },
    /// The requested node does not exist in this cache's topology.
    InvalidNode(NodeId),
}

impl From<AllocError> for &'static str {
    fn from(err: AllocError) -> &'static str {
        match err {
            AllocError::OutOfMemory { .. } => "out of memory: the page provider could not supply a slab",
            AllocError::InvalidNode(_) => "the requested NUMA node does not exist",
        }
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory { node, order } => {
                write!(f, "out of memory for an order-{} slab on node {}", order, node)
            }
            AllocError::InvalidNode(node) => write!(f, "node {} does not exist", node),
        }
    }
}

/// The error returned when freeing an object would corrupt the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlabError {
    /// The object's slab linkage is inconsistent. The object was not freed.
    Corrupted(&'static str),
}

impl From<SlabError> for &'static str {
    fn from(err: SlabError) -> &'static str {
        match err {
            SlabError::Corrupted(msg) => msg,
        }
    }
}

impl fmt::Display for SlabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlabError::Corrupted(msg) => write!(f, "slab corruption: {}", msg),
        }
    }
}

/// A snapshot of a cache's statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Objects currently handed out.
    pub live_objects: usize,
    /// Slabs acquired and not yet released, including those pending free.
    pub slabs: usize,
    /// Slabs on the nodes' partial lists.
    pub partial_slabs: usize,
    pub pages_acquired: u64,
    pub pages_released: u64,
    pub alloc_fastpath: u64,
    pub alloc_slowpath: u64,
    pub free_fastpath: u64,
    pub free_slowpath: u64,
    /// Slow-path allocations that found their CPU slab changed while acquiring a slab.
    pub alloc_redo: u64,
}

#[derive(Default)]
struct Counters {
    live_objects: AtomicUsize,
    pages_acquired: AtomicU64,
    pages_released: AtomicU64,
    alloc_fastpath: AtomicU64,
    alloc_slowpath: AtomicU64,
    free_fastpath: AtomicU64,
    free_slowpath: AtomicU64,
    alloc_redo: AtomicU64,
}

fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// A cache of fixed-size objects with per-CPU and per-node slab lists.
pub struct KmemCache {
    id: usize,
    config: CacheConfig,
    objects_per_page: u16,
    topology: Topology,
    migration: Arc<MigrationControl>,
    provider: Arc<dyn PageProvider>,
    accounting: Arc<dyn Accounting>,
    cpu_slabs: Box<[Mutex<CpuSlab>]>,
    nodes: Box<[Mutex<NodePartial>]>,
    tunables: Tunables,
    tid_step: u64,
    counters: Counters,
}

assert_impl_all!(KmemCache: Send, Sync);
assert_impl_all!(SlabObject: Send, Sync);

impl KmemCache {
    /// Creates a new cache with one CPU slab per CPU and one partial list per node
    /// of the given `topology`.
    ///
    /// `migration` must track the same CPUs as `topology`.
    pub fn new(
        config: CacheConfig,
        topology: Topology,
        migration: Arc<MigrationControl>,
        provider: Arc<dyn PageProvider>,
    ) -> Result<KmemCache, &'static str> {
        config.validate()?;
        if topology.nr_cpus() != migration.nr_cpus() {
            return Err("KmemCache: topology and migration control disagree on the number of CPUs");
        }
        let objects_per_page = config.objects_per_page();
        let cpu_slabs = topology.cpus()
            .map(|cpu| Mutex::new(CpuSlab::new(cpu, objects_per_page)))
            .collect();
        let nodes = topology.nodes()
            .map(|_| Mutex::new(NodePartial::new()))
            .collect();
        let tunables = Tunables::new(CacheTunables {
            cpu_partial: config.cpu_partial,
            min_partial: config.min_partial,
        });
        let id = NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed);
        info!("Created slab cache {:?} (id {}): {} objects of {} bytes per order-{} slab, {} CPUs, {} nodes",
            config.name, id, objects_per_page, config.object_size, config.order,
            topology.nr_cpus(), topology.nr_nodes(),
        );
        Ok(KmemCache {
            id,
            objects_per_page: objects_per_page as u16,
            tid_step: topology.nr_cpus().next_power_of_two() as u64,
            config,
            topology,
            migration,
            provider,
            accounting: Arc::new(NoAccounting),
            cpu_slabs,
            nodes,
            tunables,
            counters: Counters::default(),
        })
    }

    /// Reports page and object count changes to the given `accounting` callback.
    pub fn with_accounting(mut self, accounting: Arc<dyn Accounting>) -> KmemCache {
        self.accounting = accounting;
        self
    }

    pub fn name(&self) -> &'static str {
        self.config.name
    }

    /// The unique ID of this cache, which every one of its pages carries.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn objects_per_page(&self) -> usize {
        self.objects_per_page as usize
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn migration(&self) -> &Arc<MigrationControl> {
        &self.migration
    }

    fn node(&self, node: NodeId) -> &Mutex<NodePartial> {
        &self.nodes[node.index()]
    }

    fn lock_cpu<'a>(&'a self, task: &'a Task, cpu: CpuId) -> LocalLock<'a> {
        LocalLock::new(&self.cpu_slabs[cpu.index()], task)
    }

    /// Claims `deferred` for this cache before anything can be put on it.
    #[track_caller]
    fn bind_deferred(&self, deferred: &mut DeferredFreeList) {
        if !deferred.bind(self.id) {
            error!("BUG: {}: used a DeferredFreeList of cache {:?} with cache {}", self.config.name, deferred.cache_id(), self.id);
            panic!("BUG: {}: DeferredFreeList belongs to another cache", self.config.name);
        }
    }

    fn corrupted(&self, msg: &'static str) -> SlabError {
        error!("BUG: {}: {}", self.config.name, msg);
        SlabError::Corrupted(msg)
    }

    /// Allocates one object, preferably from the given NUMA node.
    ///
    /// Without a `node_hint`, objects come from the calling CPU's node first
    /// and then from any other node's partial slabs.
    /// Slabs emptied along the way are put on `deferred`.
    pub fn allocate(
        &self,
        task: &Task,
        node_hint: Option<NodeId>,
        deferred: &mut DeferredFreeList,
    ) -> Result<SlabObject, AllocError> {
        if let Some(node) = node_hint {
            if node.index() >= self.nodes.len() {
                return Err(AllocError::InvalidNode(node));
            }
        }
        self.bind_deferred(deferred);
        let pin = self.migration.disable(task);
        let cpu = pin.cpu();

        let object = loop {
            let mut slab = self.lock_cpu(task, cpu);
            if let Some(object) = self.allocate_locked(&mut slab, cpu, node_hint, deferred) {
                slab.advance_tid(self.tid_step);
                break object;
            }
            let tid = slab.tid;
            drop(slab);

            let node = node_hint.unwrap_or_else(|| self.local_node(cpu));
            let page = self.new_slab(task, node)?;

            let mut slab = self.lock_cpu(task, cpu);
            if slab.tid != tid {
                // Another task used or flushed this CPU slab while we were acquiring
                // the new page. Make the page available to everyone and start over.
                debug!("{}: CPU {} slab changed during slab acquisition, redoing allocation", self.config.name, cpu);
                inc(&self.counters.alloc_redo);
                let mut node = self.node(page.node()).lock();
                page.lock().state = PageState::Partial;
                node.push(page);
                continue;
            }
            self.activate(&mut slab, page, cpu);
            match slab.pop_local() {
                Some(object) => {
                    slab.advance_tid(self.tid_step);
                    break object;
                }
                None => panic!("BUG: {}: newly acquired slab has no free objects", self.config.name),
            }
        };
        drop(pin);

        self.counters.live_objects.fetch_add(1, Ordering::Relaxed);
        self.accounting.objects_changed(object.node(), 1);
        Ok(object)
    }

    fn local_node(&self, cpu: CpuId) -> NodeId {
        self.topology.node_of(cpu).unwrap_or(NodeId::new(0))
    }

    /// Tries to allocate without acquiring a new slab. On failure, the CPU has no active slab.
    fn allocate_locked(
        &self,
        slab: &mut CpuSlab,
        cpu: CpuId,
        node_hint: Option<NodeId>,
        deferred: &mut DeferredFreeList,
    ) -> Option<SlabObject> {
        let node_mismatch = matches!(
            (&slab.page, node_hint),
            (Some(page), Some(node)) if page.node() != node
        );
        if node_mismatch {
            trace!("{}: CPU {} active slab is on the wrong node", self.config.name, cpu);
            self.deactivate_slab(slab, deferred);
        }

        if let Some(object) = slab.pop_local() {
            inc(&self.counters.alloc_fastpath);
            return Some(object);
        }
        inc(&self.counters.alloc_slowpath);

        // Take over objects that other CPUs freed into the active slab.
        if let Some(page) = slab.page.clone() {
            let refilled = {
                let mut inner = page.lock();
                if inner.freelist.is_empty() {
                    false
                } else {
                    mem::swap(&mut inner.freelist, &mut slab.freelist);
                    true
                }
            };
            if refilled {
                return slab.pop_local();
            }
            self.deactivate_slab(slab, deferred);
        }

        let matches_hint = |page: &Arc<SlabPage>| node_hint.map_or(true, |node| page.node() == node);
        if let Some(pos) = slab.partial.iter().position(matches_hint) {
            let page = slab.partial.remove(pos);
            self.activate(slab, page, cpu);
            return slab.pop_local();
        }

        let first = node_hint.unwrap_or_else(|| self.local_node(cpu));
        if self.refill_from_node(slab, cpu, first) {
            return slab.pop_local();
        }
        if node_hint.is_none() {
            for node in self.topology.nodes().filter(|&node| node != first) {
                if self.refill_from_node(slab, cpu, node) {
                    return slab.pop_local();
                }
            }
        }
        None
    }

    /// Makes `page` the CPU's active slab. The CPU must not have one.
    fn activate(&self, slab: &mut CpuSlab, page: Arc<SlabPage>, cpu: CpuId) {
        debug_assert!(slab.page.is_none() && slab.freelist.is_empty());
        {
            let mut inner = page.lock();
            trace!("{}: slab {:#X} {:?} -> Active({})", self.config.name, page.pages().base(), inner.state, cpu);
            inner.state = PageState::Active(cpu);
            mem::swap(&mut inner.freelist, &mut slab.freelist);
        }
        slab.page = Some(page);
    }

    /// Activates a slab from the given node's partial list, and freezes up to
    /// half of `cpu_partial` more onto the CPU's partial list.
    fn refill_from_node(&self, slab: &mut CpuSlab, cpu: CpuId, node: NodeId) -> bool {
        let cpu_partial = self.tunables.get().cpu_partial;
        let mut list = self.node(node).lock();
        let page = match list.pop() {
            Some(page) => page,
            None => return false,
        };
        self.activate(slab, page, cpu);
        while slab.partial.len() < cpu_partial / 2 {
            let extra = match list.pop() {
                Some(page) => page,
                None => break,
            };
            extra.lock().state = PageState::Frozen(cpu);
            slab.partial.push(extra);
        }
        true
    }

    /// Acquires a new slab from the page provider. Must not be called in an atomic section.
    fn new_slab(&self, task: &Task, node: NodeId) -> Result<Arc<SlabPage>, AllocError> {
        assert!(!task.in_atomic(), "BUG: {}: slab acquired inside an atomic section", self.config.name);
        let order = self.config.order;
        let pages = self.provider.acquire_pages(node, order).map_err(|err| {
            debug!("{}: page provider failed to supply an order-{} slab on node {}: {}", self.config.name, order, node, err);
            AllocError::OutOfMemory { node, order }
        })?;
        if pages.node().index() >= self.nodes.len() {
            error!("BUG: {}: page provider returned pages on unknown node {}", self.config.name, pages.node());
            self.provider.release_pages(pages);
            return Err(AllocError::OutOfMemory { node, order });
        }

        let page = Arc::new(SlabPage::new(self.id, pages, self.config.object_size, self.objects_per_page));
        self.node(pages.node()).lock().reserve_slot();
        inc(&self.counters.pages_acquired);
        self.accounting.pages_changed(pages.node(), pages.nr_pages() as isize);
        debug!("{}: acquired order-{} slab at {:#X} on node {}", self.config.name, order, pages.base(), pages.node());
        Ok(page)
    }

    /// Decides whether an empty slab is kept or goes pending free.
    /// Accounts for it as gone if not kept.
    fn should_discard(&self, node: &mut NodePartial, min_partial: usize) -> bool {
        if node.nr_partial() >= min_partial {
            node.release_slot();
            true
        } else {
            false
        }
    }

    /// Removes the CPU's active slab and returns its local freelist to it.
    ///
    /// An emptied slab goes pending free if its node already has at least
    /// `min_partial` partial slabs, a full one goes on no list,
    /// and anything else goes on its node's partial list.
    fn deactivate_slab(&self, slab: &mut CpuSlab, deferred: &mut DeferredFreeList) {
        let page = match slab.page.take() {
            Some(page) => page,
            None => return,
        };
        let min_partial = self.tunables.get().min_partial;
        let pending = {
            let mut node = self.node(page.node()).lock();
            let mut inner = page.lock();
            inner.freelist.extend(slab.freelist.drain(..));
            let new_state = if page.is_empty(&inner) && self.should_discard(&mut node, min_partial) {
                PageState::PendingFree
            } else if inner.freelist.is_empty() {
                PageState::Full
            } else {
                node.push(page.clone());
                PageState::Partial
            };
            trace!("{}: slab {:#X} {:?} -> {:?}", self.config.name, page.pages().base(), inner.state, new_state);
            inner.state = new_state;
            new_state == PageState::PendingFree
        };
        if pending {
            deferred.enqueue(page);
        }
    }

    /// Moves every frozen slab on the CPU's partial list to its node's partial list,
    /// or to `deferred` if it is empty and its node has enough partial slabs.
    fn unfreeze_partials(&self, slab: &mut CpuSlab, deferred: &mut DeferredFreeList) {
        let min_partial = self.tunables.get().min_partial;
        let mut partial = mem::take(&mut slab.partial);
        for page in partial.drain(..) {
            let pending = {
                let mut node = self.node(page.node()).lock();
                let mut inner = page.lock();
                if page.is_empty(&inner) && self.should_discard(&mut node, min_partial) {
                    inner.state = PageState::PendingFree;
                    true
                } else {
                    inner.state = PageState::Partial;
                    node.push(page.clone());
                    false
                }
            };
            if pending {
                deferred.enqueue(page);
            }
        }
        slab.partial = partial;
    }

    /// Returns an object to this cache.
    ///
    /// If the object belongs to the calling CPU's active slab it goes onto that
    /// CPU's local freelist; otherwise it goes back to its slab under the node
    /// and page locks, possibly moving that slab between lists.
    /// Slabs emptied along the way are put on `deferred`.
    ///
    /// Freeing an object of another cache, a double free, or a free into a slab
    /// that is pending free returns [`SlabError::Corrupted`] and frees nothing.
    pub fn free(&self, task: &Task, object: SlabObject, deferred: &mut DeferredFreeList) -> Result<(), SlabError> {
        if object.page.cache_id() != self.id {
            return Err(self.corrupted("object was allocated from a different cache"));
        }
        if object.index >= object.page.capacity() {
            return Err(self.corrupted("object index is out of range for its slab"));
        }
        self.bind_deferred(deferred);
        let node = object.node();
        let pin = self.migration.disable(task);
        let cpu = pin.cpu();

        let result = {
            let mut slab = self.lock_cpu(task, cpu);
            let is_local = matches!(&slab.page, Some(active) if Arc::ptr_eq(active, &object.page));
            let result = if is_local {
                if object.page.release_object(object.index) {
                    slab.freelist.push(object.index);
                    inc(&self.counters.free_fastpath);
                    Ok(())
                } else {
                    Err(self.corrupted("double free of a slab object"))
                }
            } else {
                inc(&self.counters.free_slowpath);
                self.free_slow(&mut slab, cpu, object, deferred)
            };
            if result.is_ok() {
                slab.advance_tid(self.tid_step);
            }
            result
        };
        drop(pin);

        if result.is_ok() {
            self.counters.live_objects.fetch_sub(1, Ordering::Relaxed);
            self.accounting.objects_changed(node, -1);
        }
        result
    }

    fn free_slow(
        &self,
        slab: &mut CpuSlab,
        cpu: CpuId,
        object: SlabObject,
        deferred: &mut DeferredFreeList,
    ) -> Result<(), SlabError> {
        enum Outcome {
            Done,
            Pending,
            Frozen,
        }

        let tunables = self.tunables.get();
        let SlabObject { page, index } = object;
        let outcome = {
            let mut node = self.node(page.node()).lock();
            let mut inner = page.lock();
            let state = inner.state;
            match state {
                PageState::PendingFree => {
                    return Err(self.corrupted("object freed into a slab that is pending free"));
                }
                PageState::Active(owner) if owner == cpu => {
                    return Err(self.corrupted("slab is active on this CPU but is not its current slab"));
                }
                _ => {}
            }
            if !page.release_object(index) {
                return Err(self.corrupted("double free of a slab object"));
            }
            inner.freelist.push(index);
            let empty = page.is_empty(&inner);

            let new_state = match state {
                // A remote free into another CPU's slab stays there until that CPU takes it.
                PageState::Active(_) => state,
                PageState::Frozen(owner) if owner == cpu && empty && self.should_discard(&mut node, tunables.min_partial) => {
                    if let Some(pos) = slab.partial.iter().position(|p| Arc::ptr_eq(p, &page)) {
                        slab.partial.remove(pos);
                    }
                    PageState::PendingFree
                }
                // Frozen on another CPU: only that CPU may unfreeze it.
                PageState::Frozen(_) => state,
                PageState::Full if tunables.cpu_partial > 0 => {
                    slab.partial.push(page.clone());
                    PageState::Frozen(cpu)
                }
                PageState::Full if empty && self.should_discard(&mut node, tunables.min_partial) => {
                    PageState::PendingFree
                }
                PageState::Full => {
                    node.push(page.clone());
                    PageState::Partial
                }
                PageState::Partial if empty && node.nr_partial() >= tunables.min_partial => {
                    node.remove(&page);
                    node.release_slot();
                    PageState::PendingFree
                }
                PageState::Partial | PageState::PendingFree => state,
            };
            if new_state != state {
                trace!("{}: slab {:#X} {:?} -> {:?}", self.config.name, page.pages().base(), state, new_state);
            }
            inner.state = new_state;
            match new_state {
                PageState::PendingFree => Outcome::Pending,
                PageState::Frozen(_) if state == PageState::Full => Outcome::Frozen,
                _ => Outcome::Done,
            }
        };

        match outcome {
            Outcome::Pending => deferred.enqueue(page),
            Outcome::Frozen if slab.partial.len() > tunables.cpu_partial => {
                self.unfreeze_partials(slab, deferred);
            }
            _ => {}
        }
        Ok(())
    }

    /// Deactivates the calling CPU's active slab.
    pub fn deactivate_current(&self, task: &Task, deferred: &mut DeferredFreeList) {
        self.bind_deferred(deferred);
        let pin = self.migration.disable(task);
        let mut slab = self.lock_cpu(task, pin.cpu());
        self.deactivate_slab(&mut slab, deferred);
        slab.advance_tid(self.tid_step);
    }

    /// Deactivates the given CPU's active slab and unfreezes its partial slabs.
    ///
    /// The `cpu` may be any CPU, not just the caller's.
    pub fn flush(&self, task: &Task, cpu: CpuId, deferred: &mut DeferredFreeList) -> Result<(), &'static str> {
        if cpu.index() >= self.cpu_slabs.len() {
            return Err("KmemCache::flush(): CPU does not exist");
        }
        self.bind_deferred(deferred);
        let _pin = self.migration.disable(task);
        let mut slab = self.lock_cpu(task, cpu);
        self.deactivate_slab(&mut slab, deferred);
        self.unfreeze_partials(&mut slab, deferred);
        slab.advance_tid(self.tid_step);
        trace!("{}: flushed CPU {}", self.config.name, cpu);
        Ok(())
    }

    /// Flushes every CPU.
    pub fn flush_all(&self, task: &Task, deferred: &mut DeferredFreeList) {
        for cpu in self.topology.cpus() {
            // Every CPU in the topology has a slab.
            let _ = self.flush(task, cpu, deferred);
        }
    }

    /// Allocates up to `n` objects into `out`, returning how many were allocated.
    ///
    /// Fewer than `n` are allocated only if the page provider runs out of memory.
    pub fn bulk_allocate(
        &self,
        task: &Task,
        n: usize,
        out: &mut Vec<SlabObject>,
        deferred: &mut DeferredFreeList,
    ) -> usize {
        self.bind_deferred(deferred);
        // Reserved up front, so pushing below never allocates.
        out.reserve(n);
        let pin = self.migration.disable(task);
        let cpu = pin.cpu();
        let mut allocated = 0;
        while allocated < n {
            let from_local = {
                let mut slab = self.lock_cpu(task, cpu);
                let mut taken = 0;
                while allocated + taken < n {
                    match slab.pop_local() {
                        Some(object) => {
                            out.push(object);
                            taken += 1;
                        }
                        None => break,
                    }
                }
                if taken > 0 {
                    slab.advance_tid(self.tid_step);
                }
                taken
            };
            if from_local > 0 {
                self.counters.alloc_fastpath.fetch_add(from_local as u64, Ordering::Relaxed);
                self.counters.live_objects.fetch_add(from_local, Ordering::Relaxed);
                for object in &out[out.len() - from_local..] {
                    self.accounting.objects_changed(object.node(), 1);
                }
                allocated += from_local;
                continue;
            }
            match self.allocate(task, None, deferred) {
                Ok(object) => {
                    out.push(object);
                    allocated += 1;
                }
                Err(err) => {
                    debug!("{}: bulk allocation stopped after {} of {} objects: {}", self.config.name, allocated, n, err);
                    break;
                }
            }
        }
        allocated
    }

    /// Frees every object in `objects`, returning how many were freed.
    ///
    /// Stops at the first object that cannot be freed; the rest are dropped (leaked).
    pub fn bulk_free(
        &self,
        task: &Task,
        objects: impl IntoIterator<Item = SlabObject>,
        deferred: &mut DeferredFreeList,
    ) -> Result<usize, SlabError> {
        self.bind_deferred(deferred);
        let _pin = self.migration.disable(task);
        let mut freed = 0;
        for object in objects {
            self.free(task, object, deferred)?;
            freed += 1;
        }
        Ok(freed)
    }

    /// Flushes every CPU and then moves every empty partial slab to `deferred`,
    /// regardless of `min_partial`. Returns the number of slabs moved.
    pub fn shrink(&self, task: &Task, deferred: &mut DeferredFreeList) -> usize {
        self.bind_deferred(deferred);
        self.flush_all(task, deferred);
        let mut discarded = 0;
        for node in self.nodes.iter() {
            let mut node = node.lock();
            discarded += node.discard_empty(
                |page| page.is_empty(&page.lock()),
                |page| {
                    page.lock().state = PageState::PendingFree;
                    deferred.enqueue(page);
                },
            );
        }
        if discarded > 0 {
            debug!("{}: shrink discarded {} empty slabs", self.config.name, discarded);
        }
        discarded
    }

    /// Returns every page on `list` to the page provider, returning how many were released.
    ///
    /// This may block, so it must not be called from within an atomic section.
    pub fn drain(&self, task: &Task, mut list: DeferredFreeList) -> usize {
        assert!(
            !task.in_atomic(),
            "BUG: {}: task {} drained a DeferredFreeList inside an atomic section",
            self.config.name, task.id(),
        );
        self.bind_deferred(&mut list);
        let mut released = 0;
        while let Some(page) = list.pop() {
            assert_eq!(page.cache_id(), self.id, "BUG: {}: drained a slab of another cache", self.config.name);
            debug_assert_eq!(page.state(), PageState::PendingFree);
            let pages = page.pages();
            self.provider.release_pages(pages);
            inc(&self.counters.pages_released);
            self.accounting.pages_changed(pages.node(), -(pages.nr_pages() as isize));
            trace!("{}: released slab {:#X} on node {}", self.config.name, pages.base(), pages.node());
            released += 1;
        }
        released
    }

    /// Returns a deferred free list that is drained into this cache when dropped.
    pub fn deferred_scope<'a>(&'a self, task: &'a Task) -> DeferredScope<'a> {
        DeferredScope::new(self, task)
    }

    /// Prepares for the given CPU to be hot-unplugged.
    ///
    /// This waits until no task is pinned to `cpu`, then flushes its slabs
    /// and releases any pages that emptied. Returns the number of pages released.
    /// The calling task must not be pinned to `cpu`.
    pub fn cpu_offline(&self, task: &Task, cpu: CpuId) -> Result<usize, &'static str> {
        if task.is_migration_disabled() && task.current_cpu() == cpu {
            return Err("KmemCache::cpu_offline(): caller is pinned to the CPU going offline");
        }
        self.migration.take_offline(cpu)?;
        let mut deferred = DeferredFreeList::for_cache(self.id);
        let flushed = self.flush(task, cpu, &mut deferred);
        let released = self.drain(task, deferred);
        flushed?;
        info!("{}: CPU {} offline, released {} slabs", self.config.name, cpu, released);
        Ok(released)
    }

    /// Allows the given CPU to be used again after [`KmemCache::cpu_offline()`].
    pub fn cpu_online(&self, cpu: CpuId) -> Result<(), &'static str> {
        self.migration.bring_online(cpu)?;
        info!("{}: CPU {} online", self.config.name, cpu);
        Ok(())
    }

    /// Returns every slab to the page provider, returning the number of pages released.
    ///
    /// Fails without doing anything if any objects are still allocated.
    pub fn shutdown(&self, task: &Task) -> Result<usize, &'static str> {
        let live = self.counters.live_objects.load(Ordering::Relaxed);
        if live != 0 {
            error!("{}: cannot shut down with {} live objects", self.config.name, live);
            return Err("KmemCache::shutdown(): objects are still allocated");
        }
        let mut deferred = DeferredFreeList::for_cache(self.id);
        self.shrink(task, &mut deferred);
        let released = self.drain(task, deferred);
        let stats = self.stats();
        if stats.slabs != 0 {
            error!("BUG: {}: {} slabs remain after shutdown", self.config.name, stats.slabs);
            return Err("KmemCache::shutdown(): slabs remain after releasing all empty slabs");
        }
        info!("{}: shut down, released {} slabs", self.config.name, released);
        Ok(released)
    }

    /// Changes the cache's tunables, returning the values actually applied.
    ///
    /// `cpu_partial` is clamped to `MAX_CPU_PARTIAL`. A CPU holding more frozen
    /// slabs than a lowered `cpu_partial` keeps them until its next unfreeze.
    pub fn set_tunables(&self, tunables: CacheTunables) -> CacheTunables {
        self.tunables.set(self.config.name, tunables)
    }

    pub fn tunables(&self) -> CacheTunables {
        self.tunables.get()
    }

    /// The number of times the tunables have been changed.
    pub fn tunables_generation(&self) -> u32 {
        self.tunables.generation()
    }

    /// Returns the current transaction ID of the given CPU's slab.
    pub fn cpu_tid(&self, cpu: CpuId) -> Option<u64> {
        self.cpu_slabs.get(cpu.index()).map(|slab| slab.lock().tid)
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        let pages_acquired = c.pages_acquired.load(Ordering::Relaxed);
        let pages_released = c.pages_released.load(Ordering::Relaxed);
        CacheStats {
            live_objects: c.live_objects.load(Ordering::Relaxed),
            slabs: pages_acquired.saturating_sub(pages_released) as usize,
            partial_slabs: self.nodes.iter().map(|node| node.lock().nr_partial()).sum(),
            pages_acquired,
            pages_released,
            alloc_fastpath: c.alloc_fastpath.load(Ordering::Relaxed),
            alloc_slowpath: c.alloc_slowpath.load(Ordering::Relaxed),
            free_fastpath: c.free_fastpath.load(Ordering::Relaxed),
            free_slowpath: c.free_slowpath.load(Ordering::Relaxed),
            alloc_redo: c.alloc_redo.load(Ordering::Relaxed),
        }
    }

    /// The number of slabs of the given node that are not pending free.
    pub fn node_slabs(&self, node: NodeId) -> Option<usize> {
        self.nodes.get(node.index()).map(|node| node.lock().nr_slabs())
    }
}

impl fmt::Debug for KmemCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KmemCache")
            .field("name", &self.config.name)
            .field("id", &self.id)
            .field("objects_per_page", &self.objects_per_page)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
