//! Runtime-adjustable cache parameters.
//!
//! Tunables are changed rarely and read on every slow path,
//! so they are published through a [`SeqCount`] whose writers
//! are serialized by the lock around the master copy.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_config::memory::MAX_CPU_PARTIAL;
use log::warn;
use seqcount::SeqCount;
use spin::Mutex;

/// The runtime-adjustable parameters of a slab cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheTunables {
    /// The maximum number of frozen partial pages each CPU may hold.
    /// Zero disables per-CPU partial lists.
    pub cpu_partial: usize,
    /// The number of partial pages a node keeps before empty pages
    /// are handed back to the page provider.
    pub min_partial: usize,
}

pub(crate) struct Tunables {
    master: Arc<Mutex<CacheTunables>>,
    seq: SeqCount<Arc<Mutex<CacheTunables>>>,
    cpu_partial: AtomicUsize,
    min_partial: AtomicUsize,
}

impl Tunables {
    pub(crate) fn new(initial: CacheTunables) -> Tunables {
        let master = Arc::new(Mutex::new(initial));
        Tunables {
            seq: SeqCount::new(master.clone()),
            master,
            cpu_partial: AtomicUsize::new(initial.cpu_partial),
            min_partial: AtomicUsize::new(initial.min_partial),
        }
    }

    /// Publishes new tunables, clamped to their limits, and returns what was applied.
    pub(crate) fn set(&self, cache_name: &str, requested: CacheTunables) -> CacheTunables {
        let mut applied = requested;
        if applied.cpu_partial > MAX_CPU_PARTIAL {
            warn!("{}: clamping cpu_partial {} to {}", cache_name, applied.cpu_partial, MAX_CPU_PARTIAL);
            applied.cpu_partial = MAX_CPU_PARTIAL;
        }

        let mut master = self.master.lock();
        let _write = self.seq.write();
        self.cpu_partial.store(applied.cpu_partial, Ordering::Relaxed);
        self.min_partial.store(applied.min_partial, Ordering::Relaxed);
        *master = applied;
        applied
    }

    /// Returns a consistent snapshot of the current tunables.
    pub(crate) fn get(&self) -> CacheTunables {
        self.seq.read(|| CacheTunables {
            cpu_partial: self.cpu_partial.load(Ordering::Relaxed),
            min_partial: self.min_partial.load(Ordering::Relaxed),
        })
    }

    /// The number of times the tunables have been changed.
    pub(crate) fn generation(&self) -> u32 {
        self.seq.sequence() / 2
    }
}
