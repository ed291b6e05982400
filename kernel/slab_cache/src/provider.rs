//! The interfaces through which a slab cache obtains and returns physical memory,
//! and reports how much of it is in use.

use core::fmt;
use cpu::NodeId;
use kernel_config::memory::PAGE_SIZE;

/// A run of `2^order` physically-contiguous pages on one NUMA node,
/// as handed out by a [`PageProvider`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PhysPages {
    base: usize,
    node: NodeId,
    order: u32,
}

impl PhysPages {
    pub const fn new(base: usize, node: NodeId, order: u32) -> PhysPages {
        PhysPages { base, node, order }
    }

    /// The starting physical address.
    pub const fn base(&self) -> usize {
        self.base
    }

    pub const fn node(&self) -> NodeId {
        self.node
    }

    pub const fn order(&self) -> u32 {
        self.order
    }

    /// The number of 4KiB pages in this run.
    pub const fn nr_pages(&self) -> usize {
        1 << self.order
    }

    pub const fn size_in_bytes(&self) -> usize {
        PAGE_SIZE << self.order
    }
}

/// The reasons a [`PageProvider`] may fail to supply pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderError {
    /// No free run of the requested order exists on the requested node.
    OutOfMemory,
    /// The requested node or order is not supported by this provider.
    Unsupported,
}

impl From<ProviderError> for &'static str {
    fn from(err: ProviderError) -> &'static str {
        match err {
            ProviderError::OutOfMemory => "out of physical memory",
            ProviderError::Unsupported => "unsupported node or page order",
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg: &'static str = (*self).into();
        f.write_str(msg)
    }
}

/// The physical page allocator that backs a slab cache.
///
/// A slab cache never calls either method from within an atomic section,
/// so implementations are free to take sleeping locks or block.
pub trait PageProvider: Send + Sync {
    /// Allocates `2^order` contiguous pages, preferably on the given `node`.
    fn acquire_pages(&self, node: NodeId, order: u32) -> Result<PhysPages, ProviderError>;

    /// Returns pages previously obtained from [`PageProvider::acquire_pages()`].
    /// This is called exactly once per acquired run.
    fn release_pages(&self, pages: PhysPages);
}

/// Receives notifications about memory usage, e.g., for per-node statistics.
///
/// `delta` is positive when usage grows and negative when it shrinks.
/// Page changes are counted in 4KiB pages.
pub trait Accounting: Send + Sync {
    fn pages_changed(&self, _node: NodeId, _delta: isize) {}
    fn objects_changed(&self, _node: NodeId, _delta: isize) {}
}

/// An [`Accounting`] implementation that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAccounting;

impl Accounting for NoAccounting {}
