//! Memory-related limits and slab allocator defaults.

use static_assertions::const_assert;

/// The lower 12 bits of an address correspond to the page frame offset.
pub const PAGE_SHIFT: usize = 12;
/// Page size is 4096 bytes, 4KiB pages.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// The maximum number of CPUs that migration control or a slab cache will track.
pub const MAX_CPUS: usize = 256;

/// The maximum number of NUMA memory nodes.
pub const MAX_NUMA_NODES: usize = 64;

/// The largest page order (`2^order` contiguous pages) a slab may span.
pub const MAX_SLAB_ORDER: u32 = 3;

/// Upper bound on the number of objects carved out of a single slab.
///
/// Object indices are stored as `u16`, and the live-object bitmap
/// is sized for this many objects.
pub const MAX_OBJECTS_PER_SLAB: usize = 512;

/// Hard cap on the number of frozen pages a single CPU may hold
/// on its partial list, regardless of the runtime `cpu_partial` tunable.
///
/// Each CPU's partial list is allocated with this capacity up front,
/// so pushing onto it inside an atomic section never allocates.
pub const MAX_CPU_PARTIAL: usize = 32;

/// The default number of frozen partial pages kept per CPU.
pub const DEFAULT_CPU_PARTIAL: usize = 6;

/// The default number of partial pages a node keeps around before
/// empty pages are handed back to the page provider.
pub const DEFAULT_MIN_PARTIAL: usize = 5;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(DEFAULT_CPU_PARTIAL <= MAX_CPU_PARTIAL);
const_assert!(MAX_OBJECTS_PER_SLAB <= u16::MAX as usize);
const_assert!(MAX_OBJECTS_PER_SLAB % 64 == 0);
const_assert!(MAX_CPUS <= u32::MAX as usize);
