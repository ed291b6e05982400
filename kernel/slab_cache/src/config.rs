//! The static configuration of a slab cache.

use kernel_config::memory::{MAX_CPU_PARTIAL, MAX_OBJECTS_PER_SLAB, MAX_SLAB_ORDER, PAGE_SIZE, DEFAULT_CPU_PARTIAL, DEFAULT_MIN_PARTIAL};

/// Describes the objects a [`KmemCache`](crate::KmemCache) hands out
/// and the initial values of its tunables.
///
/// ```ignore
/// let config = CacheConfig::new("dentry", 192).order(1).min_partial(2);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub name: &'static str,
    /// The size in bytes of each object.
    pub object_size: usize,
    /// Each slab spans `2^order` pages.
    pub order: u32,
    pub cpu_partial: usize,
    pub min_partial: usize,
}

impl CacheConfig {
    /// A configuration for order-0 slabs with the default tunables.
    pub const fn new(name: &'static str, object_size: usize) -> CacheConfig {
        CacheConfig {
            name,
            object_size,
            order: 0,
            cpu_partial: DEFAULT_CPU_PARTIAL,
            min_partial: DEFAULT_MIN_PARTIAL,
        }
    }

    pub fn order(mut self, order: u32) -> CacheConfig {
        self.order = order;
        self
    }

    /// Sets how many frozen partial pages each CPU may hold.
    pub fn cpu_partial(mut self, cpu_partial: usize) -> CacheConfig {
        self.cpu_partial = cpu_partial;
        self
    }

    /// Sets how many partial pages each node keeps before
    /// empty pages are handed back to the page provider.
    pub fn min_partial(mut self, min_partial: usize) -> CacheConfig {
        self.min_partial = min_partial;
        self
    }

    /// The size in bytes of one slab.
    pub fn slab_size(&self) -> usize {
        PAGE_SIZE << self.order
    }

    /// The number of objects carved out of each slab.
    pub fn objects_per_page(&self) -> usize {
        if self.object_size == 0 {
            return 0;
        }
        core::cmp::min(self.slab_size() / self.object_size, MAX_OBJECTS_PER_SLAB)
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.object_size == 0 {
            return Err("CacheConfig: object size must be nonzero");
        }
        if self.order > MAX_SLAB_ORDER {
            return Err("CacheConfig: slab order exceeds MAX_SLAB_ORDER");
        }
        if self.objects_per_page() == 0 {
            return Err("CacheConfig: object size is larger than a slab");
        }
        if self.cpu_partial > MAX_CPU_PARTIAL {
            return Err("CacheConfig: cpu_partial exceeds MAX_CPU_PARTIAL");
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn objects_per_page() {
        assert_eq!(CacheConfig::new("64", 64).objects_per_page(), 64);
        assert_eq!(CacheConfig::new("192", 192).order(1).objects_per_page(), 42);
        // Tiny objects are capped by the size of the live-object bitmap.
        assert_eq!(CacheConfig::new("tiny", 1).objects_per_page(), MAX_OBJECTS_PER_SLAB);
    }

    #[test]
    fn validate() {
        assert!(CacheConfig::new("ok", 64).validate().is_ok());
        assert!(CacheConfig::new("zero", 0).validate().is_err());
        assert!(CacheConfig::new("huge", PAGE_SIZE + 1).validate().is_err());
        assert!(CacheConfig::new("huge", PAGE_SIZE + 1).order(1).validate().is_ok());
        assert!(CacheConfig::new("order", 64).order(MAX_SLAB_ORDER + 1).validate().is_err());
        assert!(CacheConfig::new("partial", 64).cpu_partial(MAX_CPU_PARTIAL + 1).validate().is_err());
    }
}
