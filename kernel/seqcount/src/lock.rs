//! Locks that a [`SeqCount`](crate::SeqCount) can be associated with.

use alloc::sync::Arc;
use spin::{Mutex, RwLock};

/// A lock whose held-ness can be queried by a sequence counter's writers.
///
/// Every writer of a sequence counter must be serialized by some lock;
/// this is the question the counter asks of that lock on each write.
///
/// Note that a spinlock can only report whether it is held by *anyone*,
/// not whether it is held by the current task.
pub trait AssociatedLock {
    /// Returns `true` if this lock is currently held.
    fn is_held(&self) -> bool;
}

impl<T: ?Sized> AssociatedLock for Mutex<T> {
    fn is_held(&self) -> bool {
        self.is_locked()
    }
}

impl<T: ?Sized> AssociatedLock for &Mutex<T> {
    fn is_held(&self) -> bool {
        self.is_locked()
    }
}

impl<T: ?Sized> AssociatedLock for Arc<Mutex<T>> {
    fn is_held(&self) -> bool {
        self.is_locked()
    }
}

/// Writers must hold the lock for writing; a reader does not serialize writers.
impl<T: ?Sized> AssociatedLock for &RwLock<T> {
    fn is_held(&self) -> bool {
        self.writer_count() > 0
    }
}

/// A counter with no associated lock.
///
/// Use this only when writers are serialized by other means,
/// e.g., by only ever being written from one CPU with migration disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoLock;

impl AssociatedLock for NoLock {
    fn is_held(&self) -> bool {
        true
    }
}

/// Associates a counter with a set of partitioned locks,
/// any one of which serializes a given writer.
///
/// This is held if *any* of the locks is held, so it only catches a writer
/// that holds none of them. It cannot tell whether the writer holds
/// the partition lock that actually covers the data it is writing.
#[derive(Debug)]
pub struct AnyHeld<'a, L>(pub &'a [L]);

impl<L: AssociatedLock> AssociatedLock for AnyHeld<'_, L> {
    fn is_held(&self) -> bool {
        self.0.iter().any(AssociatedLock::is_held)
    }
}
