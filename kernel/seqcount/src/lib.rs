//! A sequence counter that knows which lock serializes its writers.
//!
//! Readers never block: they sample the sequence, read the protected data,
//! and retry if a write was in progress or completed in the meantime.
//! Writers must be serialized by an external lock. Each [`SeqCount`] is
//! associated with that lock at construction, and when the `lock_validation`
//! feature is enabled (the default), every write checks that the lock is held
//! and reports the offending call site if it is not.
//!
//! With `lock_validation` disabled, the association is erased at compile time:
//! a `SeqCount` is exactly the size of its `AtomicU32` and writes do no checking.
//!
//! Data read inside a read section may be observed mid-write,
//! so readers must only read it through atomics or by copying it,
//! and must not act on it until [`SeqCount::read_retry()`] returns `false`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod lock;

pub use lock::*;

use cfg_if::cfg_if;
use core::{
    fmt,
    sync::atomic::{fence, AtomicU32, Ordering},
};

cfg_if! {
    if #[cfg(feature = "lock_validation")] {
        use core::panic::Location;
        use log::error;

        /// A sequence counter whose writers must hold the lock `L`.
        pub struct SeqCount<L: AssociatedLock> {
            sequence: AtomicU32,
            lock: L,
        }

        impl<L: AssociatedLock> SeqCount<L> {
            /// Creates a new sequence counter associated with the given `lock`.
            pub const fn new(lock: L) -> SeqCount<L> {
                SeqCount { sequence: AtomicU32::new(0), lock }
            }

            #[track_caller]
            #[inline]
            fn assert_lock_held(&self) {
                if !self.lock.is_held() {
                    let caller = Location::caller();
                    error!("BUG: SeqCount written without holding its associated lock, at {}", caller);
                    panic!("BUG: SeqCount written without holding its associated lock, at {}", caller);
                }
            }
        }
    } else {
        use core::marker::PhantomData;

        /// A sequence counter whose writers must hold the lock `L`.
        ///
        /// Lock validation is disabled, so `L` is not stored.
        pub struct SeqCount<L: AssociatedLock> {
            sequence: AtomicU32,
            _lock: PhantomData<fn() -> L>,
        }

        impl<L: AssociatedLock> SeqCount<L> {
            /// Creates a new sequence counter associated with the given `lock`.
            ///
            /// The lock is forgotten, as it is never checked.
            pub const fn new(lock: L) -> SeqCount<L> {
                core::mem::forget(lock);
                SeqCount { sequence: AtomicU32::new(0), _lock: PhantomData }
            }

            #[inline(always)]
            fn assert_lock_held(&self) { }
        }
    }
}

impl<L: AssociatedLock> SeqCount<L> {
    /// Begins a write section, moving the sequence to the next odd value.
    ///
    /// The caller must hold the associated lock for the whole write section
    /// and must end it with [`SeqCount::end_write()`].
    /// Prefer [`SeqCount::write()`].
    #[track_caller]
    pub fn begin_write(&self) {
        self.assert_lock_held();
        let prev = self.sequence.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev & 1 == 0, "BUG: nested or unbalanced SeqCount write (sequence was {})", prev);
        // Orders the odd sequence before any of the writer's data stores.
        fence(Ordering::Release);
    }

    /// Ends a write section, moving the sequence to the next even value.
    pub fn end_write(&self) {
        let prev = self.sequence.fetch_add(1, Ordering::Release);
        debug_assert!(prev & 1 == 1, "BUG: SeqCount::end_write() without a matching begin_write() (sequence was {})", prev);
    }

    /// Begins a write section that ends when the returned guard is dropped.
    #[track_caller]
    pub fn write(&self) -> SeqWriteGuard<'_, L> {
        self.begin_write();
        SeqWriteGuard { seq: self }
    }

    /// Begins a read section, returning the sequence value to pass to
    /// [`SeqCount::read_retry()`] once the protected data has been read.
    pub fn begin_read(&self) -> u32 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Returns `true` if the read section begun at `start` overlapped a write,
    /// in which case everything read since then must be discarded.
    pub fn read_retry(&self, start: u32) -> bool {
        fence(Ordering::Acquire);
        start & 1 == 1 || self.sequence.load(Ordering::Relaxed) != start
    }

    /// Repeatedly invokes `f` until it runs without overlapping a write,
    /// and returns its result from that run.
    pub fn read<R>(&self, mut f: impl FnMut() -> R) -> R {
        loop {
            let start = self.begin_read();
            if start & 1 == 1 {
                core::hint::spin_loop();
                continue;
            }
            let result = f();
            if !self.read_retry(start) {
                return result;
            }
        }
    }

    /// Returns the raw sequence value, which is odd while a write is in progress.
    pub fn sequence(&self) -> u32 {
        self.sequence.load(Ordering::Relaxed)
    }
}

impl<L: AssociatedLock> fmt::Debug for SeqCount<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeqCount")
            .field("sequence", &self.sequence())
            .finish_non_exhaustive()
    }
}

/// A guard that ends its [`SeqCount`]'s write section when dropped.
///
/// The associated lock must outlive this guard.
#[must_use = "the write section ends as soon as the guard is dropped"]
pub struct SeqWriteGuard<'s, L: AssociatedLock> {
    seq: &'s SeqCount<L>,
}

impl<L: AssociatedLock> Drop for SeqWriteGuard<'_, L> {
    fn drop(&mut self) {
        self.seq.end_write();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use spin::{Mutex, RwLock};
    use std::{
        sync::atomic::{AtomicBool, AtomicU64},
        thread,
    };

    #[test]
    fn write_section_moves_sequence_by_two() {
        let lock = Mutex::new(0u64);
        let seq = SeqCount::new(&lock);
        assert_eq!(seq.sequence(), 0);
        {
            let mut data = lock.lock();
            let _w = seq.write();
            assert_eq!(seq.sequence(), 1);
            *data += 1;
        }
        assert_eq!(seq.sequence(), 2);
        assert!(!seq.read_retry(2));
        assert!(seq.read_retry(0));
        // An odd start always retries.
        assert!(seq.read_retry(3));
    }

    #[test]
    #[cfg(feature = "lock_validation")]
    #[should_panic(expected = "without holding its associated lock")]
    fn write_without_lock_is_reported() {
        let lock = Mutex::new(());
        let seq = SeqCount::new(&lock);
        seq.begin_write();
    }

    #[test]
    #[cfg(feature = "lock_validation")]
    #[should_panic(expected = "without holding its associated lock")]
    fn rwlock_read_guard_does_not_serialize_writers() {
        let lock = RwLock::new(());
        let seq = SeqCount::new(&lock);
        let _reader = lock.read();
        let _w = seq.write();
    }

    static TABLE: Mutex<[u64; 2]> = Mutex::new([0; 2]);
    static TABLE_SEQ: SeqCount<&'static Mutex<[u64; 2]>> = SeqCount::new(&TABLE);

    #[test]
    fn static_counter_in_either_configuration() {
        {
            let mut table = TABLE.lock();
            let _w = TABLE_SEQ.write();
            table[0] += 1;
            table[1] += 1;
        }
        assert_eq!(TABLE_SEQ.sequence(), 2);
        assert!(!TABLE_SEQ.read_retry(2));
    }

    #[test]
    fn rwlock_write_guard_serializes_writers() {
        let lock = RwLock::new(());
        let seq = SeqCount::new(&lock);
        let _writer = lock.write();
        drop(seq.write());
        assert_eq!(seq.sequence(), 2);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "nested or unbalanced")]
    fn nested_write_is_a_bug() {
        let seq = SeqCount::new(NoLock);
        seq.begin_write();
        seq.begin_write();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "without a matching begin_write")]
    fn unbalanced_end_is_a_bug() {
        let seq = SeqCount::new(NoLock);
        seq.end_write();
    }

    /// A partitioned lock only catches writers holding no partition at all.
    #[test]
    fn any_held_accepts_any_partition() {
        let partitions = [Mutex::new(()), Mutex::new(())];
        let seq = SeqCount::new(AnyHeld(&partitions[..]));
        // Holding the "wrong" partition still passes.
        let _p1 = partitions[1].lock();
        drop(seq.write());
        assert_eq!(seq.sequence(), 2);
    }

    #[test]
    #[cfg(feature = "lock_validation")]
    #[should_panic(expected = "without holding its associated lock")]
    fn any_held_catches_missing_lock() {
        let partitions = [Mutex::new(()), Mutex::new(())];
        let seq = SeqCount::new(AnyHeld(&partitions[..]));
        let _w = seq.write();
    }

    #[test]
    #[cfg(not(feature = "lock_validation"))]
    fn unvalidated_counter_is_just_the_sequence() {
        assert_eq!(
            core::mem::size_of::<SeqCount<Arc<Mutex<[u64; 8]>>>>(),
            core::mem::size_of::<AtomicU32>(),
        );
        // Without validation, an unlocked write is not checked.
        let lock = Arc::new(Mutex::new(()));
        let seq = SeqCount::new(lock);
        drop(seq.write());
        assert_eq!(seq.sequence(), 2);
    }

    #[test]
    fn readers_never_observe_torn_writes() {
        const WRITES: u64 = 50_000;
        struct Shared {
            lock: Arc<Mutex<()>>,
            seq: SeqCount<Arc<Mutex<()>>>,
            a: AtomicU64,
            b: AtomicU64,
            done: AtomicBool,
        }
        let lock = Arc::new(Mutex::new(()));
        let shared = Arc::new(Shared {
            seq: SeqCount::new(lock.clone()),
            lock,
            a: AtomicU64::new(0),
            b: AtomicU64::new(0),
            done: AtomicBool::new(false),
        });

        let readers: Vec<_> = (0..3).map(|_| {
            let shared = shared.clone();
            thread::spawn(move || {
                let mut reads = 0u64;
                while !shared.done.load(Ordering::Relaxed) {
                    let (a, b) = shared.seq.read(|| {
                        (shared.a.load(Ordering::Relaxed), shared.b.load(Ordering::Relaxed))
                    });
                    assert_eq!(a, b, "torn read");
                    reads += 1;
                }
                reads
            })
        }).collect();

        for i in 1..=WRITES {
            let _guard = shared.lock.lock();
            let _w = shared.seq.write();
            shared.a.store(i, Ordering::Relaxed);
            shared.b.store(i, Ordering::Relaxed);
        }
        shared.done.store(true, Ordering::Relaxed);

        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(shared.seq.sequence() as u64, WRITES * 2);
        assert_eq!(shared.seq.read(|| shared.b.load(Ordering::Relaxed)), WRITES);
    }
}
