//! The per-task state that migration control and atomic sections act upon.

use core::{
    fmt,
    marker::PhantomData,
    sync::atomic::{AtomicU32, Ordering},
};
use cpu::CpuId;
use derive_more::Display;
use spin::Mutex;

/// A unique identifier for a schedulable task.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TaskId(u64);

impl TaskId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

/// Where a task is running and whether it may be moved from there.
///
/// Both fields live under one lock so that pinning a task
/// and migrating it can never interleave.
#[derive(Debug)]
pub(crate) struct Placement {
    pub(crate) cpu: CpuId,
    pub(crate) migration_depth: u32,
}

/// A schedulable thread as seen by the per-CPU core.
///
/// The scheduler owns the real task structure; this holds only the
/// state that migration control and atomic-section tracking need:
/// the CPU the task is on, its migration-disable nesting depth,
/// and its atomic-section nesting depth.
pub struct Task {
    id: TaskId,
    pub(crate) placement: Mutex<Placement>,
    /// Only ever modified by the task itself.
    atomic_depth: AtomicU32,
}

impl Task {
    /// Creates a task that starts out running on `cpu`, unpinned.
    pub fn new(id: TaskId, cpu: CpuId) -> Task {
        Task {
            id,
            placement: Mutex::new(Placement { cpu, migration_depth: 0 }),
            atomic_depth: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Returns the CPU this task is currently running on.
    ///
    /// If migration is disabled for this task, the returned value
    /// cannot change until migration is enabled again.
    pub fn current_cpu(&self) -> CpuId {
        self.placement.lock().cpu
    }

    /// Returns this task's migration-disable nesting depth.
    pub fn migration_depth(&self) -> u32 {
        self.placement.lock().migration_depth
    }

    /// Returns `true` if this task is currently pinned to its CPU.
    pub fn is_migration_disabled(&self) -> bool {
        self.migration_depth() > 0
    }

    /// Returns `true` if this task is inside an atomic section,
    /// in which it must not block or call into anything that may block.
    pub fn in_atomic(&self) -> bool {
        self.atomic_depth() > 0
    }

    pub fn atomic_depth(&self) -> u32 {
        self.atomic_depth.load(Ordering::Relaxed)
    }

    /// Marks this task as being inside an atomic section
    /// until the returned guard is dropped.
    ///
    /// Atomic sections nest. The task must already have migration disabled,
    /// as an atomic section always operates on one CPU's local state.
    pub fn enter_atomic(&self) -> AtomicSection<'_> {
        debug_assert!(
            self.is_migration_disabled(),
            "BUG: task {} entered an atomic section without disabling migration",
            self.id,
        );
        let prev = self.atomic_depth.fetch_add(1, Ordering::Relaxed);
        if prev == u32::MAX {
            panic!("BUG: Overflow occurred in the atomic-section counter for task {}", self.id);
        }
        AtomicSection { task: self, _not_send: PhantomData }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("placement", &*self.placement.lock())
            .field("atomic_depth", &self.atomic_depth())
            .finish()
    }
}


/// A guard type that marks its task as being in an atomic section
/// for as long as it is held.
///
/// Obtain one with [`Task::enter_atomic()`].
///
/// This type does not implement `Send` because an atomic section
/// belongs to the task that entered it.
pub struct AtomicSection<'t> {
    task: &'t Task,
    _not_send: PhantomData<*const ()>,
}

impl AtomicSection<'_> {
    pub fn task(&self) -> &Task {
        self.task
    }
}

impl Drop for AtomicSection<'_> {
    fn drop(&mut self) {
        let prev = self.task.atomic_depth.fetch_sub(1, Ordering::Relaxed);
        if prev == 0 {
            panic!("BUG: Underflow occurred in the atomic-section counter for task {}", self.task.id);
        }
    }
}
